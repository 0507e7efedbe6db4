use std::{sync::Arc, time::Duration};

use activity_processor::{
    bus::{memory::InMemoryBus, BusClient, BusMessage, MessageStream, SubscribeOptions, TopicPartition},
    config::{BusConfig, ProcessorConfig},
    processor::Processor,
    registry::{MockRegistry, RegistryError},
    store::ActivityState,
};
use chrono::Utc;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn registry() -> MockRegistry {
    let mut registry = MockRegistry::new();
    registry
        .expect_create_property()
        .times(2)
        .returning(|p| Ok(format!("{}-{}", p.entity_id, p.kind).to_lowercase()));
    registry
        .expect_read_entity()
        .returning(|id| Err(RegistryError::NotFound(id.to_string())));
    registry
}

async fn started(bus: Arc<InMemoryBus>) -> Processor {
    let config = ProcessorConfig {
        // ticks are driven by hand
        evaluation_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let processor = Processor::new(config, bus.clone(), Arc::new(registry())).unwrap();
    processor.start().await.unwrap();
    // router subscribed to things, properties and values
    wait_until(|| bus.subscribers_size("things") == 1).await;
    processor
}

async fn output(bus: &InMemoryBus) -> MessageStream {
    bus.subscribe(
        vec![TopicPartition::new("values", 0)],
        SubscribeOptions::from(&BusConfig::default()),
    )
    .await
    .unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn send(bus: &InMemoryBus, topic: &str, key: Option<&str>, payload: &str) {
    bus.deliver(BusMessage::new(topic, key, payload)).unwrap();
}

/// Reads published updates for the given derived properties as
/// `(property, timestamp, value)` until `count` were seen.
async fn updates_for(
    stream: &mut MessageStream,
    properties: &[&str],
    count: usize,
) -> Vec<(String, i64, i64)> {
    let mut seen = Vec::new();
    while seen.len() < count {
        let message = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("update not published")
            .unwrap()
            .unwrap();
        let Some(key) = message.key.clone() else {
            continue;
        };
        if !properties.contains(&key.as_str()) {
            continue;
        }
        let points: Vec<(i64, i64)> = serde_json::from_slice(&message.value).unwrap();
        assert_eq!(points.len(), 1);
        seen.push((key, points[0].0, points[0].1));
    }
    seen
}

async fn track_t1(bus: &InMemoryBus, processor: &Processor) {
    send(bus, "things", Some("t1"), r#"{"id":"t1"}"#);
    wait_until(|| processor.store().contains("t1")).await;
    send(
        bus,
        "properties",
        Some("p1"),
        r#"{"id":"p1","entityId":"t1","name":"Temperature"}"#,
    );
    wait_until(|| processor.store().is_indexed("p1")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_tick_publishes_count_and_activity() {
    let bus = Arc::new(InMemoryBus::new(256));
    let processor = started(bus.clone()).await;
    let mut published = output(&bus).await;
    track_t1(&bus, &processor).await;

    // registry announces the derived properties; they must not be indexed
    send(
        &bus,
        "properties",
        None,
        r#"{"id":"t1-count","entityId":"t1","name":"Data Count"}"#,
    );
    for rows in ["[[1,1],[2,2]]", "[[3,1],[4,1],[5,1],[6,1],[7,1]]", "[[8,1]]"] {
        send(&bus, "values", Some("p1"), rows);
    }
    wait_until(|| {
        processor
            .store()
            .snapshot("t1")
            .is_some_and(|r| r.period_value_count == 8)
    })
    .await;

    let before = Utc::now().timestamp_millis();
    processor.evaluator().tick_once().unwrap().await.unwrap();
    let after = Utc::now().timestamp_millis();

    let mut updates = updates_for(&mut published, &["t1-count", "t1-class"], 2).await;
    updates.sort();
    assert_eq!(updates[0].0, "t1-class");
    assert_eq!(updates[0].2, ActivityState::Busy.as_value());
    assert_eq!(updates[1].0, "t1-count");
    assert_eq!(updates[1].2, 8);
    for (_, timestamp, _) in &updates {
        assert!((before..=after).contains(timestamp));
    }

    let record = processor.store().snapshot("t1").unwrap();
    assert_eq!(record.activity_state, ActivityState::Busy);
    assert_eq!(record.period_value_count, 0);
    assert!(!processor.store().is_indexed("t1-count"));

    processor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_busy_entity_turns_quiet() {
    let bus = Arc::new(InMemoryBus::new(256));
    let processor = started(bus.clone()).await;
    let mut published = output(&bus).await;
    track_t1(&bus, &processor).await;

    send(&bus, "values", Some("p1"), "[[1,1]]");
    wait_until(|| {
        processor
            .store()
            .snapshot("t1")
            .is_some_and(|r| r.period_value_count == 1)
    })
    .await;
    processor.evaluator().tick_once().unwrap().await.unwrap();
    updates_for(&mut published, &["t1-count", "t1-class"], 2).await;

    // the counter echo of our own update must not have been counted
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        processor.store().snapshot("t1").unwrap().period_value_count,
        0
    );

    processor.evaluator().tick_once().unwrap().await.unwrap();
    let updates = updates_for(&mut published, &["t1-count", "t1-class"], 1).await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "t1-class");
    assert_eq!(updates[0].2, ActivityState::Quiet.as_value());
    assert_eq!(
        processor.store().snapshot("t1").unwrap().activity_state,
        ActivityState::Quiet
    );

    // quiet and idle: nothing to publish
    assert!(processor.evaluator().tick_once().is_none());

    processor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_values_before_property_are_dropped() {
    let bus = Arc::new(InMemoryBus::new(256));
    let processor = started(bus.clone()).await;
    track_t1(&bus, &processor).await;

    send(&bus, "values", Some("p9"), "[[1,1],[2,2],[3,3]]");
    // malformed messages are dropped without stopping the router
    send(&bus, "values", Some("p9"), "{not json");
    send(
        &bus,
        "properties",
        Some("p9"),
        r#"{"id":"p9","entityId":"t1","name":"Humidity"}"#,
    );
    wait_until(|| processor.store().is_indexed("p9")).await;
    assert_eq!(
        processor.store().snapshot("t1").unwrap().period_value_count,
        0
    );

    send(&bus, "values", Some("p9"), "[[4,4],[5,5]]");
    wait_until(|| {
        processor
            .store()
            .snapshot("t1")
            .is_some_and(|r| r.period_value_count == 2)
    })
    .await;

    processor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_property_of_unknown_entity_provisions_it() {
    let bus = Arc::new(InMemoryBus::new(256));
    let processor = started(bus.clone()).await;

    send(
        &bus,
        "properties",
        Some("p1"),
        r#"{"id":"p1","entityId":"t1","name":"Temperature"}"#,
    );
    // the thing event arrives late and must not provision a second time
    send(&bus, "things", Some("t1"), r#"{"id":"t1"}"#);
    wait_until(|| processor.store().contains("t1")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let record = processor.store().snapshot("t1").unwrap();
    assert_eq!(record.count_property_id, "t1-count");
    assert_eq!(record.activity_property_id, "t1-class");
    assert_eq!(processor.store().len(), 1);

    processor.shutdown().await.unwrap();
}
