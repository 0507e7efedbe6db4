use std::sync::Arc;

use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    bus::{BusClient, SubscribeOptions, TopicPartition},
    config::{ProcessorConfig, UpdateTarget},
    evaluator::ActivityEvaluator,
    publisher::OutboundPublisher,
    registrar::Registrar,
    registry::Registry,
    router::EventRouter,
    sink::{BusUpdateSink, RegistryUpdateSink, UpdateSink},
    store::AggregationStore,
    ProcessorResult,
};

/// The running processor: one store shared by the router (bus side) and the
/// evaluator (ticker side).
pub struct Processor {
    config: ProcessorConfig,
    bus: Arc<dyn BusClient>,
    store: Arc<AggregationStore>,
    router: Arc<EventRouter>,
    evaluator: Arc<ActivityEvaluator>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        bus: Arc<dyn BusClient>,
        registry: Arc<dyn Registry>,
    ) -> ProcessorResult<Self> {
        config.validate()?;

        let store = Arc::new(AggregationStore::new());
        let registrar = Arc::new(Registrar::new(registry.clone(), store.clone()));
        let router = Arc::new(EventRouter::new(registrar, config.bus.topics.clone()));

        let sink: Arc<dyn UpdateSink> = match config.update_target {
            UpdateTarget::Bus => Arc::new(BusUpdateSink::new(
                OutboundPublisher::with_chunk_size(bus.clone(), config.publish_chunk_size),
                &config.bus.topics.values,
            )),
            UpdateTarget::Registry => Arc::new(RegistryUpdateSink::new(registry)),
        };
        let evaluator = Arc::new(ActivityEvaluator::new(
            store.clone(),
            sink,
            config.evaluation_interval,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            bus,
            store,
            router,
            evaluator,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn evaluator(&self) -> &Arc<ActivityEvaluator> {
        &self.evaluator
    }

    pub fn subscriptions(&self) -> Vec<TopicPartition> {
        let topics = &self.config.bus.topics;
        [&topics.things, &topics.properties, &topics.values]
            .into_iter()
            .map(|name| TopicPartition::new(name, self.config.bus.partition))
            .collect()
    }

    /// Subscribes to the input topics, then spawns the router loop and the
    /// evaluator. Returns once both are running.
    pub async fn start(&self) -> ProcessorResult<()> {
        let stream = self
            .bus
            .subscribe(
                self.subscriptions(),
                SubscribeOptions::from(&self.config.bus),
            )
            .await?;

        let router = self.router.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let router_task = tokio::spawn(async move { router.run(stream, shutdown_rx).await });

        let evaluator = self.evaluator.clone();
        let evaluator_task = tokio::spawn(async move { evaluator.start().await });

        self.tasks.lock().await.extend([router_task, evaluator_task]);
        info!(
            "Processor started (interval: {:?}, updates via {})",
            self.config.evaluation_interval, self.config.update_target
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> ProcessorResult<()> {
        debug!("Processor shutting down");
        // no receivers left just means the router already stopped
        let _ = self.shutdown_tx.send(());
        self.evaluator.stop().await;

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Processor task ended abnormally: {}", e);
            }
        }
        info!("Processor stopped ({} entities tracked)", self.store.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::MockBusClient, registry::MockRegistry, Error};
    use std::time::Duration;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ProcessorConfig {
            evaluation_interval: Duration::ZERO,
            ..Default::default()
        };
        let result = Processor::new(
            config,
            Arc::new(MockBusClient::new()),
            Arc::new(MockRegistry::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_subscriptions_follow_config() {
        let mut config = ProcessorConfig::default();
        config.bus.partition = 2;
        config.bus.topics.values = "raw-values".to_string();
        let processor = Processor::new(
            config,
            Arc::new(MockBusClient::new()),
            Arc::new(MockRegistry::new()),
        )
        .unwrap();

        assert_eq!(
            processor.subscriptions(),
            vec![
                TopicPartition::new("things", 2),
                TopicPartition::new("properties", 2),
                TopicPartition::new("raw-values", 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_propagates_subscribe_failure() {
        let mut bus = MockBusClient::new();
        bus.expect_subscribe().times(1).returning(|_, _| {
            Err(crate::bus::BusError::ConnectionFailed {
                message: "no brokers".to_string(),
            })
        });
        let processor = Processor::new(
            ProcessorConfig::default(),
            Arc::new(bus),
            Arc::new(MockRegistry::new()),
        )
        .unwrap();

        assert!(matches!(processor.start().await, Err(Error::Bus(_))));
        assert!(processor.shutdown().await.is_ok());
    }
}
