//! # Activity Evaluator
//!
//! Once per interval every tracked record is run through the Quiet/Busy state
//! machine against the values counted since the previous tick:
//!
//! | state | count | publishes                  | next  |
//! |-------|-------|----------------------------|-------|
//! | Quiet | > 0   | count, activity (Busy)     | Busy  |
//! | Busy  | > 0   | count                      | Busy  |
//! | Busy  | 0     | activity (Quiet)           | Quiet |
//! | Quiet | 0     | nothing                    | Quiet |
//!
//! The counter is reset whenever a count is published, so each count update
//! covers one period only. Decisions and resets happen under the record lock;
//! delivery of the resulting updates is handed to the sink in a spawned task so
//! a slow sink never delays the scan or the next tick. Deliveries run one after
//! another in tick order.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::{oneshot, Notify, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, trace, warn};

use crate::{
    sink::{PropertyUpdate, UpdateSink},
    store::{ActivityState, AggregationStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next_state: ActivityState,
    /// Count to publish, if any.
    pub count: Option<u64>,
    /// Activity to publish, if any.
    pub activity: Option<ActivityState>,
}

pub fn transition(state: ActivityState, period_value_count: u64) -> Transition {
    match (state, period_value_count) {
        (ActivityState::Quiet, 0) => Transition {
            next_state: ActivityState::Quiet,
            count: None,
            activity: None,
        },
        (ActivityState::Quiet, n) => Transition {
            next_state: ActivityState::Busy,
            count: Some(n),
            activity: Some(ActivityState::Busy),
        },
        (ActivityState::Busy, 0) => Transition {
            next_state: ActivityState::Quiet,
            count: None,
            activity: Some(ActivityState::Quiet),
        },
        (ActivityState::Busy, n) => Transition {
            next_state: ActivityState::Busy,
            count: Some(n),
            activity: None,
        },
    }
}

/// Applies one tick to every record in `store` and returns the updates to
/// publish, stamped with `now` (milliseconds since epoch).
pub fn evaluate(store: &AggregationStore, now: i64) -> Vec<PropertyUpdate> {
    let mut updates = Vec::new();
    store.for_each_mut(|record| {
        let step = transition(record.activity_state, record.period_value_count);
        trace!(
            "{}: {} values, {} -> {}",
            record.entity_id,
            record.period_value_count,
            record.activity_state,
            step.next_state
        );
        if let Some(count) = step.count {
            updates.push(PropertyUpdate::new(
                &record.count_property_id,
                now,
                i64::try_from(count).unwrap_or(i64::MAX),
            ));
            record.period_value_count = 0;
        }
        if let Some(activity) = step.activity {
            debug!("{} became {}", record.entity_id, activity);
            updates.push(PropertyUpdate::new(
                &record.activity_property_id,
                now,
                activity.as_value(),
            ));
        }
        record.activity_state = step.next_state;
    });
    updates
}

#[derive(Debug, Clone, PartialEq, strum::Display)]
pub enum EvaluatorStatus {
    Inactive,
    Active,
    Error { message: String },
}

pub struct ActivityEvaluator {
    store: Arc<AggregationStore>,
    sink: Arc<dyn UpdateSink>,
    interval: Duration,
    status: RwLock<EvaluatorStatus>,
    running: AtomicBool,
    stop_signal: Notify,
    // completion of the most recently spawned delivery
    last_delivery: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ActivityEvaluator {
    pub fn new(store: Arc<AggregationStore>, sink: Arc<dyn UpdateSink>, interval: Duration) -> Self {
        Self {
            store,
            sink,
            interval,
            status: RwLock::new(EvaluatorStatus::Inactive),
            running: AtomicBool::new(false),
            stop_signal: Notify::new(),
            last_delivery: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> EvaluatorStatus {
        self.status.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn set_status(&self, status: EvaluatorStatus) {
        let mut current = self.status.write().await;
        if *current != status {
            debug!("Evaluator status: {} -> {}", *current, status);
            *current = status;
        }
    }

    /// Evaluates every record now and hands the updates to the sink without
    /// waiting for delivery. Returns the delivery task, if anything was due.
    ///
    /// The task starts delivering only once the previous tick's delivery has
    /// finished, so updates reach the sink in tick order.
    pub fn tick_once(&self) -> Option<JoinHandle<()>> {
        let updates = evaluate(&self.store, Utc::now().timestamp_millis());
        if updates.is_empty() {
            return None;
        }
        trace!("Tick produced {} updates", updates.len());
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self
            .last_delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(done_rx);
        let sink = self.sink.clone();
        Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                // a dropped sender means the previous task ended abnormally
                if previous.await.is_err() {
                    warn!("Previous delivery did not complete");
                }
            }
            if let Err(e) = sink.deliver(updates).await {
                error!("Failed to deliver activity updates: {}", e);
            }
            let _ = done_tx.send(());
        }))
    }

    /// Runs ticks until [`Self::stop`] is called. Ticks never overlap; a tick
    /// that is due while the previous one is still running is skipped.
    pub async fn start(&self) {
        if self.interval.is_zero() {
            let message = "Evaluation interval must be greater than 0".to_string();
            warn!("{}", message);
            self.set_status(EvaluatorStatus::Error { message }).await;
            return;
        }
        debug!("Evaluator started: every {:?}", self.interval);
        self.running.store(true, Ordering::SeqCst);
        self.set_status(EvaluatorStatus::Active).await;

        let mut interval_timer = tokio::time::interval(self.interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        interval_timer.tick().await;

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    self.tick_once();
                }
                _ = self.stop_signal.notified() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_status(EvaluatorStatus::Inactive).await;
    }

    pub async fn stop(&self) {
        debug!("Evaluator stopping");
        self.running.store(false, Ordering::SeqCst);
        self.stop_signal.notify_one();
        self.set_status(EvaluatorStatus::Inactive).await;
    }
}
