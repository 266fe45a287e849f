//! The poll, publish, acknowledge loop.
//!
//! A [`Relay`] fetches a batch of unsent records, hands each one to its own
//! task (envelope, publish, acknowledge) and sleeps the poll interval without
//! waiting for those tasks. Delivery is at-least-once: a crash between a
//! broker acknowledgement and the mark-sent update republishes the record
//! under a new message id, so consumers dedup on content or tolerate repeats.
//!
//! Fan-out is capped by a semaphore of `max_in_flight` permits. A record whose
//! key is still being delivered by this relay is not fanned out again by a
//! later poll; separate relay processes against one table are not coordinated.
//!
//! A record that cannot be enveloped is remembered for the life of the relay.
//! It stays unsent in the store, so each poll asks for that many extra rows and
//! drops the remembered keys before fanning out.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acknowledger::{Acknowledgement, Acknowledger};
use crate::config::RelayConfig;
use crate::kafka::{DeliveryOutcome, EnvelopeBuilder, MessageSink, Publisher};
use crate::postgres::{Record, RecordKey, StoreGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Running => "running",
            RelayState::Draining => "draining",
            RelayState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub drain_timeout: Duration,
    pub store_backoff: Duration,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size,
            max_in_flight: config.max_in_flight.max(1),
            drain_timeout: config.drain_timeout(),
            store_backoff: config.store_backoff(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    acknowledged: AtomicU64,
    fetch_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub delivered: u64,
    pub failed: u64,
    pub skipped: u64,
    pub acknowledged: u64,
    pub fetch_errors: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Keys of records currently owned by a delivery task.
type InFlight = Arc<Mutex<HashSet<RecordKey>>>;

/// Keys of records rejected by the envelope builder.
type Rejected = Arc<Mutex<HashSet<RecordKey>>>;

/// Releases a record's key when its delivery task ends, aborted or not.
struct InFlightGuard {
    key: RecordKey,
    in_flight: InFlight,
}

impl InFlightGuard {
    fn claim(in_flight: &InFlight, key: RecordKey) -> Option<Self> {
        let mut keys = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        keys.insert(key).then(|| Self {
            key,
            in_flight: in_flight.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut keys = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
    }
}

/// Per-record work shared by every delivery task.
struct Pipeline<S: ?Sized, K: ?Sized> {
    builder: EnvelopeBuilder,
    publisher: Publisher<K>,
    acknowledger: Acknowledger<S>,
    stats: Arc<RelayStats>,
    rejected: Rejected,
}

impl<S, K> Pipeline<S, K>
where
    S: StoreGateway + ?Sized,
    K: MessageSink + ?Sized,
{
    async fn process(&self, record: Record) {
        let envelope = match self.builder.build(&record) {
            Ok(envelope) => envelope,
            Err(e) => {
                RelayStats::add(&self.stats.skipped, 1);
                warn!(key = %record.key, error = %e, "Skipping record that cannot be enveloped");
                self.rejected
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(record.key);
                return;
            }
        };

        let outcome = self.publisher.publish(&envelope).await;
        match &outcome {
            DeliveryOutcome::Delivered { attempts } => {
                RelayStats::add(&self.stats.delivered, 1);
                debug!(
                    key = %record.key,
                    message_id = %envelope.message_id,
                    attempts,
                    "Record delivered"
                );
            }
            DeliveryOutcome::Failed { attempts, error } => {
                RelayStats::add(&self.stats.failed, 1);
                warn!(
                    key = %record.key,
                    message_id = %envelope.message_id,
                    attempts,
                    error = %error,
                    "Delivery failed; record stays pending"
                );
            }
        }

        if self.acknowledger.confirm(&record, &outcome).await == Acknowledgement::Marked {
            RelayStats::add(&self.stats.acknowledged, 1);
        }
    }
}

pub struct Relay<S: ?Sized, K: ?Sized> {
    store: Arc<S>,
    pipeline: Arc<Pipeline<S, K>>,
    settings: RelaySettings,
    stats: Arc<RelayStats>,
    state: watch::Sender<RelayState>,
    in_flight: InFlight,
    rejected: Rejected,
}

impl<S, K> Relay<S, K>
where
    S: StoreGateway + ?Sized + 'static,
    K: MessageSink + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        builder: EnvelopeBuilder,
        publisher: Publisher<K>,
        settings: RelaySettings,
    ) -> Self {
        let stats = Arc::new(RelayStats::default());
        let rejected: Rejected = Arc::new(Mutex::new(HashSet::new()));
        let pipeline = Arc::new(Pipeline {
            builder,
            publisher,
            acknowledger: Acknowledger::new(store.clone()),
            stats: stats.clone(),
            rejected: rejected.clone(),
        });
        let (state, _) = watch::channel(RelayState::Running);

        Self {
            store,
            pipeline,
            settings,
            stats,
            state,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            rejected,
        }
    }

    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Rows to ask the store for: one batch plus every rejected row that may
    /// still sit ahead of it.
    fn fetch_limit(&self) -> usize {
        let rejected = self.rejected.lock().unwrap_or_else(|e| e.into_inner());
        self.settings.batch_size.saturating_add(rejected.len())
    }

    /// Drops rejected records and caps the rest at one batch.
    fn pending(&self, records: Vec<Record>) -> Vec<Record> {
        let rejected = self.rejected.lock().unwrap_or_else(|e| e.into_inner());
        records
            .into_iter()
            .filter(|record| !rejected.contains(&record.key))
            .take(self.settings.batch_size)
            .collect()
    }

    fn set_state(&self, state: RelayState) {
        self.state.send_replace(state);
        info!(state = %state, "Relay state changed");
    }

    /// Runs until `shutdown` is cancelled, then drains in-flight deliveries
    /// for at most the drain timeout.
    pub async fn run(&self, shutdown: CancellationToken) -> StatsSnapshot {
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let mut tasks = JoinSet::new();

        self.set_state(RelayState::Running);
        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            max_in_flight = self.settings.max_in_flight,
            "Relay started"
        );

        'poll: loop {
            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }

            let limit = self.fetch_limit();
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => break 'poll,
                result = self.store.fetch_unprocessed_batch(limit) => result,
            };

            let delay = match fetched.map(|records| self.pending(records)) {
                Ok(records) if records.is_empty() => {
                    debug!("No unprocessed records");
                    self.settings.poll_interval
                }
                Ok(records) => {
                    debug!(count = records.len(), "Fanning out batch");

                    for record in records {
                        let Some(guard) = InFlightGuard::claim(&self.in_flight, record.key) else {
                            debug!(key = %record.key, "Record already in flight");
                            continue;
                        };

                        let permit = tokio::select! {
                            _ = shutdown.cancelled() => break 'poll,
                            permit = permits.clone().acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break 'poll,
                            },
                        };

                        tasks.spawn(deliver(self.pipeline.clone(), record, permit, guard));
                        RelayStats::add(&self.stats.dispatched, 1);
                    }
                    self.settings.poll_interval
                }
                Err(e) => {
                    RelayStats::add(&self.stats.fetch_errors, 1);
                    warn!(
                        error = %e,
                        backoff_ms = self.settings.store_backoff.as_millis() as u64,
                        "Failed to fetch unprocessed records"
                    );
                    self.settings.store_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break 'poll,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.drain(&mut tasks).await;
        self.set_state(RelayState::Stopped);

        let stats = self.stats.snapshot();
        info!(
            dispatched = stats.dispatched,
            delivered = stats.delivered,
            failed = stats.failed,
            skipped = stats.skipped,
            acknowledged = stats.acknowledged,
            fetch_errors = stats.fetch_errors,
            "Relay stopped"
        );
        stats
    }

    async fn drain(&self, tasks: &mut JoinSet<()>) {
        self.set_state(RelayState::Draining);
        info!(
            in_flight = tasks.len(),
            grace_ms = self.settings.drain_timeout.as_millis() as u64,
            "Draining in-flight deliveries"
        );

        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_task_result(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = tasks.len(),
                "Drain grace period elapsed; abandoning in-flight deliveries"
            );
            tasks.shutdown().await;
        }
    }
}

async fn deliver<S, K>(
    pipeline: Arc<Pipeline<S, K>>,
    record: Record,
    _permit: OwnedSemaphorePermit,
    _guard: InFlightGuard,
) where
    S: StoreGateway + ?Sized,
    K: MessageSink + ?Sized,
{
    pipeline.process(record).await;
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Delivery task panicked");
        }
    }
}
