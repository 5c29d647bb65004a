//! Generic pull-consume-transform-publish-ack loop.
//!
//! One `ConsumerService` is instantiated per stage (features, prediction)
//! with its own filter, durable name, transform and destination prefix.
//! Messages are handled one at a time in delivery order; the source message
//! is acked only after the derived message has been published, so a crash
//! in between yields a redelivery rather than a loss.

pub mod provision;
pub mod transform;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Connector, Delivery, FetchOutcome};
use crate::subject::Subject;

pub use provision::{ensure_consumer, ProvisionError, Provisioned};
pub use transform::{decode_records, encode_records, Record, Records, Transform};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Connecting,
    Provisioning,
    Consuming,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Idle => "idle",
            ServiceState::Connecting => "connecting",
            ServiceState::Provisioning => "provisioning",
            ServiceState::Consuming => "consuming",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub stream: String,
    pub consumer: String,
    pub source_filter: Subject,
    pub destination: Subject,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Transformed, published and acked.
    Processed,
    /// Zero rows; acked without publishing.
    Empty,
    /// Decode, transform or publish failed; nak'ed for redelivery.
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub processed: u64,
    pub empty: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    empty: AtomicU64,
    rejected: AtomicU64,
}

pub struct ConsumerService {
    config: ServiceConfig,
    transform: Arc<dyn Transform>,
    state: Mutex<ServiceState>,
    running: AtomicBool,
    broker: RwLock<Option<Arc<dyn Broker>>>,
    counters: Counters,
}

impl ConsumerService {
    pub fn new(config: ServiceConfig, transform: Arc<dyn Transform>) -> Self {
        Self {
            config,
            transform,
            state: Mutex::new(ServiceState::Idle),
            running: AtomicBool::new(false),
            broker: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            empty: self.counters.empty.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, next: ServiceState) {
        let mut state = self.state.lock();
        debug!(consumer = %self.config.consumer, from = %*state, to = %next, "service state change");
        *state = next;
    }

    /// Connects, provisions the durable consumer and consumes until `stop()`
    /// is called or `shutdown` flips to true. Connection and provisioning
    /// failures are returned; per-message failures never are.
    pub async fn run(
        &self,
        connector: &dyn Connector,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.running.store(true, Ordering::Release);
        self.set_state(ServiceState::Connecting);
        let broker = match connector.connect().await {
            Ok(broker) => broker,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.set_state(ServiceState::Stopped);
                return Err(e).context("failed to connect to broker");
            }
        };
        *self.broker.write() = Some(Arc::clone(&broker));

        let result = self.consume(broker.as_ref(), &mut shutdown).await;

        self.stop().await;
        self.set_state(ServiceState::Stopped);
        info!(consumer = %self.config.consumer, stats = ?self.stats(), "consumer service stopped");
        result
    }

    async fn consume(
        &self,
        broker: &dyn Broker,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let cfg = &self.config;
        self.set_state(ServiceState::Provisioning);
        ensure_consumer(broker, &cfg.stream, &cfg.consumer, &cfg.source_filter).await?;
        let mut subscription = broker
            .pull_subscribe(&cfg.stream, cfg.source_filter.as_str(), &cfg.consumer)
            .await
            .context("failed to open pull subscription")?;

        self.set_state(ServiceState::Consuming);
        info!(
            stream = %cfg.stream,
            consumer = %cfg.consumer,
            filter = %cfg.source_filter,
            destination = %cfg.destination,
            transform = self.transform.name(),
            "consuming"
        );

        // Shutdown is observed between fetches; a fetch already in flight
        // completes or times out and its messages are settled first.
        while self.is_running() && !*shutdown.borrow() {
            match subscription.fetch(1, cfg.fetch_timeout).await {
                Ok(FetchOutcome::Timeout) => continue,
                Ok(FetchOutcome::Messages(messages)) => {
                    for msg in messages {
                        self.handle(broker, msg.as_ref()).await;
                    }
                }
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    warn!(consumer = %cfg.consumer, error = %e, "fetch failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(FETCH_RETRY_DELAY) => {}
                        Ok(()) = shutdown.changed() => {}
                    }
                }
            }
        }
        if *shutdown.borrow() {
            info!(consumer = %cfg.consumer, "shutdown requested");
        }
        Ok(())
    }

    pub async fn handle(&self, broker: &dyn Broker, msg: &dyn Delivery) -> Handled {
        let consumer = self.config.consumer.clone();
        match self.process(broker, msg).await {
            Ok(outcome) => {
                if let Err(e) = msg.ack().await {
                    warn!(subject = msg.subject(), error = %e, "failed to ack message");
                }
                let counter = match outcome {
                    Handled::Empty => &self.counters.empty,
                    _ => &self.counters.processed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("neural_trade_messages_acked_total", "consumer" => consumer).increment(1);
                outcome
            }
            Err(e) => {
                error!(
                    consumer = %consumer,
                    subject = msg.subject(),
                    delivered = msg.info().delivered,
                    error = %e,
                    "failed to process message"
                );
                if let Err(e) = msg.nak().await {
                    warn!(error = %e, "failed to nak message");
                }
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("neural_trade_messages_nacked_total", "consumer" => consumer).increment(1);
                Handled::Rejected
            }
        }
    }

    async fn process(&self, broker: &dyn Broker, msg: &dyn Delivery) -> anyhow::Result<Handled> {
        let records = decode_records(msg.payload()).context("payload is not a record array")?;
        if records.is_empty() {
            debug!(subject = msg.subject(), "empty message, acknowledging without processing");
            return Ok(Handled::Empty);
        }
        let subject = Subject::parse(msg.subject())?;
        let key = subject.last_token();
        let out = self.transform.apply(key, records).await?;
        let target = self.config.destination.child(key)?;
        broker.publish(target.as_str(), out).await?;
        debug!(from = %subject, to = %target, "published derived message");
        Ok(Handled::Processed)
    }

    /// Stops consuming and closes the broker connection. The loop returns at
    /// its next iteration boundary.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.set_state(ServiceState::Stopping);
        }
        let broker = self.broker.write().take();
        if let Some(broker) = broker {
            if let Err(e) = broker.close().await {
                warn!(error = %e, "error closing broker connection");
            }
        }
    }
}
