//! Broker surface the pipeline talks to: durable streams with pull consumers
//! and a versioned object store with change-watch.
//!
//! Every stage coordinates exclusively through these traits. `memory` is an
//! in-process implementation with the same delivery semantics, `nats` (behind
//! the `nats` feature) drives a real JetStream server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::{MemoryBroker, MemoryConnector};

/// Default time a delivered message may stay unacknowledged before the
/// broker hands it out again.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to {url}: {reason}")]
    Connection { url: String, reason: String },
    #[error("consumer `{consumer}` not found on stream `{stream}`")]
    ConsumerNotFound { stream: String, consumer: String },
    #[error("consumer `{consumer}` already exists on stream `{stream}` with a different config")]
    ConsumerExists { stream: String, consumer: String },
    #[error("stream `{0}` not found")]
    StreamNotFound(String),
    #[error("no stream captures subject `{0}`")]
    NoStreamForSubject(String),
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("object `{object}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, object: String },
    #[error("message already acknowledged")]
    AlreadyAcked,
    #[error("connection closed")]
    Closed,
    #[error("broker request failed: {0}")]
    Request(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::ConsumerNotFound { .. })
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Replay everything the stream holds.
    All,
    /// Only messages published after the consumer was created.
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    /// Durable, explicit-ack consumer that skips the stream's backlog.
    pub fn durable_new(name: &str, filter_subject: &str) -> Self {
        Self {
            durable_name: name.to_string(),
            filter_subject: filter_subject.to_string(),
            deliver_policy: DeliverPolicy::New,
            ack_policy: AckPolicy::Explicit,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream: String,
    pub name: String,
    pub config: ConsumerConfig,
    pub num_ack_pending: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub stream_sequence: u64,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivered: u64,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;
    fn payload(&self) -> &[u8];
    fn info(&self) -> DeliveryInfo;
    async fn ack(&self) -> BrokerResult<()>;
    /// Negative acknowledgment: schedule the message for redelivery.
    async fn nak(&self) -> BrokerResult<()>;
}

pub enum FetchOutcome {
    Messages(Vec<Box<dyn Delivery>>),
    Timeout,
}

#[async_trait]
pub trait PullSubscription: Send {
    async fn fetch(&mut self, max_messages: usize, timeout: Duration) -> BrokerResult<FetchOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub size: usize,
    pub deleted: bool,
}

pub enum WatchOutcome {
    Event(ObjectInfo),
    Timeout,
}

#[async_trait]
pub trait ObjectWatcher: Send {
    async fn next_update(&mut self, timeout: Duration) -> BrokerResult<WatchOutcome>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;
    async fn list(&self) -> BrokerResult<Vec<ObjectInfo>>;
    async fn get(&self, name: &str) -> BrokerResult<Vec<u8>>;
    async fn put(&self, name: &str, data: Vec<u8>) -> BrokerResult<ObjectInfo>;
    async fn delete(&self, name: &str) -> BrokerResult<()>;
    async fn watch(&self, include_history: bool) -> BrokerResult<Box<dyn ObjectWatcher>>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<PublishAck>;
    async fn consumer_info(&self, stream: &str, consumer: &str) -> BrokerResult<ConsumerInfo>;
    async fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> BrokerResult<ConsumerInfo>;
    async fn pull_subscribe(
        &self,
        stream: &str,
        filter_subject: &str,
        durable: &str,
    ) -> BrokerResult<Box<dyn PullSubscription>>;
    async fn object_store(&self, bucket: &str) -> BrokerResult<Arc<dyn ObjectStore>>;
    async fn create_object_store(&self, bucket: &str) -> BrokerResult<Arc<dyn ObjectStore>>;
    /// Flushes outstanding publishes and rejects further calls on this
    /// session with `BrokerError::Closed`. Idempotent.
    async fn close(&self) -> BrokerResult<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn Broker>>;
}
