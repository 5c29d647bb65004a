//! In-process broker with JetStream-like delivery semantics.
//!
//! State lives behind a `parking_lot` mutex that is never held across an
//! await point.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    Broker, BrokerError, BrokerResult, Connector, ConsumerConfig, ConsumerInfo, DeliverPolicy,
    Delivery, DeliveryInfo, FetchOutcome, ObjectInfo, ObjectStore, ObjectWatcher, PublishAck,
    PullSubscription, WatchOutcome,
};
use crate::subject::Subject;

const WATCH_CHANNEL_CAPACITY: usize = 256;

struct StoredMessage {
    seq: u64,
    subject: Subject,
    payload: Vec<u8>,
}

struct Pending {
    deadline: Instant,
    delivered: u64,
    queued: bool,
}

struct ConsumerState {
    config: ConsumerConfig,
    filter: Subject,
    next_seq: u64,
    pending: BTreeMap<u64, Pending>,
    redeliver: VecDeque<u64>,
    acks: u64,
    naks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStats {
    pub acks: u64,
    pub naks: u64,
    pub ack_pending: usize,
}

struct StreamState {
    subjects: Vec<Subject>,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn last_seq(&self) -> u64 {
        self.messages.last().map(|m| m.seq).unwrap_or(0)
    }

    fn captures(&self, subject: &Subject) -> bool {
        self.subjects.iter().any(|f| subject.matches(f))
    }
}

struct StoredObject {
    data: Vec<u8>,
    deleted: bool,
}

struct BucketState {
    objects: BTreeMap<String, StoredObject>,
    events: broadcast::Sender<ObjectInfo>,
}

impl BucketState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self { objects: BTreeMap::new(), events }
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
    buckets: HashMap<String, BucketState>,
}

struct Shared {
    state: Mutex<State>,
    // Signalled whenever a message becomes deliverable (publish or nak).
    deliverable: Notify,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
}

/// Handle to an in-process broker. Clones share the same streams and buckets.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                deliverable: Notify::new(),
                sessions_opened: AtomicU64::new(0),
                sessions_closed: AtomicU64::new(0),
            }),
        }
    }

    /// Declares a stream capturing every subject matched by `subjects`.
    pub fn add_stream(&self, name: &str, subjects: &[&str]) -> BrokerResult<()> {
        let subjects = subjects
            .iter()
            .map(|s| Subject::parse(s).map_err(|e| BrokerError::Request(e.to_string())))
            .collect::<BrokerResult<Vec<_>>>()?;
        let mut state = self.shared.state.lock();
        state.streams.entry(name.to_string()).or_insert_with(|| StreamState {
            subjects,
            messages: Vec::new(),
            consumers: HashMap::new(),
        });
        Ok(())
    }

    pub fn session(&self) -> Arc<MemorySession> {
        self.shared.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemorySession {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { broker: Some(self.clone()), url: "memory://local".to_string() }
    }

    pub fn stream_messages(&self, stream: &str) -> Vec<(String, Vec<u8>)> {
        let state = self.shared.state.lock();
        state
            .streams
            .get(stream)
            .map(|s| {
                s.messages
                    .iter()
                    .map(|m| (m.subject.to_string(), m.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Payloads published on exactly `subject`, across all streams.
    pub fn messages_on(&self, subject: &str) -> Vec<Vec<u8>> {
        let state = self.shared.state.lock();
        state
            .streams
            .values()
            .flat_map(|s| s.messages.iter())
            .filter(|m| m.subject.as_str() == subject)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn consumer_names(&self, stream: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut names: Vec<String> = state
            .streams
            .get(stream)
            .map(|s| s.consumers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn consumer_stats(&self, stream: &str, consumer: &str) -> Option<ConsumerStats> {
        let state = self.shared.state.lock();
        let c = state.streams.get(stream)?.consumers.get(consumer)?;
        Some(ConsumerStats { acks: c.acks, naks: c.naks, ack_pending: c.pending.len() })
    }

    pub fn sessions_opened(&self) -> u64 {
        self.shared.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.shared.sessions_closed.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    broker: Option<MemoryBroker>,
    url: String,
}

impl MemoryConnector {
    pub fn unreachable(url: &str) -> Self {
        Self { broker: None, url: url.to_string() }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn Broker>> {
        match &self.broker {
            Some(broker) => Ok(broker.session() as Arc<dyn Broker>),
            None => Err(BrokerError::Connection {
                url: self.url.clone(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

pub struct MemorySession {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

fn consumer_info(stream: &str, name: &str, c: &ConsumerState) -> ConsumerInfo {
    ConsumerInfo {
        stream: stream.to_string(),
        name: name.to_string(),
        config: c.config.clone(),
        num_ack_pending: c.pending.len() as u64,
    }
}

#[async_trait]
impl Broker for MemorySession {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<PublishAck> {
        self.ensure_open()?;
        let subject =
            Subject::parse(subject).map_err(|e| BrokerError::Request(e.to_string()))?;
        if subject.is_wildcard() {
            return Err(BrokerError::Request(format!("cannot publish to wildcard `{subject}`")));
        }
        let ack = {
            let mut state = self.shared.state.lock();
            let (name, stream) = state
                .streams
                .iter_mut()
                .find(|(_, s)| s.captures(&subject))
                .ok_or_else(|| BrokerError::NoStreamForSubject(subject.to_string()))?;
            let seq = stream.last_seq() + 1;
            trace!(stream = %name, seq, %subject, "stored message");
            stream.messages.push(StoredMessage { seq, subject, payload });
            PublishAck { stream: name.clone(), sequence: seq }
        };
        self.shared.deliverable.notify_waiters();
        Ok(ack)
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> BrokerResult<ConsumerInfo> {
        self.ensure_open()?;
        let state = self.shared.state.lock();
        let s = state
            .streams
            .get(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let c = s.consumers.get(consumer).ok_or_else(|| BrokerError::ConsumerNotFound {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
        })?;
        Ok(consumer_info(stream, consumer, c))
    }

    async fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> BrokerResult<ConsumerInfo> {
        self.ensure_open()?;
        let filter = Subject::parse(&config.filter_subject)
            .map_err(|e| BrokerError::Request(e.to_string()))?;
        let mut state = self.shared.state.lock();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let name = config.durable_name.clone();
        if let Some(existing) = s.consumers.get(&name) {
            // Identical re-creation is accepted, like JetStream's idempotent create.
            if existing.config == config {
                return Ok(consumer_info(stream, &name, existing));
            }
            return Err(BrokerError::ConsumerExists {
                stream: stream.to_string(),
                consumer: name,
            });
        }
        let next_seq = match config.deliver_policy {
            DeliverPolicy::All => 1,
            DeliverPolicy::New => s.last_seq() + 1,
        };
        debug!(stream, consumer = %name, next_seq, "created durable consumer");
        s.consumers.insert(
            name.clone(),
            ConsumerState {
                config,
                filter,
                next_seq,
                pending: BTreeMap::new(),
                redeliver: VecDeque::new(),
                acks: 0,
                naks: 0,
            },
        );
        let created = &s.consumers[&name];
        Ok(consumer_info(stream, &name, created))
    }

    async fn pull_subscribe(
        &self,
        stream: &str,
        filter_subject: &str,
        durable: &str,
    ) -> BrokerResult<Box<dyn PullSubscription>> {
        self.ensure_open()?;
        let state = self.shared.state.lock();
        let s = state
            .streams
            .get(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let c = s.consumers.get(durable).ok_or_else(|| BrokerError::ConsumerNotFound {
            stream: stream.to_string(),
            consumer: durable.to_string(),
        })?;
        if c.config.filter_subject != filter_subject {
            return Err(BrokerError::Request(format!(
                "consumer `{durable}` filters `{}`, not `{filter_subject}`",
                c.config.filter_subject
            )));
        }
        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&self.closed),
            stream: stream.to_string(),
            consumer: durable.to_string(),
        }))
    }

    async fn object_store(&self, bucket: &str) -> BrokerResult<Arc<dyn ObjectStore>> {
        self.ensure_open()?;
        let state = self.shared.state.lock();
        if !state.buckets.contains_key(bucket) {
            return Err(BrokerError::BucketNotFound(bucket.to_string()));
        }
        Ok(Arc::new(MemoryObjectStore {
            shared: Arc::clone(&self.shared),
            bucket: bucket.to_string(),
        }))
    }

    async fn create_object_store(&self, bucket: &str) -> BrokerResult<Arc<dyn ObjectStore>> {
        self.ensure_open()?;
        {
            let mut state = self.shared.state.lock();
            state.buckets.entry(bucket.to_string()).or_insert_with(BucketState::new);
        }
        Ok(Arc::new(MemoryObjectStore {
            shared: Arc::clone(&self.shared),
            bucket: bucket.to_string(),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.sessions_closed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    stream: String,
    consumer: String,
}

impl MemorySubscription {
    /// Takes up to `max` deliverable messages; also reports the earliest
    /// pending deadline so the caller knows when to look again.
    fn take(&self, max: usize, now: Instant) -> BrokerResult<(Vec<Box<dyn Delivery>>, Option<Instant>)> {
        let mut state = self.shared.state.lock();
        let s = state
            .streams
            .get_mut(&self.stream)
            .ok_or_else(|| BrokerError::StreamNotFound(self.stream.clone()))?;
        let StreamState { messages, consumers, .. } = s;
        let c = consumers.get_mut(&self.consumer).ok_or_else(|| BrokerError::ConsumerNotFound {
            stream: self.stream.clone(),
            consumer: self.consumer.clone(),
        })?;

        for (seq, p) in c.pending.iter_mut() {
            if !p.queued && p.deadline <= now {
                p.queued = true;
                c.redeliver.push_back(*seq);
            }
        }

        let ack_wait = c.config.ack_wait;
        let mut out: Vec<Box<dyn Delivery>> = Vec::new();
        while out.len() < max {
            let Some(seq) = c.redeliver.pop_front() else { break };
            let Some(p) = c.pending.get_mut(&seq) else { continue };
            p.queued = false;
            p.delivered += 1;
            p.deadline = now + ack_wait;
            let delivered = p.delivered;
            if let Ok(idx) = messages.binary_search_by_key(&seq, |m| m.seq) {
                out.push(self.delivery(&messages[idx], delivered));
            }
        }
        while out.len() < max {
            let next = messages
                .iter()
                .find(|m| m.seq >= c.next_seq && m.subject.matches(&c.filter));
            let Some(msg) = next else { break };
            c.next_seq = msg.seq + 1;
            c.pending.insert(msg.seq, Pending { deadline: now + ack_wait, delivered: 1, queued: false });
            out.push(self.delivery(msg, 1));
        }

        let earliest = c.pending.values().filter(|p| !p.queued).map(|p| p.deadline).min();
        Ok((out, earliest))
    }

    fn delivery(&self, msg: &StoredMessage, delivered: u64) -> Box<dyn Delivery> {
        Box::new(MemoryDelivery {
            shared: Arc::clone(&self.shared),
            stream: self.stream.clone(),
            consumer: self.consumer.clone(),
            subject: msg.subject.to_string(),
            payload: msg.payload.clone(),
            info: DeliveryInfo { stream_sequence: msg.seq, delivered },
            settled: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PullSubscription for MemorySubscription {
    async fn fetch(&mut self, max_messages: usize, timeout: Duration) -> BrokerResult<FetchOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }
            let notified = self.shared.deliverable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (batch, earliest) = self.take(max_messages.max(1), now)?;
            if !batch.is_empty() {
                return Ok(FetchOutcome::Messages(batch));
            }
            if now >= deadline {
                return Ok(FetchOutcome::Timeout);
            }
            let wake_at = earliest.map_or(deadline, |e| e.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

struct MemoryDelivery {
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
    subject: String,
    payload: Vec<u8>,
    info: DeliveryInfo,
    settled: AtomicBool,
}

impl MemoryDelivery {
    fn settle<F>(&self, apply: F) -> BrokerResult<()>
    where
        F: FnOnce(&mut ConsumerState, u64),
    {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadyAcked);
        }
        let mut state = self.shared.state.lock();
        let c = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.consumer))
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: self.stream.clone(),
                consumer: self.consumer.clone(),
            })?;
        apply(c, self.info.stream_sequence);
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn info(&self) -> DeliveryInfo {
        self.info.clone()
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.settle(|c, seq| {
            c.pending.remove(&seq);
            c.acks += 1;
        })
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.settle(|c, seq| {
            if let Some(p) = c.pending.get_mut(&seq) {
                if !p.queued {
                    p.queued = true;
                    c.redeliver.push_back(seq);
                }
            }
            c.naks += 1;
        })?;
        self.shared.deliverable.notify_waiters();
        Ok(())
    }
}

struct MemoryObjectStore {
    shared: Arc<Shared>,
    bucket: String,
}

impl MemoryObjectStore {
    fn with_bucket<T>(&self, f: impl FnOnce(&mut BucketState) -> BrokerResult<T>) -> BrokerResult<T> {
        let mut state = self.shared.state.lock();
        let bucket = state
            .buckets
            .get_mut(&self.bucket)
            .ok_or_else(|| BrokerError::BucketNotFound(self.bucket.clone()))?;
        f(bucket)
    }

    fn info(&self, name: &str, obj: &StoredObject) -> ObjectInfo {
        ObjectInfo {
            bucket: self.bucket.clone(),
            name: name.to_string(),
            size: obj.data.len(),
            deleted: obj.deleted,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self) -> BrokerResult<Vec<ObjectInfo>> {
        self.with_bucket(|b| {
            Ok(b.objects.iter().map(|(name, obj)| self.info(name, obj)).collect())
        })
    }

    async fn get(&self, name: &str) -> BrokerResult<Vec<u8>> {
        self.with_bucket(|b| match b.objects.get(name) {
            Some(obj) if !obj.deleted => Ok(obj.data.clone()),
            _ => Err(BrokerError::ObjectNotFound {
                bucket: self.bucket.clone(),
                object: name.to_string(),
            }),
        })
    }

    async fn put(&self, name: &str, data: Vec<u8>) -> BrokerResult<ObjectInfo> {
        self.with_bucket(|b| {
            let obj = StoredObject { data, deleted: false };
            let info = self.info(name, &obj);
            b.objects.insert(name.to_string(), obj);
            // No watchers is not an error.
            let _ = b.events.send(info.clone());
            Ok(info)
        })
    }

    async fn delete(&self, name: &str) -> BrokerResult<()> {
        self.with_bucket(|b| {
            let obj = b.objects.get_mut(name).ok_or_else(|| BrokerError::ObjectNotFound {
                bucket: self.bucket.clone(),
                object: name.to_string(),
            })?;
            obj.deleted = true;
            obj.data.clear();
            let info = ObjectInfo {
                bucket: self.bucket.clone(),
                name: name.to_string(),
                size: 0,
                deleted: true,
            };
            let _ = b.events.send(info);
            Ok(())
        })
    }

    async fn watch(&self, include_history: bool) -> BrokerResult<Box<dyn ObjectWatcher>> {
        self.with_bucket(|b| {
            let history = if include_history {
                b.objects.iter().map(|(name, obj)| self.info(name, obj)).collect()
            } else {
                VecDeque::new()
            };
            Ok(Box::new(MemoryWatcher { history, events: b.events.subscribe() }) as Box<dyn ObjectWatcher>)
        })
    }
}

struct MemoryWatcher {
    history: VecDeque<ObjectInfo>,
    events: broadcast::Receiver<ObjectInfo>,
}

#[async_trait]
impl ObjectWatcher for MemoryWatcher {
    async fn next_update(&mut self, timeout: Duration) -> BrokerResult<WatchOutcome> {
        if let Some(info) = self.history.pop_front() {
            return Ok(WatchOutcome::Event(info));
        }
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Ok(info)) => return Ok(WatchOutcome::Event(info)),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(skipped, "object watcher lagged behind");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(BrokerError::Closed),
                Err(_) => return Ok(WatchOutcome::Timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.add_stream("market-data", &["market-data.>"]).unwrap();
        broker
    }

    async fn fetch_one(sub: &mut Box<dyn PullSubscription>, timeout: Duration) -> Option<Box<dyn Delivery>> {
        match sub.fetch(1, timeout).await.unwrap() {
            FetchOutcome::Messages(mut msgs) => msgs.pop(),
            FetchOutcome::Timeout => None,
        }
    }

    #[tokio::test]
    async fn test_publish_requires_capturing_stream() {
        let session = broker().session();
        let ack = session.publish("market-data.raw.BTC-USD", b"x".to_vec()).await.unwrap();
        assert_eq!(ack, PublishAck { stream: "market-data".into(), sequence: 1 });
        let err = session.publish("other.subject", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, BrokerError::NoStreamForSubject(_)));
    }

    #[tokio::test]
    async fn test_deliver_new_skips_backlog() {
        let broker = broker();
        let session = broker.session();
        session.publish("market-data.raw.OLD", b"old".to_vec()).await.unwrap();
        session
            .add_consumer("market-data", ConsumerConfig::durable_new("fe", "market-data.raw.>"))
            .await
            .unwrap();
        session.publish("market-data.raw.NEW", b"new".to_vec()).await.unwrap();

        let mut sub = session.pull_subscribe("market-data", "market-data.raw.>", "fe").await.unwrap();
        let msg = fetch_one(&mut sub, Duration::from_millis(50)).await.unwrap();
        assert_eq!(msg.payload(), b"new");
        assert_eq!(msg.subject(), "market-data.raw.NEW");
    }

    #[tokio::test]
    async fn test_add_consumer_is_idempotent_for_same_config() {
        let broker = broker();
        let session = broker.session();
        let cfg = ConsumerConfig::durable_new("fe", "market-data.raw.>");
        session.add_consumer("market-data", cfg.clone()).await.unwrap();
        session.add_consumer("market-data", cfg).await.unwrap();
        assert_eq!(broker.consumer_names("market-data"), vec!["fe".to_string()]);

        let other = ConsumerConfig::durable_new("fe", "market-data.processed.>");
        let err = session.add_consumer("market-data", other).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConsumerExists { .. }));
    }

    #[tokio::test]
    async fn test_consumer_info_reports_not_found() {
        let session = broker().session();
        let err = session.consumer_info("market-data", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = session.consumer_info("nope", "missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::StreamNotFound(_)));
        assert!(!err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out_without_messages() {
        let broker = broker();
        let session = broker.session();
        session
            .add_consumer("market-data", ConsumerConfig::durable_new("fe", "market-data.raw.>"))
            .await
            .unwrap();
        let mut sub = session.pull_subscribe("market-data", "market-data.raw.>", "fe").await.unwrap();
        let outcome = sub.fetch(1, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_wakes_on_publish() {
        let broker = broker();
        let session = broker.session();
        session
            .add_consumer("market-data", ConsumerConfig::durable_new("fe", "market-data.raw.>"))
            .await
            .unwrap();
        let mut sub = session.pull_subscribe("market-data", "market-data.raw.>", "fe").await.unwrap();

        let publisher = broker.session();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            publisher.publish("market-data.raw.ETH-USD", b"late".to_vec()).await.unwrap();
        });
        let msg = fetch_one(&mut sub, Duration::from_secs(5)).await.unwrap();
        assert_eq!(msg.payload(), b"late");
    }

    #[tokio::test]
    async fn test_nak_redelivers_same_payload() {
        let broker = broker();
        let session = broker.session();
        session
            .add_consumer("market-data", ConsumerConfig::durable_new("fe", "market-data.raw.>"))
            .await
            .unwrap();
        session.publish("market-data.raw.BTC-USD", b"payload".to_vec()).await.unwrap();
        let mut sub = session.pull_subscribe("market-data", "market-data.raw.>", "fe").await.unwrap();

        let first = fetch_one(&mut sub, Duration::from_millis(10)).await.unwrap();
        first.nak().await.unwrap();
        let second = fetch_one(&mut sub, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.payload(), first.payload());
        assert_eq!(second.info().stream_sequence, first.info().stream_sequence);
        assert_eq!(second.info().delivered, 2);
        second.ack().await.unwrap();
        assert!(matches!(second.ack().await, Err(BrokerError::AlreadyAcked)));

        let stats = broker.consumer_stats("market-data", "fe").unwrap();
        assert_eq!(stats, ConsumerStats { acks: 1, naks: 1, ack_pending: 0 });
        assert!(fetch_one(&mut sub, Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_redelivered_after_ack_wait() {
        let broker = broker();
        let session = broker.session();
        let mut cfg = ConsumerConfig::durable_new("fe", "market-data.raw.>");
        cfg.ack_wait = Duration::from_secs(2);
        session.add_consumer("market-data", cfg).await.unwrap();
        session.publish("market-data.raw.BTC-USD", b"p".to_vec()).await.unwrap();
        let mut sub = session.pull_subscribe("market-data", "market-data.raw.>", "fe").await.unwrap();

        let first = fetch_one(&mut sub, Duration::from_secs(1)).await.unwrap();
        drop(first);
        let again = fetch_one(&mut sub, Duration::from_secs(5)).await.unwrap();
        assert_eq!(again.payload(), b"p");
        assert_eq!(again.info().delivered, 2);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_calls() {
        let broker = broker();
        let session = broker.session();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(broker.sessions_closed(), 1);
        assert!(matches!(
            session.publish("market-data.raw.X", vec![]).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_object_store_watch_events() {
        let session = broker().session();
        assert!(matches!(
            session.object_store("models").await,
            Err(BrokerError::BucketNotFound(_))
        ));
        let store = session.create_object_store("models").await.unwrap();
        store.put("a.json", b"1".to_vec()).await.unwrap();

        let mut fresh = store.watch(false).await.unwrap();
        let mut replay = store.watch(true).await.unwrap();
        store.put("b.json", b"22".to_vec()).await.unwrap();
        store.delete("a.json").await.unwrap();

        let WatchOutcome::Event(first) = fresh.next_update(Duration::from_secs(1)).await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!((first.name.as_str(), first.size, first.deleted), ("b.json", 2, false));
        let WatchOutcome::Event(second) = fresh.next_update(Duration::from_secs(1)).await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!((second.name.as_str(), second.deleted), ("a.json", true));
        assert!(matches!(
            fresh.next_update(Duration::from_secs(1)).await.unwrap(),
            WatchOutcome::Timeout
        ));

        let WatchOutcome::Event(history) = replay.next_update(Duration::from_secs(1)).await.unwrap() else {
            panic!("expected history event");
        };
        assert_eq!(history.name, "a.json");

        assert!(store.get("a.json").await.is_err());
        assert_eq!(store.get("b.json").await.unwrap(), b"22".to_vec());
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|o| o.name == "a.json" && o.deleted));
    }
}
