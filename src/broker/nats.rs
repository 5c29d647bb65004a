//! JetStream backend built on `async-nats`.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, object_store, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    AckPolicy, Broker, BrokerError, BrokerResult, Connector, ConsumerConfig, ConsumerInfo,
    DeliverPolicy, Delivery, DeliveryInfo, FetchOutcome, ObjectInfo, ObjectStore, ObjectWatcher,
    PublishAck, PullSubscription, WatchOutcome,
};

// JetStream API error codes.
const CONSUMER_NOT_FOUND: &str = "10014";
const STREAM_NOT_FOUND: &str = "10059";
const CONSUMER_ALREADY_EXISTS: &str = "10148";

fn request_err(err: impl Display) -> BrokerError {
    BrokerError::Request(err.to_string())
}

fn reports(err: &impl Display, code: &str, phrase: &str) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains(code) || text.contains(phrase)
}

pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string() }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn Broker>> {
        let client = async_nats::connect(&self.url).await.map_err(|e| BrokerError::Connection {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        info!(url = %self.url, "connected to NATS");
        let context = jetstream::new(client.clone());
        Ok(Arc::new(NatsSession { client, context, closed: AtomicBool::new(false) }))
    }
}

pub struct NatsSession {
    client: async_nats::Client,
    context: jetstream::Context,
    closed: AtomicBool,
}

impl NatsSession {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    async fn stream(&self, name: &str) -> BrokerResult<jetstream::stream::Stream> {
        self.context.get_stream(name).await.map_err(|e| {
            if reports(&e, STREAM_NOT_FOUND, "stream not found") {
                BrokerError::StreamNotFound(name.to_string())
            } else {
                request_err(e)
            }
        })
    }
}

fn to_consumer_info(info: &consumer::Info) -> ConsumerInfo {
    let deliver_policy = match info.config.deliver_policy {
        consumer::DeliverPolicy::New => DeliverPolicy::New,
        _ => DeliverPolicy::All,
    };
    ConsumerInfo {
        stream: info.stream_name.clone(),
        name: info.name.clone(),
        config: ConsumerConfig {
            durable_name: info.config.durable_name.clone().unwrap_or_else(|| info.name.clone()),
            filter_subject: info.config.filter_subject.clone(),
            deliver_policy,
            ack_policy: AckPolicy::Explicit,
            ack_wait: info.config.ack_wait,
        },
        num_ack_pending: info.num_ack_pending as u64,
    }
}

#[async_trait]
impl Broker for NatsSession {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<PublishAck> {
        self.ensure_open()?;
        let ack = self
            .context
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(request_err)?
            .await
            .map_err(|e| {
                if reports(&e, "503", "no responders") {
                    BrokerError::NoStreamForSubject(subject.to_string())
                } else {
                    request_err(e)
                }
            })?;
        Ok(PublishAck { stream: ack.stream, sequence: ack.sequence })
    }

    async fn consumer_info(&self, stream: &str, name: &str) -> BrokerResult<ConsumerInfo> {
        self.ensure_open()?;
        let handle = self.stream(stream).await?;
        match handle.consumer_info(name).await {
            Ok(info) => Ok(to_consumer_info(&info)),
            Err(e) if reports(&e, CONSUMER_NOT_FOUND, "consumer not found") => {
                Err(BrokerError::ConsumerNotFound {
                    stream: stream.to_string(),
                    consumer: name.to_string(),
                })
            }
            Err(e) => Err(request_err(e)),
        }
    }

    async fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> BrokerResult<ConsumerInfo> {
        self.ensure_open()?;
        let handle = self.stream(stream).await?;
        let deliver_policy = match config.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
        };
        let pull_config = consumer::pull::Config {
            name: Some(config.durable_name.clone()),
            durable_name: Some(config.durable_name.clone()),
            filter_subject: config.filter_subject.clone(),
            deliver_policy,
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            ..Default::default()
        };
        let mut created = handle.create_consumer(pull_config).await.map_err(|e| {
            if reports(&e, CONSUMER_ALREADY_EXISTS, "already exists") {
                BrokerError::ConsumerExists {
                    stream: stream.to_string(),
                    consumer: config.durable_name.clone(),
                }
            } else {
                request_err(e)
            }
        })?;
        let info = created.info().await.map_err(request_err)?;
        debug!(stream, consumer = %config.durable_name, "consumer created");
        Ok(to_consumer_info(info))
    }

    async fn pull_subscribe(
        &self,
        stream: &str,
        filter_subject: &str,
        durable: &str,
    ) -> BrokerResult<Box<dyn PullSubscription>> {
        self.ensure_open()?;
        let handle = self.stream(stream).await?;
        let consumer: consumer::PullConsumer = handle.get_consumer(durable).await.map_err(|e| {
            if reports(&e, CONSUMER_NOT_FOUND, "consumer not found") {
                BrokerError::ConsumerNotFound {
                    stream: stream.to_string(),
                    consumer: durable.to_string(),
                }
            } else {
                request_err(e)
            }
        })?;
        debug!(stream, durable, filter_subject, "pull subscription bound");
        Ok(Box::new(NatsSubscription { consumer }))
    }

    async fn object_store(&self, bucket: &str) -> BrokerResult<Arc<dyn ObjectStore>> {
        self.ensure_open()?;
        let store = self.context.get_object_store(bucket).await.map_err(|e| {
            if reports(&e, STREAM_NOT_FOUND, "not found") {
                BrokerError::BucketNotFound(bucket.to_string())
            } else {
                request_err(e)
            }
        })?;
        Ok(Arc::new(NatsObjectStore { bucket: bucket.to_string(), store }))
    }

    async fn create_object_store(&self, bucket: &str) -> BrokerResult<Arc<dyn ObjectStore>> {
        self.ensure_open()?;
        let store = self
            .context
            .create_object_store(object_store::Config {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await
            .map_err(request_err)?;
        Ok(Arc::new(NatsObjectStore { bucket: bucket.to_string(), store }))
    }

    // Marks the session closed and flushes pending publishes. The socket
    // itself is released once the last clone of the client is dropped.
    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.flush().await.map_err(request_err)?;
        info!("NATS session closed");
        Ok(())
    }
}

struct NatsSubscription {
    consumer: consumer::PullConsumer,
}

#[async_trait]
impl PullSubscription for NatsSubscription {
    async fn fetch(&mut self, max_messages: usize, timeout: Duration) -> BrokerResult<FetchOutcome> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(timeout)
            .messages()
            .await
            .map_err(request_err)?;
        let mut out: Vec<Box<dyn Delivery>> = Vec::new();
        while let Some(msg) = batch.next().await {
            let msg = msg.map_err(request_err)?;
            out.push(Box::new(NatsDelivery { msg }));
        }
        if out.is_empty() {
            return Ok(FetchOutcome::Timeout);
        }
        Ok(FetchOutcome::Messages(out))
    }
}

struct NatsDelivery {
    msg: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.msg.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.msg.payload
    }

    fn info(&self) -> DeliveryInfo {
        match self.msg.info() {
            Ok(info) => DeliveryInfo {
                stream_sequence: info.stream_sequence,
                delivered: info.delivered.max(0) as u64,
            },
            Err(_) => DeliveryInfo { stream_sequence: 0, delivered: 0 },
        }
    }

    async fn ack(&self) -> BrokerResult<()> {
        self.msg.ack().await.map_err(request_err)
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.msg.ack_with(AckKind::Nak(None)).await.map_err(request_err)
    }
}

struct NatsObjectStore {
    bucket: String,
    store: object_store::ObjectStore,
}

fn to_object_info(bucket: &str, info: &object_store::ObjectInfo) -> ObjectInfo {
    ObjectInfo {
        bucket: bucket.to_string(),
        name: info.name.clone(),
        size: info.size,
        deleted: info.deleted,
    }
}

#[async_trait]
impl ObjectStore for NatsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self) -> BrokerResult<Vec<ObjectInfo>> {
        let mut list = self.store.list().await.map_err(request_err)?;
        let mut out = Vec::new();
        while let Some(item) = list.next().await {
            let info = item.map_err(request_err)?;
            out.push(to_object_info(&self.bucket, &info));
        }
        Ok(out)
    }

    async fn get(&self, name: &str) -> BrokerResult<Vec<u8>> {
        let mut object = self.store.get(name).await.map_err(|e| {
            if reports(&e, "404", "not found") {
                BrokerError::ObjectNotFound { bucket: self.bucket.clone(), object: name.to_string() }
            } else {
                request_err(e)
            }
        })?;
        let mut data = Vec::new();
        object.read_to_end(&mut data).await.map_err(request_err)?;
        Ok(data)
    }

    async fn put(&self, name: &str, data: Vec<u8>) -> BrokerResult<ObjectInfo> {
        let mut reader = data.as_slice();
        let info = self.store.put(name, &mut reader).await.map_err(request_err)?;
        Ok(to_object_info(&self.bucket, &info))
    }

    async fn delete(&self, name: &str) -> BrokerResult<()> {
        self.store.delete(name).await.map_err(request_err)
    }

    async fn watch(&self, include_history: bool) -> BrokerResult<Box<dyn ObjectWatcher>> {
        let store = self.store.clone();
        let bucket = self.bucket.clone();
        let (tx, rx) = mpsc::channel(64);
        // Driven by its own task; the watcher only holds the receiver.
        tokio::spawn(async move {
            let watch = if include_history {
                store.watch_with_history().await
            } else {
                store.watch().await
            };
            let mut watch = match watch {
                Ok(watch) => watch,
                Err(e) => {
                    let _ = tx.send(Err(request_err(e))).await;
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    item = watch.next() => {
                        let Some(item) = item else { break };
                        let event = item
                            .map(|info| to_object_info(&bucket, &info))
                            .map_err(request_err);
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(NatsWatcher { events: rx }))
    }
}

struct NatsWatcher {
    events: mpsc::Receiver<BrokerResult<ObjectInfo>>,
}

#[async_trait]
impl ObjectWatcher for NatsWatcher {
    async fn next_update(&mut self, timeout: Duration) -> BrokerResult<WatchOutcome> {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(event)) => event.map(WatchOutcome::Event),
            Ok(None) => Err(BrokerError::Closed),
            Err(_) => Ok(WatchOutcome::Timeout),
        }
    }
}
