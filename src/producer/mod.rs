//! Scheduled producer: on every scheduler tick fetch OHLC candles for each
//! configured pair and publish them to `<raw subject>.<SYMBOL>`.

pub mod candles;
pub mod kraken;

use std::sync::Arc;

use chrono::FixedOffset;
use parking_lot::RwLock;
use tracing::{error, info, instrument, warn};

use crate::broker::{Broker, Connector};
use crate::scheduler::{Job, Scheduler};
use crate::subject::{symbol_token, Subject};

pub use candles::{normalize, Candle, CandleError};
pub use kraken::{FetchError, KrakenClient, OhlcSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub pairs: Vec<String>,
    pub raw_subject: Subject,
    pub source_offset: FixedOffset,
}

struct Inner {
    config: ProducerConfig,
    source: Arc<dyn OhlcSource>,
    scheduler: Scheduler,
    broker: RwLock<Option<Arc<dyn Broker>>>,
}

#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    pub fn new(config: ProducerConfig, source: Arc<dyn OhlcSource>, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(Inner { config, source, scheduler, broker: RwLock::new(None) }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Connects to the broker and registers `process_request` with the
    /// scheduler. Connection failure is returned to the caller.
    pub async fn start(&self, connector: &dyn Connector) -> anyhow::Result<()> {
        let broker = connector.connect().await?;
        *self.inner.broker.write() = Some(broker);
        info!(pairs = ?self.inner.config.pairs, "producer connected");

        let producer = self.clone();
        self.inner.scheduler.subscribe(Job::new("producer", move || {
            let producer = producer.clone();
            async move {
                producer.process_request().await;
                Ok(())
            }
        }));
        Ok(())
    }

    pub async fn shutdown(&self) {
        let broker = self.inner.broker.write().take();
        if let Some(broker) = broker {
            if let Err(e) = broker.close().await {
                warn!(error = %e, "error closing producer connection");
            }
        }
    }

    /// One pass over every pair. A failure for one pair is logged and the
    /// next pair is still processed; nothing is propagated.
    #[instrument(skip(self), name = "producer_tick")]
    pub async fn process_request(&self) -> TickReport {
        let mut report = TickReport::default();
        let broker = self.inner.broker.read().clone();
        let Some(broker) = broker else {
            error!("producer has no broker connection, skipping tick");
            report.failed = self.inner.config.pairs.len();
            return report;
        };
        for pair in &self.inner.config.pairs {
            match self.publish_pair(broker.as_ref(), pair).await {
                Ok(subject) => {
                    report.published += 1;
                    metrics::counter!("neural_trade_raw_published_total").increment(1);
                    info!(pair = %pair, %subject, "published market data");
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!("neural_trade_raw_failed_total").increment(1);
                    error!(pair = %pair, error = %e, "failed to process pair");
                }
            }
        }
        report
    }

    async fn publish_pair(&self, broker: &dyn Broker, pair: &str) -> anyhow::Result<Subject> {
        let subject = self.inner.config.raw_subject.child(&symbol_token(pair))?;
        let rows = self.inner.source.fetch_ohlc(pair).await?;
        let records = normalize(&rows, self.inner.config.source_offset)?;
        let payload = serde_json::to_vec(&records)?;
        broker.publish(subject.as_str(), payload).await?;
        Ok(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct StaticSource {
        rows: Vec<(String, Vec<Value>)>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OhlcSource for StaticSource {
        async fn fetch_ohlc(&self, pair: &str) -> Result<Vec<Value>, FetchError> {
            self.calls.lock().push(pair.to_string());
            self.rows
                .iter()
                .find(|(p, _)| p == pair)
                .map(|(_, rows)| rows.clone())
                .ok_or_else(|| FetchError::Api(vec!["EQuery:Unknown asset pair".into()]))
        }
    }

    fn setup(pairs: &[&str]) -> (MemoryBroker, Producer, Arc<StaticSource>) {
        let broker = MemoryBroker::new();
        broker.add_stream("market-data", &["market-data.>"]).unwrap();
        let source = Arc::new(StaticSource {
            rows: vec![
                ("FOO/USD".into(), vec![json!([1700000000, 50000, 505000, 49500, 50200, 1000, 1000, 1000])]),
                ("BAR/USD".into(), vec![json!([1700000900, "1.5", "2", "1", "1.75", "1.6", "300", 12])]),
            ],
            calls: Mutex::new(Vec::new()),
        });
        let producer = Producer::new(
            ProducerConfig {
                pairs: pairs.iter().map(|p| p.to_string()).collect(),
                raw_subject: Subject::parse("market-data.raw").unwrap(),
                source_offset: FixedOffset::west_opt(6 * 3600).unwrap(),
            },
            source.clone(),
            Scheduler::new(Duration::from_secs(900)),
        );
        (broker, producer, source)
    }

    #[tokio::test]
    async fn test_publishes_canonical_records() {
        let (broker, producer, _) = setup(&["FOO/USD"]);
        producer.start(&broker.connector()).await.unwrap();

        let report = producer.process_request().await;
        assert_eq!(report, TickReport { published: 1, failed: 0 });

        let published = broker.messages_on("market-data.raw.FOO-USD");
        assert_eq!(published.len(), 1);
        let decoded: Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(
            decoded,
            json!([{"Date": 1699978400000i64, "Open": 50000, "High": 505000, "Low": 49500, "Close": 50200, "Volume": 1000}])
        );
    }

    #[tokio::test]
    async fn test_failing_pair_does_not_stop_the_rest() {
        let (broker, producer, source) = setup(&["FOO/USD", "NOPE/USD", "BAR/USD"]);
        producer.start(&broker.connector()).await.unwrap();

        let report = producer.process_request().await;
        assert_eq!(report, TickReport { published: 2, failed: 1 });
        assert_eq!(*source.calls.lock(), vec!["FOO/USD", "NOPE/USD", "BAR/USD"]);
        assert_eq!(broker.messages_on("market-data.raw.BAR-USD").len(), 1);
        assert!(broker.messages_on("market-data.raw.NOPE-USD").is_empty());
    }

    #[tokio::test]
    async fn test_start_registers_with_scheduler() {
        let (broker, producer, _) = setup(&["FOO/USD"]);
        producer.start(&broker.connector()).await.unwrap();
        assert_eq!(producer.scheduler().subscriber_count(), 1);

        let dispatch = producer.scheduler().dispatch_now().await;
        assert_eq!(dispatch.succeeded, 1);
        assert_eq!(broker.messages_on("market-data.raw.FOO-USD").len(), 1);
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_unreachable() {
        let (_, producer, _) = setup(&["FOO/USD"]);
        let connector = crate::broker::MemoryConnector::unreachable("nats://nowhere:4222");
        assert!(producer.start(&connector).await.is_err());
        assert_eq!(producer.scheduler().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_contained() {
        // No stream captures the raw subject, so every publish fails.
        let broker = MemoryBroker::new();
        let (_, producer, _) = setup(&["FOO/USD"]);
        producer.start(&broker.connector()).await.unwrap();
        assert_eq!(producer.process_request().await, TickReport { published: 0, failed: 1 });
    }
}
