use thiserror::Error;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError, ConsumerConfig};
use crate::subject::Subject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Existing,
    Created,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to look up consumer `{consumer}` on `{stream}`: {source}")]
    Lookup {
        stream: String,
        consumer: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to create consumer `{consumer}` on `{stream}`: {source}")]
    Create {
        stream: String,
        consumer: String,
        #[source]
        source: BrokerError,
    },
}

pub async fn ensure_consumer(
    broker: &dyn Broker,
    stream: &str,
    consumer: &str,
    filter: &Subject,
) -> Result<Provisioned, ProvisionError> {
    match broker.consumer_info(stream, consumer).await {
        Ok(existing) => {
            info!(
                stream,
                consumer,
                ack_pending = existing.num_ack_pending,
                "durable consumer already exists"
            );
            return Ok(Provisioned::Existing);
        }
        Err(e) if e.is_not_found() => {}
        Err(source) => {
            return Err(ProvisionError::Lookup {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
                source,
            })
        }
    }

    match broker.add_consumer(stream, ConsumerConfig::durable_new(consumer, filter.as_str())).await {
        Ok(_) => {
            info!(stream, consumer, filter = %filter, "created durable consumer");
            Ok(Provisioned::Created)
        }
        Err(BrokerError::ConsumerExists { .. }) => {
            warn!(stream, consumer, "consumer created concurrently by another replica");
            Ok(Provisioned::Existing)
        }
        Err(source) => Err(ProvisionError::Create {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            source,
        }),
    }
}
