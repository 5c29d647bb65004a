use async_trait::async_trait;
use serde_json::{Map, Value};

pub type Record = Map<String, Value>;
pub type Records = Vec<Record>;

pub fn decode_records(payload: &[u8]) -> Result<Records, serde_json::Error> {
    serde_json::from_slice(payload)
}

pub fn encode_records(records: &[Record]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(records)
}

/// Per-message stage logic run by a consumer service.
///
/// `key` is the routing key (last subject token) of the incoming message;
/// the returned bytes are published verbatim to `<destination>.<key>`.
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, key: &str, records: Records) -> anyhow::Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_records() {
        let records = decode_records(br#"[{"Date":1,"Open":2.5},{"Date":2,"Open":null}]"#).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Open"], json!(2.5));
        assert!(records[1]["Open"].is_null());

        assert!(decode_records(b"[]").unwrap().is_empty());
        assert!(decode_records(b"not json").is_err());
        assert!(decode_records(br#"{"Date":1}"#).is_err());
    }
}
