//! Consumer-group reads and acknowledgements

use crate::config::WorkerConfig;
use crate::error::StreamError;
use crate::event::{Delivery, StreamEvent};
use crate::registry::MessageKey;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

type StreamEntries = Vec<(String, Vec<(String, String)>)>;
type StreamReply = Vec<(String, StreamEntries)>;

/// Reads entries for one consumer of one consumer group
pub struct StreamConsumer {
    redis: ConnectionManager,
    config: WorkerConfig,
}

impl StreamConsumer {
    pub fn new(redis: ConnectionManager, config: WorkerConfig) -> Self {
        Self { redis, config }
    }

    pub fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    /// Create the consumer group (and the stream) unless it already exists
    pub async fn ensure_consumer_group(&self) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.config.consumer_group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(StreamError::Redis(e)),
        }
    }

    /// Entries delivered to this consumer but never acknowledged
    pub async fn read_pending<J: DeserializeOwned>(&self) -> Result<Vec<Delivery<J>>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: Option<StreamReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg("COUNT")
            .arg(self.config.batch_size)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg("0")
            .query_async(&mut conn)
            .await?;

        Ok(decode_reply(reply.unwrap_or_default()))
    }

    /// New entries, blocking up to `block_timeout_ms`
    pub async fn read_new<J: DeserializeOwned>(&self) -> Result<Vec<Delivery<J>>, StreamError> {
        let mut conn = self.redis.clone();

        let reply: Option<StreamReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg("BLOCK")
            .arg(self.config.block_timeout_ms)
            .arg("COUNT")
            .arg(self.config.batch_size)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        Ok(decode_reply(reply.unwrap_or_default()))
    }

    /// Take over entries other consumers left pending for longer than `claim_idle_ms`
    pub async fn claim_abandoned<J: DeserializeOwned>(
        &self,
    ) -> Result<Vec<Delivery<J>>, StreamError> {
        let mut conn = self.redis.clone();

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(self.config.claim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.config.batch_size)
            .query_async(&mut conn)
            .await?;

        let ids: Vec<&str> = pending
            .iter()
            .filter(|(_, owner, _, _)| owner != &self.config.consumer_id)
            .map(|(id, _, _, _)| id.as_str())
            .collect();

        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg(self.config.claim_idle_ms)
            .arg(&ids);

        let entries: StreamEntries = cmd.query_async(&mut conn).await?;
        let deliveries = decode_entries(entries);
        if !deliveries.is_empty() {
            warn!(count = deliveries.len(), "Claimed abandoned entries");
        }
        Ok(deliveries)
    }

    pub async fn ack(&self, stream_id: &str) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();

        let _: i64 = redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(stream_id)
            .query_async(&mut conn)
            .await?;

        debug!(stream_id = %stream_id, "Acknowledged entry");
        Ok(())
    }
}

fn decode_reply<J: DeserializeOwned>(reply: StreamReply) -> Vec<Delivery<J>> {
    reply
        .into_iter()
        .flat_map(|(_stream, entries)| decode_entries(entries))
        .collect()
}

pub(crate) fn decode_entries<J: DeserializeOwned>(entries: StreamEntries) -> Vec<Delivery<J>> {
    entries
        .into_iter()
        .map(|(stream_id, fields)| {
            let raw = fields
                .into_iter()
                .find(|(key, _)| key == MessageKey::Job.as_ref())
                .map(|(_, value)| value);

            match raw {
                Some(json) => match serde_json::from_str::<J>(&json) {
                    Ok(job) => Delivery::Event(StreamEvent::new(stream_id, job)),
                    Err(e) => Delivery::Malformed {
                        stream_id,
                        raw: Some(json),
                        reason: format!("invalid payload: {e}"),
                    },
                },
                None => Delivery::Malformed {
                    stream_id,
                    raw: None,
                    reason: "missing 'job' field".to_string(),
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> (String, Vec<(String, String)>) {
        (
            id.to_string(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_decode_entries_keeps_order_and_flags_malformed() {
        let decoded: Vec<Delivery<Ping>> = decode_entries(vec![
            entry("1-0", &[("job", r#"{"n":1}"#)]),
            entry("2-0", &[("job", "not json")]),
            entry("3-0", &[("other", "x")]),
        ]);

        assert_eq!(decoded.len(), 3);
        assert!(matches!(&decoded[0], Delivery::Event(e) if e.job == Ping { n: 1 }));
        assert!(matches!(&decoded[1], Delivery::Malformed { raw: Some(r), .. } if r == "not json"));
        assert!(matches!(&decoded[2], Delivery::Malformed { raw: None, .. }));
        assert_eq!(decoded[2].stream_id(), "3-0");
    }
}
