//! The main delivery stream: one Redis stream per partition, one consumer
//! group shared by all pipeline instances. An entry holds a single
//! `envelope` field with the JSON-serialized [`MessageEnvelope`].

use chrono::Utc;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{error, warn};

use crate::error::AppResult;
use crate::models::MessageEnvelope;

use super::{delivery_stream_key, partition_for_conversation, DELIVERY_DLQ_KEY, DELIVERY_GROUP};

/// A claimed stream entry: the broker-assigned id plus the decoded envelope.
#[derive(Debug, Clone)]
pub struct DeliveryEntry {
    pub stream_id: String,
    pub envelope: MessageEnvelope,
}

#[derive(Clone)]
pub struct DeliveryQueue {
    client: Client,
    partitions: u32,
}

impl DeliveryQueue {
    pub fn new(client: Client, partitions: u32) -> Self {
        Self { client, partitions }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Create the consumer group on every partition stream (idempotent;
    /// BUSYGROUP replies from earlier boots are expected).
    pub async fn ensure_groups(&self) -> AppResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        for partition in 0..self.partitions {
            let key = delivery_stream_key(partition);
            let created: Result<String, _> = conn
                .xgroup_create_mkstream(&key, DELIVERY_GROUP, "0")
                .await;
            if let Err(e) = created {
                if !e.to_string().contains("BUSYGROUP") {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Producer side of the contract: route by conversation, append in
    /// arrival order. Exposed for the API layer and integration tests.
    pub async fn enqueue(&self, envelope: &MessageEnvelope) -> AppResult<String> {
        let partition = partition_for_conversation(envelope.conversation_id, self.partitions);
        let key = delivery_stream_key(partition);
        let payload = serde_json::to_string(envelope)?;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let entry_id: String = conn.xadd(&key, "*", &[("envelope", payload.as_str())]).await?;
        Ok(entry_id)
    }

    /// Block-poll a batch of fresh entries for one partition worker.
    pub async fn read_batch(
        &self,
        partition: u32,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> AppResult<Vec<DeliveryEntry>> {
        let key = delivery_stream_key(partition);
        let opts = StreamReadOptions::default()
            .group(DELIVERY_GROUP, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: StreamReadReply = conn.xread_options(&[&key], &[">"], &opts).await?;

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                if let Some(entry) = self.decode_entry(&mut conn, &key, id, 0).await {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Reclaim entries another consumer left pending past the idle window.
    /// This is the retry mechanism: an unacknowledged entry ages out of its
    /// claim and is offered again, with the broker's delivery count telling
    /// us how many redeliveries it has seen.
    pub async fn claim_stale(
        &self,
        partition: u32,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> AppResult<Vec<DeliveryEntry>> {
        let key = delivery_stream_key(partition);
        let min_idle_ms = min_idle.as_millis() as usize;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let pending: StreamPendingCountReply = conn
            .xpending_count(&key, DELIVERY_GROUP, "-", "+", count)
            .await?;

        let stale: Vec<(String, usize)> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| (p.id, p.times_delivered))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = stale.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(&key, DELIVERY_GROUP, consumer, min_idle_ms, &ids)
            .await?;

        let mut entries = Vec::new();
        for id in claimed.ids {
            let retries = stale
                .iter()
                .find(|(stale_id, _)| *stale_id == id.id)
                .map(|(_, times_delivered)| *times_delivered as u32)
                .unwrap_or(1);
            if let Some(entry) = self.decode_entry(&mut conn, &key, id, retries).await {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Acknowledge a batch of processed entries in one call.
    pub async fn ack(&self, partition: u32, stream_ids: &[String]) -> AppResult<()> {
        if stream_ids.is_empty() {
            return Ok(());
        }
        let key = delivery_stream_key(partition);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.xack::<_, _, _, ()>(&key, DELIVERY_GROUP, stream_ids)
            .await?;
        Ok(())
    }

    /// Park an envelope that exhausted its retry budget, recording the
    /// triggering error. The caller acknowledges the original entry after
    /// this succeeds so it stops being redelivered.
    pub async fn dead_letter(&self, envelope: &MessageEnvelope, reason: &str) -> AppResult<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.xadd::<_, _, _, _, String>(
            DELIVERY_DLQ_KEY,
            "*",
            &[
                ("envelope", payload.as_str()),
                ("error", reason),
                ("failedAt", &Utc::now().to_rfc3339()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Decode one stream entry. A payload that cannot be decoded can never
    /// succeed, so it is parked in the dead-letter stream and acknowledged
    /// immediately instead of cycling through redelivery.
    async fn decode_entry(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
        id: StreamId,
        retry_count: u32,
    ) -> Option<DeliveryEntry> {
        let payload: Option<String> = id.get("envelope");
        let Some(payload) = payload else {
            warn!(stream_id = %id.id, "delivery entry missing envelope field, discarding");
            let _: Result<(), _> = conn.xack(key, DELIVERY_GROUP, &[&id.id]).await;
            return None;
        };

        match serde_json::from_str::<MessageEnvelope>(&payload) {
            Ok(mut envelope) => {
                envelope.retry_count = retry_count;
                Some(DeliveryEntry {
                    stream_id: id.id,
                    envelope,
                })
            }
            Err(e) => {
                error!(stream_id = %id.id, error = %e, "undecodable envelope, dead-lettering");
                let _: Result<String, _> = conn
                    .xadd(
                        DELIVERY_DLQ_KEY,
                        "*",
                        &[
                            ("raw", payload.as_str()),
                            ("error", &e.to_string()),
                            ("failedAt", &Utc::now().to_rfc3339()),
                        ],
                    )
                    .await;
                let _: Result<(), _> = conn.xack(key, DELIVERY_GROUP, &[&id.id]).await;
                None
            }
        }
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("partitions", &self.partitions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_are_per_partition() {
        assert_eq!(delivery_stream_key(0), "delivery:stream:0");
        assert_eq!(delivery_stream_key(3), "delivery:stream:3");
    }
}
