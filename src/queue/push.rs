//! Push task stream, isolated from the delivery stream so a slow push
//! gateway can never block persistence or online fanout. An entry holds a
//! single `task` field with the JSON-serialized [`PushTask`].

use async_trait::async_trait;
use chrono::Utc;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{error, warn};

use crate::error::AppResult;
use crate::models::PushTask;

use super::{PUSH_DLQ_KEY, PUSH_GROUP, PUSH_STREAM_KEY};

/// Outcome of decoding one raw stream entry. Poison entries can never
/// succeed and must be settled on the spot, or the reclaim pass offers
/// them again on every cycle.
#[derive(Debug)]
enum DecodedTask {
    Task(PushTask),
    Poison {
        raw: Option<String>,
        error: String,
    },
}

fn decode_task(id: &StreamId) -> DecodedTask {
    let payload: Option<String> = id.get("task");
    let Some(payload) = payload else {
        return DecodedTask::Poison {
            raw: None,
            error: "missing task field".to_string(),
        };
    };
    match serde_json::from_str::<PushTask>(&payload) {
        Ok(task) => DecodedTask::Task(task),
        Err(e) => DecodedTask::Poison {
            raw: Some(payload),
            error: e.to_string(),
        },
    }
}

/// Seam between the pipeline-side scheduler and the push queue, so the
/// processor can be exercised with an in-memory sink in tests.
#[async_trait]
pub trait PushTaskSink: Send + Sync {
    async fn enqueue(&self, task: &PushTask) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct PushEntry {
    pub stream_id: String,
    pub task: PushTask,
}

#[derive(Clone)]
pub struct PushQueue {
    client: Client,
}

impl PushQueue {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn ensure_group(&self) -> AppResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let created: Result<String, _> = conn
            .xgroup_create_mkstream(PUSH_STREAM_KEY, PUSH_GROUP, "0")
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub async fn read_batch(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> AppResult<Vec<PushEntry>> {
        let opts = StreamReadOptions::default()
            .group(PUSH_GROUP, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: StreamReadReply = conn
            .xread_options(&[PUSH_STREAM_KEY], &[">"], &opts)
            .await?;

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                if let Some(entry) = self.settle_decoded(&mut conn, id).await {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Reclaim tasks stranded by a crashed push worker.
    pub async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> AppResult<Vec<PushEntry>> {
        let min_idle_ms = min_idle.as_millis() as usize;
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let pending: StreamPendingCountReply = conn
            .xpending_count(PUSH_STREAM_KEY, PUSH_GROUP, "-", "+", count)
            .await?;
        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = stale.iter().map(String::as_str).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(PUSH_STREAM_KEY, PUSH_GROUP, consumer, min_idle_ms, &ids)
            .await?;

        let mut entries = Vec::new();
        for id in claimed.ids {
            if let Some(entry) = self.settle_decoded(&mut conn, id).await {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Decode one entry; a poison payload is parked in the dead-letter
    /// stream and acknowledged immediately so it cannot be re-claimed.
    async fn settle_decoded(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: StreamId,
    ) -> Option<PushEntry> {
        match decode_task(&id) {
            DecodedTask::Task(task) => Some(PushEntry {
                stream_id: id.id,
                task,
            }),
            DecodedTask::Poison { raw: None, error } => {
                warn!(stream_id = %id.id, error = %error, "push entry missing task field, discarding");
                let _: Result<(), _> = conn.xack(PUSH_STREAM_KEY, PUSH_GROUP, &[&id.id]).await;
                None
            }
            DecodedTask::Poison {
                raw: Some(payload),
                error,
            } => {
                error!(stream_id = %id.id, error = %error, "undecodable push task, dead-lettering");
                let _: Result<String, _> = conn
                    .xadd(
                        PUSH_DLQ_KEY,
                        "*",
                        &[
                            ("raw", payload.as_str()),
                            ("error", error.as_str()),
                            ("failedAt", &Utc::now().to_rfc3339()),
                        ],
                    )
                    .await;
                let _: Result<(), _> = conn.xack(PUSH_STREAM_KEY, PUSH_GROUP, &[&id.id]).await;
                None
            }
        }
    }

    pub async fn ack(&self, stream_id: &str) -> AppResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.xack::<_, _, _, ()>(PUSH_STREAM_KEY, PUSH_GROUP, &[stream_id])
            .await?;
        Ok(())
    }

    pub async fn dead_letter(&self, task: &PushTask, reason: &str) -> AppResult<()> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.xadd::<_, _, _, _, String>(
            PUSH_DLQ_KEY,
            "*",
            &[
                ("task", payload.as_str()),
                ("error", reason),
                ("failedAt", &Utc::now().to_rfc3339()),
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PushTaskSink for PushQueue {
    async fn enqueue(&self, task: &PushTask) -> AppResult<()> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.xadd::<_, _, _, _, String>(PUSH_STREAM_KEY, "*", &[("task", payload.as_str())])
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for PushQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushQueue").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn entry_with(payload: Option<&str>) -> StreamId {
        let mut map = HashMap::new();
        if let Some(payload) = payload {
            map.insert(
                "task".to_string(),
                redis::Value::Data(payload.as_bytes().to_vec()),
            );
        }
        StreamId {
            id: "1-0".to_string(),
            map,
        }
    }

    #[test]
    fn valid_payload_decodes_to_task() {
        let task = PushTask {
            task_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sender_name: "alice".into(),
            content_preview: "hi".into(),
            created_at: Utc::now(),
            retry_count: 0,
            backoff_until: None,
        };
        let payload = serde_json::to_string(&task).unwrap();
        match decode_task(&entry_with(Some(&payload))) {
            DecodedTask::Task(decoded) => assert_eq!(decoded.task_id, task.task_id),
            other => panic!("expected Task, got {:?}", other),
        }
    }

    #[test]
    fn garbage_payload_is_poison_with_raw_preserved() {
        match decode_task(&entry_with(Some("not json"))) {
            DecodedTask::Poison { raw, .. } => assert_eq!(raw.as_deref(), Some("not json")),
            other => panic!("expected Poison, got {:?}", other),
        }
    }

    #[test]
    fn missing_task_field_is_poison() {
        match decode_task(&entry_with(None)) {
            DecodedTask::Poison { raw: None, .. } => {}
            other => panic!("expected Poison without raw, got {:?}", other),
        }
    }
}
