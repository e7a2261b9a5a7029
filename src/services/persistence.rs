//! Idempotent persistence step. The conditional insert keyed on
//! `idempotency_key` is the whole correctness story: a replayed envelope
//! inserts nothing and triggers no side effects. Cache invalidation is a
//! read-side optimization and must never fail the pipeline.

use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::MessageEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    /// The envelope's idempotency key already has a row: a genuine no-op
    /// replay, not an error. Fanout and push are skipped entirely.
    IdempotentHit,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store_message(&self, envelope: &MessageEnvelope) -> AppResult<PersistOutcome>;
}

pub fn recent_messages_cache_key(conversation_id: Uuid) -> String {
    format!("cache:messages:recent:{}", conversation_id)
}

pub fn conversation_meta_cache_key(conversation_id: Uuid) -> String {
    format!("cache:conversation:{}", conversation_id)
}

pub fn unread_count_cache_key(user_id: Uuid) -> String {
    format!("cache:unread:{}", user_id)
}

#[derive(Clone)]
pub struct PostgresMessageStore {
    db: PgPool,
    redis: Client,
}

impl PostgresMessageStore {
    pub fn new(db: PgPool, redis: Client) -> Self {
        Self { db, redis }
    }

    fn cache_keys(envelope: &MessageEnvelope) -> Vec<String> {
        let mut keys = vec![
            recent_messages_cache_key(envelope.conversation_id),
            conversation_meta_cache_key(envelope.conversation_id),
        ];
        keys.extend(
            envelope
                .metadata
                .recipient_ids
                .iter()
                .map(|id| unread_count_cache_key(*id)),
        );
        keys
    }

    async fn invalidate_caches(&self, envelope: &MessageEnvelope) {
        let keys = Self::cache_keys(envelope);
        let result = async {
            let mut conn = self.redis.get_multiplexed_async_connection().await?;
            conn.del::<_, ()>(keys).await
        }
        .await;

        if let Err(e) = result {
            // Stale cache hurts only read latency, never correctness.
            warn!(
                message_id = %envelope.message_id,
                error = %e,
                "cache invalidation failed, continuing"
            );
        }
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn store_message(&self, envelope: &MessageEnvelope) -> AppResult<PersistOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, content, content_type,
                 reply_to_id, thread_id, idempotency_key, correlation_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(envelope.message_id)
        .bind(envelope.conversation_id)
        .bind(envelope.sender_id)
        .bind(&envelope.metadata.content)
        .bind(&envelope.metadata.content_type)
        .bind(envelope.metadata.flags.reply_to_id)
        .bind(envelope.metadata.flags.thread_id)
        .bind(&envelope.idempotency_key)
        .bind(&envelope.correlation_id)
        .bind(envelope.created_at)
        .execute(&self.db)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            debug!(
                message_id = %envelope.message_id,
                idempotency_key = %envelope.idempotency_key,
                "idempotent replay, skipping side effects"
            );
            return Ok(PersistOutcome::IdempotentHit);
        }

        sqlx::query(
            r#"
            INSERT INTO conversations (id, last_message_id, last_message_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
                SET last_message_id = EXCLUDED.last_message_id,
                    last_message_at = EXCLUDED.last_message_at
            "#,
        )
        .bind(envelope.conversation_id)
        .bind(envelope.message_id)
        .bind(envelope.created_at)
        .execute(&self.db)
        .await?;

        self.invalidate_caches(envelope).await;

        Ok(PersistOutcome::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnvelopeMetadata, MessageEnvelope, MessageFlags};
    use chrono::Utc;

    #[test]
    fn invalidates_all_three_cache_families() {
        let recipient_a = Uuid::new_v4();
        let recipient_b = Uuid::new_v4();
        let envelope = MessageEnvelope {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sender_name: None,
            created_at: Utc::now(),
            idempotency_key: "k".into(),
            correlation_id: "c".into(),
            metadata: EnvelopeMetadata {
                content: "hi".into(),
                content_type: "text".into(),
                recipient_ids: vec![recipient_a, recipient_b],
                flags: MessageFlags::default(),
            },
            retry_count: 0,
        };

        let keys = PostgresMessageStore::cache_keys(&envelope);
        assert_eq!(keys.len(), 4);
        assert!(keys.contains(&recent_messages_cache_key(envelope.conversation_id)));
        assert!(keys.contains(&conversation_meta_cache_key(envelope.conversation_id)));
        assert!(keys.contains(&unread_count_cache_key(recipient_a)));
        assert!(keys.contains(&unread_count_cache_key(recipient_b)));
    }
}
