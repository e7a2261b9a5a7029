use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable unit of queued work representing one logical message send.
/// Produced by the API layer, serialized as the single `envelope` field
/// of a delivery stream entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    /// Attribution only; not verified here.
    pub sender_id: Uuid,
    /// Display name carried along so the push task can render a title
    /// without a user lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Sole de-duplication key at the storage boundary. Unique per
    /// logical send attempt, shared by all redeliveries of that attempt.
    pub idempotency_key: String,
    /// Opaque tracing token, propagated to emitted events.
    pub correlation_id: String,
    pub metadata: EnvelopeMetadata,
    /// Redelivery counter. Pipeline-local: reconstructed from the
    /// broker's delivery count when an entry is reclaimed, never stored.
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub content: String,
    pub content_type: String,
    pub recipient_ids: Vec<Uuid>,
    #[serde(default)]
    pub flags: MessageFlags,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MessageEnvelope {
        MessageEnvelope {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sender_name: Some("alice".into()),
            created_at: Utc::now(),
            idempotency_key: "send-1".into(),
            correlation_id: "corr-1".into(),
            metadata: EnvelopeMetadata {
                content: "hello".into(),
                content_type: "text".into(),
                recipient_ids: vec![Uuid::new_v4()],
                flags: MessageFlags::default(),
            },
            retry_count: 0,
        }
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("messageId").is_some());
        assert!(json.get("conversationId").is_some());
        assert!(json.get("idempotencyKey").is_some());
        assert!(json["metadata"].get("recipientIds").is_some());
        assert!(json["metadata"]["flags"].get("replyToId").is_none());
    }

    #[test]
    fn retry_count_defaults_on_deserialize() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json.as_object_mut().unwrap().remove("retryCount");
        let env: MessageEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(env.retry_count, 0);
    }

    #[test]
    fn round_trips() {
        let env = sample();
        let back: MessageEnvelope =
            serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(back.message_id, env.message_id);
        assert_eq!(back.metadata.recipient_ids, env.metadata.recipient_ids);
    }
}
