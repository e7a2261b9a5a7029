use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::envelope::MessageEnvelope;

/// Deferred notification work for one offline recipient. Lives on the
/// push stream, fully isolated from the main delivery stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTask {
    pub task_id: Uuid,
    pub user_id: Uuid,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    /// Never the full message body.
    pub content_preview: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    /// Do not attempt delivery before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<DateTime<Utc>>,
}

impl PushTask {
    pub fn from_envelope(envelope: &MessageEnvelope, user_id: Uuid, preview_max: usize) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            user_id,
            message_id: envelope.message_id,
            conversation_id: envelope.conversation_id,
            sender_id: envelope.sender_id,
            sender_name: envelope
                .sender_name
                .clone()
                .unwrap_or_else(|| "New message".to_string()),
            content_preview: truncate_preview(&envelope.metadata.content, preview_max),
            created_at: envelope.created_at,
            retry_count: 0,
            backoff_until: None,
        }
    }
}

/// Char-boundary-safe truncation; byte slicing would panic on multi-byte
/// content.
pub fn truncate_preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        content.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::envelope::{EnvelopeMetadata, MessageFlags};

    fn envelope_with_content(content: &str) -> MessageEnvelope {
        MessageEnvelope {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sender_name: Some("bob".into()),
            created_at: Utc::now(),
            idempotency_key: "k".into(),
            correlation_id: "c".into(),
            metadata: EnvelopeMetadata {
                content: content.into(),
                content_type: "text".into(),
                recipient_ids: vec![],
                flags: MessageFlags::default(),
            },
            retry_count: 0,
        }
    }

    #[test]
    fn short_content_kept_verbatim() {
        assert_eq!(truncate_preview("hello", 100), "hello");
    }

    #[test]
    fn long_content_clamped_to_max_chars() {
        let long = "x".repeat(250);
        let preview = truncate_preview(&long, 100);
        assert_eq!(preview.chars().count(), 100);
    }

    #[test]
    fn truncation_respects_multibyte_boundaries() {
        let long = "日本語のメッセージ".repeat(30);
        let preview = truncate_preview(&long, 100);
        assert_eq!(preview.chars().count(), 100);
        assert!(long.starts_with(&preview));
    }

    #[test]
    fn task_built_from_envelope_bounds_preview() {
        let envelope = envelope_with_content(&"a".repeat(500));
        let task = PushTask::from_envelope(&envelope, Uuid::new_v4(), 100);
        assert_eq!(task.content_preview.chars().count(), 100);
        assert_eq!(task.sender_name, "bob");
        assert_eq!(task.retry_count, 0);
        assert!(task.backoff_until.is_none());
    }
}
