use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::envelope::{MessageEnvelope, MessageFlags};

pub const EVENT_MESSAGE_NEW: &str = "message.new";

/// Structured event emitted to every online socket of a recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub event: String,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
    /// Always "sent": delivery to this socket does not imply read receipt.
    pub state: String,
    pub metadata: MessageFlags,
}

impl MessageEvent {
    pub fn from_envelope(envelope: &MessageEnvelope) -> Self {
        Self {
            event: EVENT_MESSAGE_NEW.to_string(),
            message_id: envelope.message_id,
            conversation_id: envelope.conversation_id,
            sender_id: envelope.sender_id,
            content: envelope.metadata.content.clone(),
            content_type: envelope.metadata.content_type.clone(),
            created_at: envelope.created_at,
            correlation_id: envelope.correlation_id.clone(),
            state: "sent".to_string(),
            metadata: envelope.metadata.flags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::envelope::EnvelopeMetadata;

    #[test]
    fn carries_correlation_and_sent_state() {
        let envelope = MessageEnvelope {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            sender_name: None,
            created_at: Utc::now(),
            idempotency_key: "k".into(),
            correlation_id: "trace-42".into(),
            metadata: EnvelopeMetadata {
                content: "hi".into(),
                content_type: "text".into(),
                recipient_ids: vec![],
                flags: MessageFlags {
                    reply_to_id: Some(Uuid::new_v4()),
                    thread_id: None,
                },
            },
            retry_count: 0,
        };

        let event = MessageEvent::from_envelope(&envelope);
        assert_eq!(event.event, EVENT_MESSAGE_NEW);
        assert_eq!(event.state, "sent");
        assert_eq!(event.correlation_id, "trace-42");
        assert_eq!(event.metadata.reply_to_id, envelope.metadata.flags.reply_to_id);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "sent");
        assert!(json["metadata"].get("replyToId").is_some());
    }
}
