//! Online fanout: one batched presence read, then a `message.new` emit to
//! every socket of every online recipient. Outcomes are per-recipient and
//! exhaustive so the fanout/push split is testable.

use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::emitter::SocketEmitter;
use crate::error::AppResult;
use crate::models::{MessageEnvelope, MessageEvent};
use crate::presence::PresenceStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { socket_count: usize },
    Offline,
    EmitError { reason: String },
}

impl DeliveryOutcome {
    pub fn is_offline(&self) -> bool {
        matches!(self, DeliveryOutcome::Offline)
    }
}

#[derive(Debug, Clone)]
pub struct RecipientDelivery {
    pub user_id: Uuid,
    pub outcome: DeliveryOutcome,
}

pub struct FanoutService {
    presence: Arc<dyn PresenceStore>,
    emitter: Arc<dyn SocketEmitter>,
}

impl FanoutService {
    pub fn new(presence: Arc<dyn PresenceStore>, emitter: Arc<dyn SocketEmitter>) -> Self {
        Self { presence, emitter }
    }

    /// Resolves presence for all recipients in one call, then fans the
    /// event out to every socket of every online recipient. Emit failures
    /// are isolated per recipient; only the batched presence read can fail
    /// the envelope as a whole.
    pub async fn fanout_to_online_users(
        &self,
        envelope: &MessageEnvelope,
    ) -> AppResult<Vec<RecipientDelivery>> {
        let recipients = &envelope.metadata.recipient_ids;
        let online = self.presence.get_online_recipients(recipients).await?;
        let event = MessageEvent::from_envelope(envelope);

        let mut results = Vec::with_capacity(recipients.len());
        for user_id in recipients {
            let Some(sockets) = online.get(user_id) else {
                results.push(RecipientDelivery {
                    user_id: *user_id,
                    outcome: DeliveryOutcome::Offline,
                });
                continue;
            };

            let mut delivered = 0usize;
            let mut last_error: Option<String> = None;
            for socket_id in sockets {
                match self.emitter.emit(socket_id, &event).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(
                            user_id = %user_id,
                            socket_id = %socket_id,
                            error = %e,
                            "emit failed for one socket"
                        );
                        last_error = Some(e.to_string());
                    }
                }
            }

            let outcome = if delivered > 0 {
                DeliveryOutcome::Delivered {
                    socket_count: delivered,
                }
            } else {
                DeliveryOutcome::EmitError {
                    reason: last_error.unwrap_or_else(|| "no sockets emitted".to_string()),
                }
            };
            results.push(RecipientDelivery {
                user_id: *user_id,
                outcome,
            });
        }

        debug!(
            message_id = %envelope.message_id,
            recipients = recipients.len(),
            online = results.iter().filter(|r| !r.outcome.is_offline()).count(),
            "fanout complete"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::{EnvelopeMetadata, MessageFlags};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedPresence {
        online: HashMap<Uuid, Vec<String>>,
    }

    #[async_trait]
    impl PresenceStore for FixedPresence {
        async fn register_socket(
            &self,
            _: Uuid,
            _: &str,
            _: Option<serde_json::Value>,
        ) -> AppResult<()> {
            Ok(())
        }
        async fn heartbeat(&self, _: Uuid, _: &str) -> AppResult<()> {
            Ok(())
        }
        async fn unregister_socket(&self, _: Uuid, _: &str) -> AppResult<()> {
            Ok(())
        }
        async fn get_online_recipients(
            &self,
            user_ids: &[Uuid],
        ) -> AppResult<HashMap<Uuid, Vec<String>>> {
            Ok(user_ids
                .iter()
                .filter_map(|id| self.online.get(id).map(|s| (*id, s.clone())))
                .collect())
        }
    }

    struct RecordingEmitter {
        emitted: Mutex<Vec<String>>,
        failing_socket: Option<String>,
    }

    #[async_trait]
    impl SocketEmitter for RecordingEmitter {
        async fn emit(&self, socket_id: &str, _event: &MessageEvent) -> AppResult<()> {
            if self.failing_socket.as_deref() == Some(socket_id) {
                return Err(AppError::Emit("connection reset".into()));
            }
            self.emitted.lock().unwrap().push(socket_id.to_string());
            Ok(())
        }
    }

    fn envelope_for(recipients: Vec<Uuid>) -> MessageEnvelope {
        MessageEnvelope {
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
                recipient_ids: recipients,
                flags: MessageFlags::default(),
            },
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn splits_recipients_into_online_and_offline() {
        let online_user = Uuid::new_v4();
        let offline_user = Uuid::new_v4();
        let presence = FixedPresence {
            online: HashMap::from([(
                online_user,
                vec!["sock-1".to_string(), "sock-2".to_string()],
            )]),
        };
        let emitter = Arc::new(RecordingEmitter {
            emitted: Mutex::new(Vec::new()),
            failing_socket: None,
        });
        let fanout = FanoutService::new(Arc::new(presence), emitter.clone());

        let results = fanout
            .fanout_to_online_users(&envelope_for(vec![online_user, offline_user]))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let by_user: HashMap<Uuid, &DeliveryOutcome> =
            results.iter().map(|r| (r.user_id, &r.outcome)).collect();
        assert_eq!(
            by_user[&online_user],
            &DeliveryOutcome::Delivered { socket_count: 2 }
        );
        assert_eq!(by_user[&offline_user], &DeliveryOutcome::Offline);
        assert_eq!(emitter.emitted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn emit_failure_is_isolated_per_recipient() {
        let broken_user = Uuid::new_v4();
        let healthy_user = Uuid::new_v4();
        let presence = FixedPresence {
            online: HashMap::from([
                (broken_user, vec!["dead-sock".to_string()]),
                (healthy_user, vec!["sock-ok".to_string()]),
            ]),
        };
        let emitter = Arc::new(RecordingEmitter {
            emitted: Mutex::new(Vec::new()),
            failing_socket: Some("dead-sock".to_string()),
        });
        let fanout = FanoutService::new(Arc::new(presence), emitter.clone());

        let results = fanout
            .fanout_to_online_users(&envelope_for(vec![broken_user, healthy_user]))
            .await
            .unwrap();

        let by_user: HashMap<Uuid, &DeliveryOutcome> =
            results.iter().map(|r| (r.user_id, &r.outcome)).collect();
        assert!(matches!(
            by_user[&broken_user],
            DeliveryOutcome::EmitError { .. }
        ));
        assert_eq!(
            by_user[&healthy_user],
            &DeliveryOutcome::Delivered { socket_count: 1 }
        );
    }

    #[tokio::test]
    async fn partial_socket_failure_still_counts_as_delivered() {
        let user = Uuid::new_v4();
        let presence = FixedPresence {
            online: HashMap::from([(
                user,
                vec!["dead-sock".to_string(), "sock-ok".to_string()],
            )]),
        };
        let emitter = Arc::new(RecordingEmitter {
            emitted: Mutex::new(Vec::new()),
            failing_socket: Some("dead-sock".to_string()),
        });
        let fanout = FanoutService::new(Arc::new(presence), emitter);

        let results = fanout
            .fanout_to_online_users(&envelope_for(vec![user]))
            .await
            .unwrap();
        assert_eq!(
            results[0].outcome,
            DeliveryOutcome::Delivered { socket_count: 1 }
        );
    }
}
