//! Per-envelope processing: persist, fan out, schedule push. One envelope
//! is one independent unit; a failure here fails only this envelope, and
//! already-committed steps are never rolled back (replays no-op through
//! the idempotent persistence step).

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::MessageEnvelope;
use crate::services::fanout::FanoutService;
use crate::services::persistence::{MessageStore, PersistOutcome};
use crate::services::push_scheduler::PushScheduler;

pub struct MessageProcessor {
    store: Arc<dyn MessageStore>,
    fanout: FanoutService,
    scheduler: PushScheduler,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        fanout: FanoutService,
        scheduler: PushScheduler,
    ) -> Self {
        Self {
            store,
            fanout,
            scheduler,
        }
    }

    pub async fn process_message(&self, envelope: &MessageEnvelope) -> AppResult<()> {
        // Persistence errors propagate: the persisted log is the core
        // invariant, and the broker's redelivery is the retry path.
        match self.store.store_message(envelope).await? {
            PersistOutcome::IdempotentHit => {
                // Replay of an already-committed send: no fanout, no push.
                return Ok(());
            }
            PersistOutcome::Inserted => {}
        }

        let deliveries = self.fanout.fanout_to_online_users(envelope).await?;

        let offline: Vec<Uuid> = deliveries
            .iter()
            .filter(|d| d.outcome.is_offline())
            .map(|d| d.user_id)
            .collect();
        if !offline.is_empty() {
            self.scheduler.schedule_offline(envelope, &offline).await;
        }

        debug!(
            message_id = %envelope.message_id,
            correlation_id = %envelope.correlation_id,
            recipients = envelope.metadata.recipient_ids.len(),
            offline = offline.len(),
            "envelope processed"
        );
        Ok(())
    }
}
