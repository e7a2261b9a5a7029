//! Builds push tasks for offline recipients and hands them to the push
//! queue. Invoked synchronously from the main pipeline, so failures here
//! are logged and counted, never thrown: push is best-effort
//! notification, not delivery confirmation.

use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{MessageEnvelope, PushTask};
use crate::queue::PushTaskSink;

pub struct PushScheduler {
    sink: Arc<dyn PushTaskSink>,
    preview_max: usize,
}

impl PushScheduler {
    pub fn new(sink: Arc<dyn PushTaskSink>, preview_max: usize) -> Self {
        Self { sink, preview_max }
    }

    /// Enqueues one task per offline recipient. Returns how many were
    /// actually scheduled; the difference is logged, not surfaced.
    pub async fn schedule_offline(
        &self,
        envelope: &MessageEnvelope,
        offline_recipients: &[Uuid],
    ) -> usize {
        let mut scheduled = 0usize;
        for user_id in offline_recipients {
            let task = PushTask::from_envelope(envelope, *user_id, self.preview_max);
            match self.sink.enqueue(&task).await {
                Ok(()) => scheduled += 1,
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        message_id = %envelope.message_id,
                        error = %e,
                        "failed to schedule push task"
                    );
                }
            }
        }
        if scheduled > 0 {
            debug!(
                message_id = %envelope.message_id,
                scheduled,
                "push tasks scheduled for offline recipients"
            );
        }
        scheduled
    }
}
