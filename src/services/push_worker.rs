//! Push consumer pool: a separate, lower-concurrency pipeline draining
//! the push stream. Decoupled from the delivery partitions so gateway
//! backpressure never starves message delivery.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::PushTask;
use crate::queue::{PushEntry, PushQueue, PushTaskSink};
use crate::services::device_tokens::{is_supported_platform, DeviceTokenStore};
use crate::services::push_gateway::PushTransport;

/// Fixed-table exponential backoff, clamped at the last entry.
const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
];

pub fn calculate_backoff(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(BACKOFF_SCHEDULE.len() - 1);
    BACKOFF_SCHEDULE[idx]
}

/// How long a worker holds a still-backed-off task before requeueing it.
/// Without a pause the requeued copy immediately satisfies another
/// worker's blocked read and the task cycles through the group for its
/// whole window. Capped at the poll timeout so shutdown stays responsive.
pub fn requeue_delay(
    backoff_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cap: Duration,
) -> Duration {
    match backoff_until {
        Some(until) if until > now => (until - now).to_std().unwrap_or(Duration::ZERO).min(cap),
        _ => Duration::ZERO,
    }
}

/// What to do with a dequeued task after one handling pass.
#[derive(Debug)]
pub enum TaskDisposition {
    /// Terminal: delivered, or nothing to deliver.
    Completed,
    /// Return to the queue, possibly with an updated backoff window.
    Deferred(PushTask),
    /// Retry budget exhausted; park with the triggering status.
    DeadLetter(String),
}

pub struct PushConsumer {
    queue: PushQueue,
    tokens: Arc<dyn DeviceTokenStore>,
    transport: Arc<dyn PushTransport>,
    config: Arc<Config>,
}

pub struct PushPoolHandle {
    workers: HashMap<u32, JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PushPoolHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (idx, handle) in self.workers {
            if let Err(e) = handle.await {
                error!(worker = idx, error = %e, "push worker join failed");
            }
        }
    }
}

impl PushConsumer {
    pub fn new(
        queue: PushQueue,
        tokens: Arc<dyn DeviceTokenStore>,
        transport: Arc<dyn PushTransport>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            queue,
            tokens,
            transport,
            config,
        }
    }

    pub fn start(self: Arc<Self>) -> PushPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = HashMap::new();
        for idx in 0..self.config.push_worker_count {
            let consumer = Arc::clone(&self);
            let shutdown = shutdown_rx.clone();
            workers.insert(
                idx,
                tokio::spawn(async move {
                    consumer.run_worker(idx, shutdown).await;
                }),
            );
        }
        PushPoolHandle {
            workers,
            shutdown_tx,
        }
    }

    async fn run_worker(&self, idx: u32, shutdown: watch::Receiver<bool>) {
        let consumer_name = format!("push-{}-{}", idx, Uuid::new_v4());
        info!(worker = idx, consumer = %consumer_name, "push worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut entries = match self
                .queue
                .claim_stale(
                    &consumer_name,
                    self.config.reclaim_idle,
                    self.config.consumer_batch_size,
                )
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(worker = idx, error = %e, "push reclaim failed");
                    Vec::new()
                }
            };

            if entries.is_empty() {
                if *shutdown.borrow() {
                    break;
                }
                entries = match self
                    .queue
                    .read_batch(
                        &consumer_name,
                        self.config.consumer_batch_size,
                        self.config.poll_timeout,
                    )
                    .await
                {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(worker = idx, error = %e, "push poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
            }

            for entry in entries {
                self.settle(entry).await;
            }
        }

        info!(worker = idx, "push worker stopped");
    }

    async fn settle(&self, entry: PushEntry) {
        let PushEntry { stream_id, task } = entry;
        let task_id = task.task_id;
        let disposition = self.handle_task(task.clone(), Utc::now()).await;
        let result = match disposition {
            TaskDisposition::Completed => self.queue.ack(&stream_id).await,
            TaskDisposition::Deferred(deferred) => {
                let wait = requeue_delay(
                    deferred.backoff_until,
                    Utc::now(),
                    self.config.poll_timeout,
                );
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                // Requeue-then-ack: the deferred copy must exist before the
                // original claim is released, or a crash loses the task.
                match self.queue.enqueue(&deferred).await {
                    Ok(()) => self.queue.ack(&stream_id).await,
                    Err(e) => Err(e),
                }
            }
            TaskDisposition::DeadLetter(reason) => {
                error!(task_id = %task_id, reason = %reason, "push task dead-lettered");
                match self.queue.dead_letter(&task, &reason).await {
                    Ok(()) => self.queue.ack(&stream_id).await,
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = result {
            // Left pending; the reclaim pass redelivers it.
            warn!(task_id = %task_id, error = %e, "failed to settle push entry");
        }
    }

    /// One handling pass over a task. Pure with respect to the queue so it
    /// can be exercised directly with mock token stores and transports.
    pub async fn handle_task(&self, mut task: PushTask, now: DateTime<Utc>) -> TaskDisposition {
        if let Some(until) = task.backoff_until {
            if until > now {
                // Still inside the backoff window: no delivery attempt.
                return TaskDisposition::Deferred(task);
            }
        }

        let tokens = match self.tokens.tokens_for_user(task.user_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "token lookup failed");
                return self.defer_or_dead_letter(task, now, e.to_string());
            }
        };

        let deliverable: Vec<String> = tokens
            .into_iter()
            .filter(|t| is_supported_platform(&t.platform))
            .map(|t| t.token)
            .collect();

        if deliverable.is_empty() {
            debug!(
                task_id = %task.task_id,
                user_id = %task.user_id,
                "no registered devices, nothing to deliver"
            );
            return TaskDisposition::Completed;
        }

        let data = json!({
            "messageId": task.message_id,
            "conversationId": task.conversation_id,
            "senderId": task.sender_id,
        });
        let result = self
            .transport
            .send_batch(&deliverable, &task.sender_name, &task.content_preview, data)
            .await;

        if result.success {
            debug!(task_id = %task.task_id, status = %result.status, "push delivered");
            TaskDisposition::Completed
        } else {
            warn!(
                task_id = %task.task_id,
                retry = task.retry_count,
                status = %result.status,
                "push delivery failed"
            );
            task.retry_count += 1;
            self.defer_or_dead_letter_incremented(task, now, result.status)
        }
    }

    fn defer_or_dead_letter(
        &self,
        mut task: PushTask,
        now: DateTime<Utc>,
        reason: String,
    ) -> TaskDisposition {
        task.retry_count += 1;
        self.defer_or_dead_letter_incremented(task, now, reason)
    }

    fn defer_or_dead_letter_incremented(
        &self,
        mut task: PushTask,
        now: DateTime<Utc>,
        reason: String,
    ) -> TaskDisposition {
        if task.retry_count >= self.config.push_max_retries {
            return TaskDisposition::DeadLetter(reason);
        }
        let delay = calculate_backoff(task.retry_count.saturating_sub(1));
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        task.backoff_until = Some(now + delay);
        TaskDisposition::Deferred(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_clamped() {
        assert!(calculate_backoff(0) <= calculate_backoff(1));
        assert!(calculate_backoff(1) <= calculate_backoff(2));
        assert_eq!(calculate_backoff(2), calculate_backoff(3));
        assert_eq!(calculate_backoff(2), calculate_backoff(100));
    }

    #[test]
    fn backoff_table_values() {
        assert_eq!(calculate_backoff(0), Duration::from_secs(1));
        assert_eq!(calculate_backoff(1), Duration::from_secs(5));
        assert_eq!(calculate_backoff(2), Duration::from_secs(30));
    }

    #[test]
    fn requeue_delay_is_zero_without_a_window() {
        let now = Utc::now();
        assert_eq!(requeue_delay(None, now, Duration::from_secs(5)), Duration::ZERO);
        assert_eq!(
            requeue_delay(
                Some(now - chrono::Duration::seconds(1)),
                now,
                Duration::from_secs(5)
            ),
            Duration::ZERO
        );
    }

    #[test]
    fn requeue_delay_waits_out_a_short_window() {
        let now = Utc::now();
        assert_eq!(
            requeue_delay(
                Some(now + chrono::Duration::seconds(2)),
                now,
                Duration::from_secs(5)
            ),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn requeue_delay_is_capped_by_the_poll_timeout() {
        let now = Utc::now();
        assert_eq!(
            requeue_delay(
                Some(now + chrono::Duration::seconds(30)),
                now,
                Duration::from_secs(5)
            ),
            Duration::from_secs(5)
        );
    }
}
