//! Delivery pipeline orchestrator: one long-lived worker task per
//! partition, each running a poll → process → acknowledge loop. Workers
//! are tracked by partition index and stopped through a watch channel, so
//! shutdown is deterministic: no new poll after the flag flips, and a
//! batch in flight always finishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::queue::{DeliveryEntry, DeliveryQueue};

use super::processor::MessageProcessor;

/// Dead-letter gate. The count-then-increment convention means an
/// envelope gets one initial delivery plus `max_retries` redeliveries
/// before it is parked.
pub fn should_dead_letter(retry_count: u32, max_retries: u32) -> bool {
    retry_count >= max_retries
}

pub struct DeliveryConsumer {
    queue: Arc<DeliveryQueue>,
    processor: Arc<MessageProcessor>,
    config: Arc<Config>,
}

pub struct PipelineHandle {
    workers: HashMap<u32, JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PipelineHandle {
    /// Signals every partition worker and waits for in-flight batches to
    /// finish. Bounded by the poll timeout: a worker blocked on an empty
    /// stream notices the flag on its next loop iteration.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (partition, handle) in self.workers {
            if let Err(e) = handle.await {
                error!(partition, error = %e, "partition worker join failed");
            }
        }
    }
}

impl DeliveryConsumer {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        processor: Arc<MessageProcessor>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Starts exactly one worker per partition.
    pub fn start(&self) -> PipelineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = HashMap::new();

        for partition in 0..self.queue.partitions() {
            let queue = Arc::clone(&self.queue);
            let processor = Arc::clone(&self.processor);
            let config = Arc::clone(&self.config);
            let shutdown = shutdown_rx.clone();
            workers.insert(
                partition,
                tokio::spawn(async move {
                    partition_worker(partition, queue, processor, config, shutdown).await;
                }),
            );
        }

        info!(partitions = self.queue.partitions(), "delivery pipeline started");
        PipelineHandle {
            workers,
            shutdown_tx,
        }
    }
}

async fn partition_worker(
    partition: u32,
    queue: Arc<DeliveryQueue>,
    processor: Arc<MessageProcessor>,
    config: Arc<Config>,
    shutdown: watch::Receiver<bool>,
) {
    let consumer_name = format!("partition-{}-{}", partition, Uuid::new_v4());
    info!(partition, consumer = %consumer_name, "partition worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Stale pending entries first: these are the redeliveries, carrying
        // their broker-side delivery count as the retry count.
        let mut entries = match queue
            .claim_stale(
                partition,
                &consumer_name,
                config.reclaim_idle,
                config.consumer_batch_size,
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(partition, error = %e, "reclaim failed");
                Vec::new()
            }
        };

        if entries.is_empty() {
            if *shutdown.borrow() {
                break;
            }
            entries = match queue
                .read_batch(
                    partition,
                    &consumer_name,
                    config.consumer_batch_size,
                    config.poll_timeout,
                )
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    error!(partition, error = %e, "poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
        }
        if entries.is_empty() {
            continue;
        }

        // Strictly sequential within the partition: this is what preserves
        // per-conversation ordering.
        let mut to_ack: Vec<String> = Vec::with_capacity(entries.len());
        for entry in entries {
            match processor.process_message(&entry.envelope).await {
                Ok(()) => to_ack.push(entry.stream_id),
                Err(e) => {
                    if let Some(stream_id) =
                        handle_failure(&queue, partition, entry, e, config.max_retries).await
                    {
                        to_ack.push(stream_id);
                    }
                }
            }
        }

        // One batch acknowledgement for everything settled this round.
        if let Err(e) = queue.ack(partition, &to_ack).await {
            error!(partition, error = %e, "batch ack failed; entries will be redelivered");
        }
    }

    info!(partition, "partition worker stopped");
}

/// Failed envelopes are either parked (retry budget spent) or deliberately
/// left unacknowledged so the broker's idle-reclaim redelivers them.
/// Returns the stream id to acknowledge when the entry is settled.
async fn handle_failure(
    queue: &DeliveryQueue,
    partition: u32,
    entry: DeliveryEntry,
    error: AppError,
    max_retries: u32,
) -> Option<String> {
    let envelope = &entry.envelope;
    if should_dead_letter(envelope.retry_count, max_retries) {
        error!(
            partition,
            message_id = %envelope.message_id,
            retry_count = envelope.retry_count,
            error = %error,
            "retry budget exhausted, dead-lettering"
        );
        match queue.dead_letter(envelope, &error.to_string()).await {
            Ok(()) => Some(entry.stream_id),
            Err(e) => {
                // Keep the entry pending rather than lose it.
                error!(partition, message_id = %envelope.message_id, error = %e, "dead-letter write failed");
                None
            }
        }
    } else {
        warn!(
            partition,
            message_id = %envelope.message_id,
            retry_count = envelope.retry_count,
            retryable = error.is_retryable(),
            error = %error,
            "processing failed, leaving pending for redelivery"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_gate_trips_at_ceiling() {
        assert!(!should_dead_letter(0, 3));
        assert!(!should_dead_letter(2, 3));
        assert!(should_dead_letter(3, 3));
        assert!(should_dead_letter(4, 3));
    }
}
