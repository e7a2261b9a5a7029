//! Partitioned delivery queue and push task queue on Redis Streams.
//! Consumer groups give broker-enforced single-claim semantics and
//! idle-timeout redelivery; no application-level locking.

use uuid::Uuid;

pub mod delivery;
pub mod push;

pub use delivery::{DeliveryEntry, DeliveryQueue};
pub use push::{PushEntry, PushQueue, PushTaskSink};

pub const DELIVERY_GROUP: &str = "delivery-pipeline";
pub const DELIVERY_DLQ_KEY: &str = "delivery:dlq";
pub const PUSH_GROUP: &str = "push-workers";
pub const PUSH_STREAM_KEY: &str = "push:tasks";
pub const PUSH_DLQ_KEY: &str = "push:dlq";

pub fn delivery_stream_key(partition: u32) -> String {
    format!("delivery:stream:{}", partition)
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Routes a conversation to its partition. FNV-1a over the raw UUID bytes:
/// the function must stay byte-for-byte stable across deployments, since
/// re-routing a live conversation breaks its ordering guarantee. Do not
/// substitute a std hasher (those are not stable across releases).
pub fn partition_for_conversation(conversation_id: Uuid, partitions: u32) -> u32 {
    (fnv1a64(conversation_id.as_bytes()) % u64::from(partitions)) as u32
}
