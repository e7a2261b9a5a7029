//! TTL-backed presence registry. "Who is online" lives here, shared
//! across process instances; "how to reach them" is the emitter's job.
//! A socket that stops heartbeating silently ages out; TTL expiry is the
//! only disconnect detection for ungraceful terminations.

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppResult;

fn online_set_key(user_id: Uuid) -> String {
    format!("presence:online:{}", user_id)
}

fn socket_record_key(socket_id: &str) -> String {
    format!("presence:socket:{}", socket_id)
}

/// Splits set members by liveness of their socket record. A member whose
/// record expired is stale: it goes to the removal list and never into
/// the online map, so a user whose sockets all expired reads as offline.
fn partition_live_sockets(
    flat: Vec<(Uuid, String)>,
    live_flags: Vec<bool>,
) -> (HashMap<Uuid, Vec<String>>, Vec<(Uuid, String)>) {
    let mut online: HashMap<Uuid, Vec<String>> = HashMap::new();
    let mut stale = Vec::new();
    for ((user_id, socket_id), live) in flat.into_iter().zip(live_flags) {
        if live {
            online.entry(user_id).or_default().push(socket_id);
        } else {
            stale.push((user_id, socket_id));
        }
    }
    (online, stale)
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn register_socket(
        &self,
        user_id: Uuid,
        socket_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<()>;

    /// Refreshes both TTLs and `last_seen_at` without altering membership.
    async fn heartbeat(&self, user_id: Uuid, socket_id: &str) -> AppResult<()>;

    async fn unregister_socket(&self, user_id: Uuid, socket_id: &str) -> AppResult<()>;

    /// One batched read. Users with no live socket are absent from the
    /// result; callers treat absence as "offline", never as an error.
    async fn get_online_recipients(
        &self,
        user_ids: &[Uuid],
    ) -> AppResult<HashMap<Uuid, Vec<String>>>;
}

#[derive(Clone)]
pub struct RedisPresenceRegistry {
    client: Client,
    ttl: Duration,
}

impl RedisPresenceRegistry {
    pub fn new(client: Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceRegistry {
    async fn register_socket(
        &self,
        user_id: Uuid,
        socket_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let metadata = metadata
            .map(|m| m.to_string())
            .unwrap_or_else(|| "{}".to_string());
        let ttl = self.ttl.as_secs() as i64;
        let set_key = online_set_key(user_id);
        let record_key = socket_record_key(socket_id);

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::pipe()
            .sadd(&set_key, socket_id)
            .ignore()
            .expire(&set_key, ttl)
            .ignore()
            .hset_multiple(
                &record_key,
                &[
                    ("user_id", user_id.to_string().as_str()),
                    ("connected_at", now.as_str()),
                    ("last_seen_at", now.as_str()),
                    ("metadata", metadata.as_str()),
                ],
            )
            .ignore()
            .expire(&record_key, ttl)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, user_id: Uuid, socket_id: &str) -> AppResult<()> {
        let ttl = self.ttl.as_secs() as i64;
        let set_key = online_set_key(user_id);
        let record_key = socket_record_key(socket_id);

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::pipe()
            .expire(&set_key, ttl)
            .ignore()
            .hset(&record_key, "last_seen_at", Utc::now().to_rfc3339())
            .ignore()
            .expire(&record_key, ttl)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn unregister_socket(&self, user_id: Uuid, socket_id: &str) -> AppResult<()> {
        let set_key = online_set_key(user_id);
        let record_key = socket_record_key(socket_id);

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::pipe()
            .srem(&set_key, socket_id)
            .ignore()
            .del(&record_key)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        // No dangling empty set waiting on TTL. SCARD/DEL is not atomic:
        // a register racing between the two can lose its fresh member
        // until its next heartbeat re-adds it. Tolerated; the heartbeat
        // interval bounds the window.
        let remaining: i64 = conn.scard(&set_key).await?;
        if remaining == 0 {
            conn.del::<_, ()>(&set_key).await?;
        }
        Ok(())
    }

    async fn get_online_recipients(
        &self,
        user_ids: &[Uuid],
    ) -> AppResult<HashMap<Uuid, Vec<String>>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut members_pipe = redis::pipe();
        for user_id in user_ids {
            members_pipe.smembers(online_set_key(*user_id));
        }
        let memberships: Vec<Vec<String>> = members_pipe.query_async(&mut conn).await?;

        // A member whose socket record expired is stale: its owner stopped
        // heartbeating but the set key was refreshed by a sibling socket.
        let flat: Vec<(Uuid, String)> = user_ids
            .iter()
            .zip(memberships)
            .flat_map(|(user_id, sockets)| {
                sockets.into_iter().map(move |s| (*user_id, s))
            })
            .collect();
        if flat.is_empty() {
            return Ok(HashMap::new());
        }

        let mut exists_pipe = redis::pipe();
        for (_, socket_id) in &flat {
            exists_pipe.exists(socket_record_key(socket_id));
        }
        let live_flags: Vec<bool> = exists_pipe.query_async(&mut conn).await?;

        let (online, stale) = partition_live_sockets(flat, live_flags);
        if !stale.is_empty() {
            let mut stale_pipe = redis::pipe();
            for (user_id, socket_id) in &stale {
                stale_pipe.srem(online_set_key(*user_id), socket_id).ignore();
            }
            // Lazy cleanup only; a failure here costs nothing but memory.
            let _: Result<(), _> = stale_pipe.query_async(&mut conn).await;
        }

        Ok(online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        let user = Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap();
        assert_eq!(
            online_set_key(user),
            "presence:online:11111111-2222-3333-4444-555555555555"
        );
        assert_eq!(socket_record_key("sock-1"), "presence:socket:sock-1");
    }

    #[test]
    fn expired_socket_is_stale_and_kept_out_of_the_online_map() {
        let user = Uuid::new_v4();
        let flat = vec![
            (user, "sock-live".to_string()),
            (user, "sock-dead".to_string()),
        ];

        let (online, stale) = partition_live_sockets(flat, vec![true, false]);

        assert_eq!(online[&user], vec!["sock-live".to_string()]);
        assert_eq!(stale, vec![(user, "sock-dead".to_string())]);
    }

    #[test]
    fn user_with_only_expired_sockets_reads_as_offline() {
        let silent = Uuid::new_v4();
        let active = Uuid::new_v4();
        let flat = vec![
            (silent, "sock-a".to_string()),
            (active, "sock-b".to_string()),
        ];

        let (online, stale) = partition_live_sockets(flat, vec![false, true]);

        // The silent user is simply absent, never an empty entry.
        assert!(!online.contains_key(&silent));
        assert!(online.contains_key(&active));
        assert_eq!(stale.len(), 1);
    }
}
