//! Fan-out transport addressable by socket id from any process instance.
//! The instance that owns a connection subscribes to that socket's
//! channel; publishing here reaches it regardless of which process we are.

use async_trait::async_trait;
use redis::{AsyncCommands, Client};

use crate::error::{AppError, AppResult};
use crate::models::MessageEvent;

fn socket_channel(socket_id: &str) -> String {
    format!("socket:{}", socket_id)
}

#[async_trait]
pub trait SocketEmitter: Send + Sync {
    async fn emit(&self, socket_id: &str, event: &MessageEvent) -> AppResult<()>;
}

#[derive(Clone)]
pub struct RedisSocketEmitter {
    client: Client,
}

impl RedisSocketEmitter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SocketEmitter for RedisSocketEmitter {
    async fn emit(&self, socket_id: &str, event: &MessageEvent) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Emit(e.to_string()))?;
        conn.publish::<_, _, ()>(socket_channel(socket_id), payload)
            .await
            .map_err(|e| AppError::Emit(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_per_socket() {
        assert_eq!(socket_channel("abc"), "socket:abc");
    }
}
