use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::error::AppError;

/// Push gateway credentials. Absent when no gateway is configured, in
/// which case push tasks complete without an external call.
#[derive(Debug, Clone)]
pub struct PushGatewayConfig {
    pub url: String,
    pub server_key: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    /// Number of independent delivery stream partitions. Changing this
    /// across deployments re-routes conversations and breaks per-conversation
    /// ordering for in-flight entries; treat it as fixed once live.
    pub partition_count: u32,
    pub consumer_batch_size: usize,
    pub poll_timeout: Duration,
    pub max_retries: u32,
    /// Idle time after which a pending entry is reclaimed from a stalled
    /// consumer and redelivered.
    pub reclaim_idle: Duration,

    pub presence_ttl: Duration,

    pub push_worker_count: u32,
    pub push_max_retries: u32,
    pub push_gateway: Option<PushGatewayConfig>,
    pub content_preview_max: usize,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let partition_count: u32 = env_parsed("PARTITION_COUNT", 4);
        if partition_count == 0 {
            return Err(AppError::Config("PARTITION_COUNT must be at least 1".into()));
        }

        let push_gateway = match env::var("PUSH_GATEWAY_URL") {
            Ok(url) if !url.trim().is_empty() => {
                let server_key = env::var("PUSH_GATEWAY_KEY")
                    .map_err(|_| AppError::Config("PUSH_GATEWAY_KEY missing".into()))?;
                Some(PushGatewayConfig { url, server_key })
            }
            _ => None,
        };

        Ok(Self {
            database_url,
            redis_url,
            partition_count,
            consumer_batch_size: env_parsed("CONSUMER_BATCH_SIZE", 10),
            poll_timeout: Duration::from_millis(env_parsed("POLL_TIMEOUT_MS", 5000)),
            max_retries: env_parsed("MAX_RETRIES", 3),
            reclaim_idle: Duration::from_millis(env_parsed("RECLAIM_IDLE_MS", 30_000)),
            presence_ttl: Duration::from_secs(env_parsed("PRESENCE_TTL_SECONDS", 60)),
            push_worker_count: env_parsed("PUSH_WORKER_COUNT", 2),
            push_max_retries: env_parsed("PUSH_MAX_RETRIES", 3),
            push_gateway,
            content_preview_max: env_parsed("CONTENT_PREVIEW_MAX", 100),
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/test".into(),
            redis_url: "redis://127.0.0.1:6379/0".into(),
            partition_count: 4,
            consumer_batch_size: 10,
            poll_timeout: Duration::from_secs(5),
            max_retries: 3,
            reclaim_idle: Duration::from_secs(30),
            presence_ttl: Duration::from_secs(60),
            push_worker_count: 2,
            push_max_retries: 3,
            push_gateway: None,
            content_preview_max: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operative_contract() {
        let cfg = Config::test_defaults();
        assert_eq!(cfg.consumer_batch_size, 10);
        assert_eq!(cfg.poll_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.presence_ttl, Duration::from_secs(60));
        assert_eq!(cfg.content_preview_max, 100);
    }
}
