//! Per-user push token directory. Tokens are registered and removed
//! explicitly by the owning client, never inferred from traffic.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::AppResult;

pub const SUPPORTED_PLATFORMS: [&str; 2] = ["ios", "android"];

pub fn is_supported_platform(platform: &str) -> bool {
    SUPPORTED_PLATFORMS.contains(&platform)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceToken {
    pub token: String,
    pub platform: String,
}

#[async_trait]
pub trait DeviceTokenStore: Send + Sync {
    async fn register_token(&self, user_id: Uuid, token: &str, platform: &str) -> AppResult<()>;
    async fn remove_token(&self, user_id: Uuid, token: &str) -> AppResult<()>;
    async fn tokens_for_user(&self, user_id: Uuid) -> AppResult<Vec<DeviceToken>>;
}

#[derive(Clone)]
pub struct PostgresDeviceTokenStore {
    db: PgPool,
}

impl PostgresDeviceTokenStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeviceTokenStore for PostgresDeviceTokenStore {
    async fn register_token(&self, user_id: Uuid, token: &str, platform: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_tokens (user_id, token, platform, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id, token) DO UPDATE SET platform = EXCLUDED.platform
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(platform)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn remove_token(&self, user_id: Uuid, token: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM device_tokens WHERE user_id = $1 AND token = $2")
            .bind(user_id)
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn tokens_for_user(&self, user_id: Uuid) -> AppResult<Vec<DeviceToken>> {
        let rows = sqlx::query("SELECT token, platform FROM device_tokens WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| DeviceToken {
                token: r.get("token"),
                platform: r.get("platform"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_filter() {
        assert!(is_supported_platform("ios"));
        assert!(is_supported_platform("android"));
        assert!(!is_supported_platform("web"));
        assert!(!is_supported_platform("IOS"));
    }
}
