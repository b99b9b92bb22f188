//! Redis service for archive holds, approval routing flags and sweep checkpoints

use redis::{AsyncCommands, Client};

use crate::error::{AppError, AppResult};

const APPROVAL_POLICY_KEY: &str = "archives:approval_required";

fn hold_key(archive_id: i64) -> String {
    format!("hold:archive:{}", archive_id)
}

#[derive(Clone)]
pub struct RedisService {
    client: Client,
}

impl RedisService {
    /// Create a new Redis service
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;

        // Test connection
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;

        Ok(Self { client })
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn is_on_hold(&self, archive_id: i64) -> AppResult<bool> {
        let mut conn = self.connection().await?;
        Ok(conn.exists(hold_key(archive_id)).await?)
    }

    /// Returns false when the archive was already on hold
    pub async fn place_hold(&self, archive_id: i64) -> AppResult<bool> {
        let mut conn = self.connection().await?;
        Ok(conn.set_nx(hold_key(archive_id), 1).await?)
    }

    /// Returns false when there was no hold to release
    pub async fn release_hold(&self, archive_id: i64) -> AppResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(hold_key(archive_id)).await?;
        Ok(removed > 0)
    }

    /// Per-archive approval flag; `None` when the archive follows the default
    pub async fn approval_required(&self, archive_id: i64) -> AppResult<Option<bool>> {
        let mut conn = self.connection().await?;
        let flag: Option<i64> = conn.hget(APPROVAL_POLICY_KEY, archive_id).await?;
        Ok(flag.map(|f| f != 0))
    }

    pub async fn set_approval_required(&self, archive_id: i64, required: bool) -> AppResult<()> {
        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(APPROVAL_POLICY_KEY, archive_id, i64::from(required))
            .await?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, key: &str) -> AppResult<Option<i64>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    pub async fn set_checkpoint(&self, key: &str, last_id: i64) -> AppResult<()> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(key, last_id).await?;
        Ok(())
    }

    pub async fn clear_checkpoint(&self, key: &str) -> AppResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    /// Readiness probe
    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
