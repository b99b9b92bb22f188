//! Archive holds and approval routing

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::redis::RedisService;
use crate::error::AppResult;

/// What the circulation core needs to know about an archive unit it does not own
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveAvailability: Send + Sync {
    /// Whether a reservation hold blocks extensions
    async fn is_on_hold(&self, archive_id: i64) -> AppResult<bool>;

    async fn place_hold(&self, archive_id: i64) -> AppResult<bool>;

    async fn release_hold(&self, archive_id: i64) -> AppResult<bool>;

    /// Whether applications for this archive go through an approval workflow
    async fn requires_approval(&self, archive_id: i64) -> AppResult<bool>;

    async fn set_requires_approval(&self, archive_id: i64, required: bool) -> AppResult<()>;
}

pub struct RedisAvailability {
    redis: RedisService,
    default_requires_approval: bool,
}

impl RedisAvailability {
    pub fn new(redis: RedisService, default_requires_approval: bool) -> Self {
        Self {
            redis,
            default_requires_approval,
        }
    }
}

#[async_trait]
impl ArchiveAvailability for RedisAvailability {
    async fn is_on_hold(&self, archive_id: i64) -> AppResult<bool> {
        self.redis.is_on_hold(archive_id).await
    }

    async fn place_hold(&self, archive_id: i64) -> AppResult<bool> {
        self.redis.place_hold(archive_id).await
    }

    async fn release_hold(&self, archive_id: i64) -> AppResult<bool> {
        self.redis.release_hold(archive_id).await
    }

    async fn requires_approval(&self, archive_id: i64) -> AppResult<bool> {
        Ok(self
            .redis
            .approval_required(archive_id)
            .await?
            .unwrap_or(self.default_requires_approval))
    }

    async fn set_requires_approval(&self, archive_id: i64, required: bool) -> AppResult<()> {
        self.redis.set_approval_required(archive_id, required).await
    }
}

/// Process-local holds and approval flags
pub struct MemoryAvailability {
    holds: RwLock<HashSet<i64>>,
    approval: RwLock<HashMap<i64, bool>>,
    default_requires_approval: bool,
}

impl MemoryAvailability {
    pub fn new(default_requires_approval: bool) -> Self {
        Self {
            holds: RwLock::new(HashSet::new()),
            approval: RwLock::new(HashMap::new()),
            default_requires_approval,
        }
    }
}

#[async_trait]
impl ArchiveAvailability for MemoryAvailability {
    async fn is_on_hold(&self, archive_id: i64) -> AppResult<bool> {
        Ok(self.holds.read().await.contains(&archive_id))
    }

    async fn place_hold(&self, archive_id: i64) -> AppResult<bool> {
        Ok(self.holds.write().await.insert(archive_id))
    }

    async fn release_hold(&self, archive_id: i64) -> AppResult<bool> {
        Ok(self.holds.write().await.remove(&archive_id))
    }

    async fn requires_approval(&self, archive_id: i64) -> AppResult<bool> {
        Ok(self
            .approval
            .read()
            .await
            .get(&archive_id)
            .copied()
            .unwrap_or(self.default_requires_approval))
    }

    async fn set_requires_approval(&self, archive_id: i64, required: bool) -> AppResult<()> {
        self.approval.write().await.insert(archive_id, required);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_holds() {
        let availability = MemoryAvailability::new(true);
        assert!(!availability.is_on_hold(4).await.unwrap());
        assert!(availability.place_hold(4).await.unwrap());
        assert!(!availability.place_hold(4).await.unwrap());
        assert!(availability.is_on_hold(4).await.unwrap());
        assert!(availability.release_hold(4).await.unwrap());
        assert!(!availability.release_hold(4).await.unwrap());
    }

    #[tokio::test]
    async fn test_approval_flag_overrides_default() {
        let availability = MemoryAvailability::new(true);
        assert!(availability.requires_approval(1).await.unwrap());
        availability.set_requires_approval(1, false).await.unwrap();
        assert!(!availability.requires_approval(1).await.unwrap());
        assert!(availability.requires_approval(2).await.unwrap());
    }

    #[test]
    fn test_release_without_hold_is_a_no_op() {
        let availability = MemoryAvailability::new(false);
        let released = tokio_test::block_on(availability.release_hold(9));
        assert!(!tokio_test::assert_ok!(released));
        assert!(!tokio_test::block_on(availability.requires_approval(9)).unwrap());
    }
}
