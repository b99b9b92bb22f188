//! Business logic services

pub mod availability;
pub mod borrows;
pub mod clock;
pub mod email;
pub mod notifications;
pub mod redis;
pub mod sweep;
pub mod workflow;

use std::{sync::Arc, time::Duration};

use crate::{
    config::{AppConfig, BorrowConfig, NotificationChannel},
    error::AppResult,
    repository::Repository,
};

use availability::{ArchiveAvailability, MemoryAvailability, RedisAvailability};
use clock::{Clock, IdGenerator, SnowflakeIds, SystemClock};
use notifications::{EmailNotifier, LogNotifier, NotificationGateway, Notifier};
use sweep::{MemoryCheckpoint, RedisCheckpoint, SweepCheckpoint};

/// External collaborators the core services are wired to
#[derive(Clone)]
pub struct Collaborators {
    pub availability: Arc<dyn ArchiveAvailability>,
    pub gateway: Arc<dyn NotificationGateway>,
    pub checkpoint: Arc<dyn SweepCheckpoint>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub notification_timeout: Duration,
}

impl Collaborators {
    /// Collaborators as configured; Redis-backed holds and checkpoints when a Redis service is given
    pub fn from_config(config: &AppConfig, redis: Option<redis::RedisService>) -> Self {
        let gateway: Arc<dyn NotificationGateway> = match config.notifications.channel {
            NotificationChannel::Log => Arc::new(LogNotifier),
            NotificationChannel::Email => Arc::new(EmailNotifier::new(email::EmailService::new(config.email.clone()))),
        };
        let (availability, checkpoint): (Arc<dyn ArchiveAvailability>, Arc<dyn SweepCheckpoint>) = match redis {
            Some(redis) => (
                Arc::new(RedisAvailability::new(redis.clone(), config.borrow.require_approval_by_default)),
                Arc::new(RedisCheckpoint::new(redis)),
            ),
            None => (
                Arc::new(MemoryAvailability::new(config.borrow.require_approval_by_default)),
                Arc::new(MemoryCheckpoint::default()),
            ),
        };

        Self {
            availability,
            gateway,
            checkpoint,
            clock: Arc::new(SystemClock),
            ids: Arc::new(SnowflakeIds::new(config.ids.instance)),
            notification_timeout: Duration::from_millis(config.notifications.timeout_ms),
        }
    }

    /// Process-local collaborators with log-only notifications
    pub fn in_memory(policy: &BorrowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            availability: Arc::new(MemoryAvailability::new(policy.require_approval_by_default)),
            gateway: Arc::new(LogNotifier),
            checkpoint: Arc::new(MemoryCheckpoint::default()),
            clock,
            ids: Arc::new(SnowflakeIds::new(1)),
            notification_timeout: Duration::from_millis(500),
        }
    }
}

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub workflows: workflow::WorkflowEngine,
    pub borrows: borrows::BorrowLifecycle,
    pub sweeper: sweep::OverdueSweeper,
    pub clock: Arc<dyn Clock>,
    pub redis: Option<redis::RedisService>,
}

impl Services {
    /// Wire the services over the given repository and collaborators
    pub fn new(
        repository: Repository,
        policy: BorrowConfig,
        collaborators: Collaborators,
        redis: Option<redis::RedisService>,
    ) -> AppResult<Self> {
        let notifier = Notifier::new(collaborators.gateway.clone(), collaborators.notification_timeout);

        let participant = Arc::new(borrows::BorrowParticipant::new(
            repository.borrows.clone(),
            notifier.clone(),
            collaborators.clock.clone(),
            policy.reviewer_ids.clone(),
        ));
        let participants = workflow::ParticipantRegistry::builder()
            .register(borrows::BORROW_BUSINESS_TYPE, participant.clone())?
            .build();

        let workflows = workflow::WorkflowEngine::new(
            repository.workflows.clone(),
            participants,
            notifier.clone(),
            collaborators.clock.clone(),
            collaborators.ids.clone(),
        );

        let sweeper = sweep::OverdueSweeper::new(
            repository.borrows.clone(),
            collaborators.checkpoint.clone(),
            notifier.clone(),
            policy.sweep_batch_size,
            policy.due_soon_days,
        );

        let clock = collaborators.clock.clone();
        let borrows = borrows::BorrowLifecycle::new(
            repository.borrows,
            workflows.clone(),
            participant,
            collaborators.availability,
            notifier,
            collaborators.clock,
            collaborators.ids,
            policy,
        );

        Ok(Self {
            workflows,
            borrows,
            sweeper,
            clock,
            redis,
        })
    }
}
