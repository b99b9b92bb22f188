//! Repository layer: storage traits and their PostgreSQL / in-memory backends

pub mod borrows;
pub mod memory;
pub mod workflows;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::{
        borrow::{BorrowQuery, BorrowRecord, BorrowStatistics},
        workflow::{
            DefinitionStatus, HistoryEntry, InstanceFilter, WorkflowDefinition, WorkflowInstance,
            WorkflowStatistics, WorkflowTask,
        },
        PageRequest,
    },
};

/// Durable storage for borrow records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BorrowRecordStore: Send + Sync {
    /// Insert a new record; fails with `AlreadyBorrowed` when the archive already has an active record
    async fn create_record(&self, record: &BorrowRecord) -> AppResult<()>;

    async fn get_by_id(&self, id: i64) -> AppResult<BorrowRecord>;

    async fn get_active_by_archive(&self, archive_id: i64) -> AppResult<Option<BorrowRecord>>;

    /// Store `record` if the stored version equals `expected_version`; the stored version becomes `expected_version + 1`
    async fn update_with_version_check(&self, record: &BorrowRecord, expected_version: i64) -> AppResult<bool>;

    async fn list_by_borrower(&self, borrower_id: i64) -> AppResult<Vec<BorrowRecord>>;

    async fn list_overdue(&self, now: DateTime<Utc>) -> AppResult<Vec<BorrowRecord>>;

    /// BORROWED records due before `cutoff`, ordered by id, starting after `after_id`
    async fn list_due_before(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<i64>,
        limit: i64,
    ) -> AppResult<Vec<BorrowRecord>>;

    async fn query(&self, query: &BorrowQuery) -> AppResult<(Vec<BorrowRecord>, i64)>;

    async fn statistics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AppResult<BorrowStatistics>;
}

/// A row update guarded by the version it was read at
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub expected_version: i64,
}

/// Everything one workflow transition writes, applied atomically by [`WorkflowStore::commit`]
#[derive(Debug, Clone, Default)]
pub struct WorkflowChanges {
    pub new_definitions: Vec<WorkflowDefinition>,
    pub definitions: Vec<Versioned<WorkflowDefinition>>,
    pub new_instances: Vec<WorkflowInstance>,
    pub instances: Vec<Versioned<WorkflowInstance>>,
    pub new_tasks: Vec<WorkflowTask>,
    pub tasks: Vec<Versioned<WorkflowTask>>,
    pub history: Vec<HistoryEntry>,
}

impl WorkflowChanges {
    pub fn update_definition(&mut self, mut definition: WorkflowDefinition) -> &mut Self {
        let expected_version = definition.row_version;
        definition.row_version += 1;
        self.definitions.push(Versioned {
            value: definition,
            expected_version,
        });
        self
    }

    pub fn update_instance(&mut self, mut instance: WorkflowInstance) -> &mut Self {
        let expected_version = instance.version;
        instance.version += 1;
        self.instances.push(Versioned {
            value: instance,
            expected_version,
        });
        self
    }

    pub fn update_task(&mut self, mut task: WorkflowTask) -> &mut Self {
        let expected_version = task.version;
        task.version += 1;
        self.tasks.push(Versioned {
            value: task,
            expected_version,
        });
        self
    }

    pub fn record(&mut self, entry: HistoryEntry) -> &mut Self {
        self.history.push(entry);
        self
    }
}

/// Durable storage for workflow definitions, instances, tasks and history
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Apply all changes or none; `Ok(false)` when an expected version is stale
    async fn commit(&self, changes: WorkflowChanges) -> AppResult<bool>;

    async fn get_definition(&self, id: i64) -> AppResult<Option<WorkflowDefinition>>;

    async fn current_definition(&self, business_type: &str) -> AppResult<Option<WorkflowDefinition>>;

    async fn latest_version(&self, business_type: &str) -> AppResult<i32>;

    async fn list_definitions(
        &self,
        business_type: Option<String>,
        status: Option<DefinitionStatus>,
    ) -> AppResult<Vec<WorkflowDefinition>>;

    async fn get_instance(&self, id: i64) -> AppResult<Option<WorkflowInstance>>;

    async fn find_instance_by_business(
        &self,
        business_type: &str,
        business_id: i64,
    ) -> AppResult<Option<WorkflowInstance>>;

    async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: PageRequest,
    ) -> AppResult<(Vec<WorkflowInstance>, i64)>;

    async fn get_task(&self, id: i64) -> AppResult<Option<WorkflowTask>>;

    async fn list_tasks_by_instance(&self, instance_id: i64) -> AppResult<Vec<WorkflowTask>>;

    /// PENDING tasks assigned to, or offered to, `user_id`
    async fn list_open_tasks_for_user(&self, user_id: i64, page: PageRequest) -> AppResult<(Vec<WorkflowTask>, i64)>;

    async fn list_history(&self, instance_id: i64) -> AppResult<Vec<HistoryEntry>>;

    async fn statistics(&self) -> AppResult<WorkflowStatistics>;
}

/// Storage handles shared by the services
#[derive(Clone)]
pub struct Repository {
    pub borrows: Arc<dyn BorrowRecordStore>,
    pub workflows: Arc<dyn WorkflowStore>,
}

impl Repository {
    /// PostgreSQL-backed repository
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            borrows: Arc::new(borrows::PgBorrowRecordStore::new(pool.clone())),
            workflows: Arc::new(workflows::PgWorkflowStore::new(pool)),
        }
    }

    /// Process-local repository, for tests and single-node trials
    pub fn in_memory() -> Self {
        Self {
            borrows: Arc::new(memory::MemoryBorrowRecordStore::default()),
            workflows: Arc::new(memory::MemoryWorkflowStore::default()),
        }
    }
}
