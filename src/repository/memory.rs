//! In-memory storage backends
//!
//! Each call takes the table lock for its own duration only, so these behave like a
//! single database node: version checks and the active-archive uniqueness rule are
//! enforced at write time exactly as the PostgreSQL constraints do.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{BorrowRecordStore, WorkflowChanges, WorkflowStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        borrow::{BorrowQuery, BorrowRecord, BorrowStatistics, BorrowStatus},
        workflow::{
            DefinitionStatus, HistoryEntry, InstanceFilter, InstanceStatus, TaskStatus, WorkflowDefinition,
            WorkflowInstance, WorkflowStatistics, WorkflowTask,
        },
        PageRequest,
    },
};

#[derive(Default)]
pub struct MemoryBorrowRecordStore {
    records: RwLock<BTreeMap<i64, BorrowRecord>>,
}

fn active_conflict(records: &BTreeMap<i64, BorrowRecord>, candidate: &BorrowRecord) -> Option<i64> {
    if !candidate.status.is_active() {
        return None;
    }
    records
        .values()
        .find(|r| r.id != candidate.id && r.archive_id == candidate.archive_id && r.status.is_active())
        .map(|r| r.id)
}

#[async_trait]
impl BorrowRecordStore for MemoryBorrowRecordStore {
    async fn create_record(&self, record: &BorrowRecord) -> AppResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(AppError::Conflict(format!("Borrow record {} already exists", record.id)));
        }
        if let Some(existing) = active_conflict(&records, record) {
            return Err(AppError::AlreadyBorrowed(format!(
                "Archive {} already has an active borrow record ({})",
                record.archive_id, existing
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> AppResult<BorrowRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Borrow record with id {} not found", id)))
    }

    async fn get_active_by_archive(&self, archive_id: i64) -> AppResult<Option<BorrowRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.archive_id == archive_id && r.status.is_active())
            .cloned())
    }

    async fn update_with_version_check(&self, record: &BorrowRecord, expected_version: i64) -> AppResult<bool> {
        let mut records = self.records.write().await;
        match records.get(&record.id) {
            None => return Err(AppError::NotFound(format!("Borrow record with id {} not found", record.id))),
            Some(stored) if stored.version != expected_version => return Ok(false),
            Some(_) => {}
        }
        if let Some(existing) = active_conflict(&records, record) {
            return Err(AppError::AlreadyBorrowed(format!(
                "Archive {} already has an active borrow record ({})",
                record.archive_id, existing
            )));
        }
        let mut stored = record.clone();
        stored.version = expected_version + 1;
        records.insert(stored.id, stored);
        Ok(true)
    }

    async fn list_by_borrower(&self, borrower_id: i64) -> AppResult<Vec<BorrowRecord>> {
        let mut rows: Vec<BorrowRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.borrower_id == borrower_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.apply_time.cmp(&a.apply_time).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> AppResult<Vec<BorrowRecord>> {
        let mut rows: Vec<BorrowRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.is_overdue(now))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.expected_return_time);
        Ok(rows)
    }

    async fn list_due_before(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<i64>,
        limit: i64,
    ) -> AppResult<Vec<BorrowRecord>> {
        let records = self.records.read().await;
        let start = after_id.map(|id| id + 1).unwrap_or(i64::MIN);
        Ok(records
            .range(start..)
            .map(|(_, r)| r)
            .filter(|r| r.status == BorrowStatus::Borrowed && r.expected_return_time.map_or(false, |due| due < cutoff))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn query(&self, query: &BorrowQuery) -> AppResult<(Vec<BorrowRecord>, i64)> {
        let mut rows: Vec<BorrowRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.apply_time.cmp(&a.apply_time).then(b.id.cmp(&a.id)));
        let total = rows.len() as i64;
        Ok((query.page.slice(&rows), total))
    }

    async fn statistics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AppResult<BorrowStatistics> {
        let records = self.records.read().await;
        let in_window = records.values().filter(|r| {
            from.map_or(true, |f| r.apply_time >= f) && to.map_or(true, |t| r.apply_time <= t)
        });
        Ok(BorrowStatistics::from_records(in_window, now))
    }
}

#[derive(Default)]
struct WorkflowTables {
    definitions: BTreeMap<i64, WorkflowDefinition>,
    instances: BTreeMap<i64, WorkflowInstance>,
    tasks: BTreeMap<i64, WorkflowTask>,
    history: Vec<HistoryEntry>,
}

impl WorkflowTables {
    fn versions_match(&self, changes: &WorkflowChanges) -> bool {
        changes.definitions.iter().all(|d| {
            self.definitions
                .get(&d.value.id)
                .map_or(false, |stored| stored.row_version == d.expected_version)
        }) && changes.instances.iter().all(|i| {
            self.instances
                .get(&i.value.id)
                .map_or(false, |stored| stored.version == i.expected_version)
        }) && changes.tasks.iter().all(|t| {
            self.tasks
                .get(&t.value.id)
                .map_or(false, |stored| stored.version == t.expected_version)
        })
    }

    /// At most one PENDING task per (instance, step) once the changes are applied
    fn pending_step_clash(&self, changes: &WorkflowChanges) -> Option<(i64, i32)> {
        let updated: HashSet<i64> = changes.tasks.iter().map(|t| t.value.id).collect();
        let mut seen: HashSet<(i64, i32)> = self
            .tasks
            .values()
            .filter(|t| !updated.contains(&t.id) && t.status == TaskStatus::Pending)
            .map(|t| (t.instance_id, t.step_index))
            .collect();
        changes
            .tasks
            .iter()
            .map(|t| &t.value)
            .chain(changes.new_tasks.iter())
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| (t.instance_id, t.step_index))
            .find(|key| !seen.insert(*key))
    }
}

#[derive(Default)]
pub struct MemoryWorkflowStore {
    tables: RwLock<WorkflowTables>,
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn commit(&self, changes: WorkflowChanges) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        if !tables.versions_match(&changes) {
            return Ok(false);
        }
        if let Some((instance_id, step)) = tables.pending_step_clash(&changes) {
            return Err(AppError::Conflict(format!(
                "Instance {} already has a pending task for step {}",
                instance_id, step
            )));
        }

        for definition in changes.new_definitions {
            tables.definitions.insert(definition.id, definition);
        }
        for versioned in changes.definitions {
            tables.definitions.insert(versioned.value.id, versioned.value);
        }
        for instance in changes.new_instances {
            tables.instances.insert(instance.id, instance);
        }
        for versioned in changes.instances {
            tables.instances.insert(versioned.value.id, versioned.value);
        }
        for task in changes.new_tasks {
            tables.tasks.insert(task.id, task);
        }
        for versioned in changes.tasks {
            tables.tasks.insert(versioned.value.id, versioned.value);
        }
        tables.history.extend(changes.history);
        Ok(true)
    }

    async fn get_definition(&self, id: i64) -> AppResult<Option<WorkflowDefinition>> {
        Ok(self.tables.read().await.definitions.get(&id).cloned())
    }

    async fn current_definition(&self, business_type: &str) -> AppResult<Option<WorkflowDefinition>> {
        Ok(self
            .tables
            .read()
            .await
            .definitions
            .values()
            .find(|d| d.business_type == business_type && d.is_current && d.status == DefinitionStatus::Published)
            .cloned())
    }

    async fn latest_version(&self, business_type: &str) -> AppResult<i32> {
        Ok(self
            .tables
            .read()
            .await
            .definitions
            .values()
            .filter(|d| d.business_type == business_type)
            .map(|d| d.version)
            .max()
            .unwrap_or(0))
    }

    async fn list_definitions(
        &self,
        business_type: Option<String>,
        status: Option<DefinitionStatus>,
    ) -> AppResult<Vec<WorkflowDefinition>> {
        let mut rows: Vec<WorkflowDefinition> = self
            .tables
            .read()
            .await
            .definitions
            .values()
            .filter(|d| business_type.as_deref().map_or(true, |t| d.business_type == t))
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.business_type.cmp(&b.business_type).then(b.version.cmp(&a.version)));
        Ok(rows)
    }

    async fn get_instance(&self, id: i64) -> AppResult<Option<WorkflowInstance>> {
        Ok(self.tables.read().await.instances.get(&id).cloned())
    }

    async fn find_instance_by_business(
        &self,
        business_type: &str,
        business_id: i64,
    ) -> AppResult<Option<WorkflowInstance>> {
        Ok(self
            .tables
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.business_type == business_type && i.business_id == business_id)
            .max_by_key(|i| i.started_at)
            .cloned())
    }

    async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: PageRequest,
    ) -> AppResult<(Vec<WorkflowInstance>, i64)> {
        let mut rows: Vec<WorkflowInstance> = self
            .tables
            .read()
            .await
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        let total = rows.len() as i64;
        Ok((page.slice(&rows), total))
    }

    async fn get_task(&self, id: i64) -> AppResult<Option<WorkflowTask>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks_by_instance(&self, instance_id: i64) -> AppResult<Vec<WorkflowTask>> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_open_tasks_for_user(&self, user_id: i64, page: PageRequest) -> AppResult<(Vec<WorkflowTask>, i64)> {
        let mut rows: Vec<WorkflowTask> = self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.is_actionable_by(user_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = rows.len() as i64;
        Ok((page.slice(&rows), total))
    }

    async fn list_history(&self, instance_id: i64) -> AppResult<Vec<HistoryEntry>> {
        Ok(self
            .tables
            .read()
            .await
            .history
            .iter()
            .filter(|h| h.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn statistics(&self) -> AppResult<WorkflowStatistics> {
        let tables = self.tables.read().await;
        let count = |status: InstanceStatus| tables.instances.values().filter(|i| i.status == status).count() as i64;
        Ok(WorkflowStatistics {
            total_instances: tables.instances.len() as i64,
            running_instances: count(InstanceStatus::Running),
            suspended_instances: count(InstanceStatus::Suspended),
            completed_instances: count(InstanceStatus::Completed),
            terminated_instances: count(InstanceStatus::Terminated),
            total_tasks: tables.tasks.len() as i64,
            pending_tasks: tables.tasks.values().filter(|t| t.status == TaskStatus::Pending).count() as i64,
        })
    }
}
