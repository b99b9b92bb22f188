//! Workflow repository for database operations

use async_trait::async_trait;
use sqlx::{postgres::PgRow, types::Json, Pool, Postgres, Row, Transaction};

use super::{WorkflowChanges, WorkflowStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        workflow::{
            DefinitionStatus, HistoryEntry, InstanceFilter, StepSpec, WorkflowDefinition, WorkflowInstance,
            WorkflowStatistics, WorkflowTask,
        },
        PageRequest, Variables,
    },
};

const DEFINITION_COLUMNS: &str = "id, name, business_type, version, status, is_current, description, steps, \
     created_by, created_at, published_at, row_version";

const INSTANCE_COLUMNS: &str = "id, definition_id, business_type, business_id, initiator_id, status, outcome, \
     variables, current_step_index, started_at, ended_at, version";

const TASK_COLUMNS: &str = "id, instance_id, step_index, name, assignee_id, candidate_ids, status, result, \
     comment, created_at, resolved_at, version";

fn definition_from_row(row: &PgRow) -> Result<WorkflowDefinition, sqlx::Error> {
    let steps: Json<Vec<StepSpec>> = row.try_get("steps")?;
    Ok(WorkflowDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        business_type: row.try_get("business_type")?,
        version: row.try_get("version")?,
        status: row.try_get("status")?,
        is_current: row.try_get("is_current")?,
        description: row.try_get("description")?,
        steps: steps.0,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
        row_version: row.try_get("row_version")?,
    })
}

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance, sqlx::Error> {
    let variables: Json<Variables> = row.try_get("variables")?;
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        definition_id: row.try_get("definition_id")?,
        business_type: row.try_get("business_type")?,
        business_id: row.try_get("business_id")?,
        initiator_id: row.try_get("initiator_id")?,
        status: row.try_get("status")?,
        outcome: row.try_get("outcome")?,
        variables: variables.0,
        current_step_index: row.try_get("current_step_index")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        version: row.try_get("version")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<WorkflowTask, sqlx::Error> {
    Ok(WorkflowTask {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        step_index: row.try_get("step_index")?,
        name: row.try_get("name")?,
        assignee_id: row.try_get("assignee_id")?,
        candidate_ids: row.try_get("candidate_ids")?,
        status: row.try_get("status")?,
        result: row.try_get("result")?,
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
        version: row.try_get("version")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<HistoryEntry, sqlx::Error> {
    Ok(HistoryEntry {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        task_id: row.try_get("task_id")?,
        action: row.try_get("action")?,
        actor_id: row.try_get("actor_id")?,
        detail: row.try_get("detail")?,
        at: row.try_get("at")?,
    })
}

/// Unique violations inside a commit come from the one-pending-task-per-step
/// and one-current-definition indexes
fn map_commit_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(format!("Concurrent workflow change: {}", db.message()))
        }
        _ => AppError::Database(err),
    }
}

#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: Pool<Postgres>,
}

impl PgWorkflowStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Apply every change; `Ok(false)` as soon as one guarded update matches no row
    async fn apply(tx: &mut Transaction<'_, Postgres>, changes: &WorkflowChanges) -> AppResult<bool> {
        for definition in &changes.new_definitions {
            sqlx::query(
                r#"
                INSERT INTO workflow_definitions (
                    id, name, business_type, version, status, is_current, description, steps,
                    created_by, created_at, published_at, row_version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(definition.id)
            .bind(&definition.name)
            .bind(&definition.business_type)
            .bind(definition.version)
            .bind(definition.status)
            .bind(definition.is_current)
            .bind(&definition.description)
            .bind(Json(&definition.steps))
            .bind(definition.created_by)
            .bind(definition.created_at)
            .bind(definition.published_at)
            .bind(definition.row_version)
            .execute(&mut **tx)
            .await
            .map_err(map_commit_error)?;
        }

        // Demotions are queued before promotions, keeping the current-definition index satisfied
        for update in &changes.definitions {
            let definition = &update.value;
            let result = sqlx::query(
                r#"
                UPDATE workflow_definitions SET
                    name = $3, status = $4, is_current = $5, description = $6, steps = $7,
                    published_at = $8, row_version = $9
                WHERE id = $1 AND row_version = $2
                "#,
            )
            .bind(definition.id)
            .bind(update.expected_version)
            .bind(&definition.name)
            .bind(definition.status)
            .bind(definition.is_current)
            .bind(&definition.description)
            .bind(Json(&definition.steps))
            .bind(definition.published_at)
            .bind(definition.row_version)
            .execute(&mut **tx)
            .await
            .map_err(map_commit_error)?;
            if result.rows_affected() == 0 {
                return Ok(false);
            }
        }

        for instance in &changes.new_instances {
            sqlx::query(
                r#"
                INSERT INTO workflow_instances (
                    id, definition_id, business_type, business_id, initiator_id, status, outcome,
                    variables, current_step_index, started_at, ended_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(instance.id)
            .bind(instance.definition_id)
            .bind(&instance.business_type)
            .bind(instance.business_id)
            .bind(instance.initiator_id)
            .bind(instance.status)
            .bind(instance.outcome)
            .bind(Json(&instance.variables))
            .bind(instance.current_step_index)
            .bind(instance.started_at)
            .bind(instance.ended_at)
            .bind(instance.version)
            .execute(&mut **tx)
            .await
            .map_err(map_commit_error)?;
        }

        for update in &changes.instances {
            let instance = &update.value;
            let result = sqlx::query(
                r#"
                UPDATE workflow_instances SET
                    status = $3, outcome = $4, variables = $5, current_step_index = $6,
                    ended_at = $7, version = $8
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(instance.id)
            .bind(update.expected_version)
            .bind(instance.status)
            .bind(instance.outcome)
            .bind(Json(&instance.variables))
            .bind(instance.current_step_index)
            .bind(instance.ended_at)
            .bind(instance.version)
            .execute(&mut **tx)
            .await
            .map_err(map_commit_error)?;
            if result.rows_affected() == 0 {
                return Ok(false);
            }
        }

        // Resolve existing tasks before inserting the next step's task
        for update in &changes.tasks {
            let task = &update.value;
            let result = sqlx::query(
                r#"
                UPDATE workflow_tasks SET
                    assignee_id = $3, candidate_ids = $4, status = $5, result = $6, comment = $7,
                    resolved_at = $8, version = $9
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(task.id)
            .bind(update.expected_version)
            .bind(task.assignee_id)
            .bind(&task.candidate_ids)
            .bind(task.status)
            .bind(task.result)
            .bind(&task.comment)
            .bind(task.resolved_at)
            .bind(task.version)
            .execute(&mut **tx)
            .await
            .map_err(map_commit_error)?;
            if result.rows_affected() == 0 {
                return Ok(false);
            }
        }

        for task in &changes.new_tasks {
            sqlx::query(
                r#"
                INSERT INTO workflow_tasks (
                    id, instance_id, step_index, name, assignee_id, candidate_ids, status, result,
                    comment, created_at, resolved_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(task.id)
            .bind(task.instance_id)
            .bind(task.step_index)
            .bind(&task.name)
            .bind(task.assignee_id)
            .bind(&task.candidate_ids)
            .bind(task.status)
            .bind(task.result)
            .bind(&task.comment)
            .bind(task.created_at)
            .bind(task.resolved_at)
            .bind(task.version)
            .execute(&mut **tx)
            .await
            .map_err(map_commit_error)?;
        }

        for entry in &changes.history {
            sqlx::query(
                r#"
                INSERT INTO workflow_history (id, instance_id, task_id, action, actor_id, detail, at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(entry.id)
            .bind(entry.instance_id)
            .bind(entry.task_id)
            .bind(entry.action)
            .bind(entry.actor_id)
            .bind(&entry.detail)
            .bind(entry.at)
            .execute(&mut **tx)
            .await?;
        }

        Ok(true)
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn commit(&self, changes: WorkflowChanges) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        match Self::apply(&mut tx, &changes).await {
            Ok(true) => {
                tx.commit().await?;
                Ok(true)
            }
            Ok(false) => {
                tx.rollback().await?;
                Ok(false)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn get_definition(&self, id: i64) -> AppResult<Option<WorkflowDefinition>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflow_definitions WHERE id = $1", DEFINITION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(definition_from_row).transpose()?)
    }

    async fn current_definition(&self, business_type: &str) -> AppResult<Option<WorkflowDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_definitions \
             WHERE business_type = $1 AND is_current AND status = 'PUBLISHED'",
            DEFINITION_COLUMNS
        ))
        .bind(business_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(definition_from_row).transpose()?)
    }

    async fn latest_version(&self, business_type: &str) -> AppResult<i32> {
        let version = sqlx::query_scalar::<_, Option<i32>>(
            "SELECT MAX(version) FROM workflow_definitions WHERE business_type = $1",
        )
        .bind(business_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(version.unwrap_or(0))
    }

    async fn list_definitions(
        &self,
        business_type: Option<String>,
        status: Option<DefinitionStatus>,
    ) -> AppResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_definitions \
             WHERE ($1::TEXT IS NULL OR business_type = $1) \
               AND ($2::definition_status IS NULL OR status = $2) \
             ORDER BY business_type, version DESC",
            DEFINITION_COLUMNS
        ))
        .bind(business_type)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(definition_from_row).collect::<Result<_, _>>()?)
    }

    async fn get_instance(&self, id: i64) -> AppResult<Option<WorkflowInstance>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflow_instances WHERE id = $1", INSTANCE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(instance_from_row).transpose()?)
    }

    async fn find_instance_by_business(
        &self,
        business_type: &str,
        business_id: i64,
    ) -> AppResult<Option<WorkflowInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances \
             WHERE business_type = $1 AND business_id = $2 \
             ORDER BY started_at DESC LIMIT 1",
            INSTANCE_COLUMNS
        ))
        .bind(business_type)
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(instance_from_row).transpose()?)
    }

    async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: PageRequest,
    ) -> AppResult<(Vec<WorkflowInstance>, i64)> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM workflow_instances \
             WHERE ($1::TEXT IS NULL OR business_type = $1) \
               AND ($2::instance_status IS NULL OR status = $2)",
        )
        .bind(&filter.business_type)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances \
             WHERE ($1::TEXT IS NULL OR business_type = $1) \
               AND ($2::instance_status IS NULL OR status = $2) \
             ORDER BY started_at DESC, id DESC LIMIT $3 OFFSET $4",
            INSTANCE_COLUMNS
        ))
        .bind(&filter.business_type)
        .bind(filter.status)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let instances = rows.iter().map(instance_from_row).collect::<Result<_, _>>()?;
        Ok((instances, total))
    }

    async fn get_task(&self, id: i64) -> AppResult<Option<WorkflowTask>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflow_tasks WHERE id = $1", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_from_row).transpose()?)
    }

    async fn list_tasks_by_instance(&self, instance_id: i64) -> AppResult<Vec<WorkflowTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_tasks WHERE instance_id = $1 ORDER BY step_index, created_at",
            TASK_COLUMNS
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(task_from_row).collect::<Result<_, _>>()?)
    }

    async fn list_open_tasks_for_user(&self, user_id: i64, page: PageRequest) -> AppResult<(Vec<WorkflowTask>, i64)> {
        let open_for_user = "status = 'PENDING' AND (assignee_id = $1 OR (assignee_id IS NULL AND $1 = ANY(candidate_ids)))";

        let total = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM workflow_tasks WHERE {}", open_for_user))
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_tasks WHERE {} ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
            TASK_COLUMNS, open_for_user
        ))
        .bind(user_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let tasks = rows.iter().map(task_from_row).collect::<Result<_, _>>()?;
        Ok((tasks, total))
    }

    async fn list_history(&self, instance_id: i64) -> AppResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, instance_id, task_id, action, actor_id, detail, at \
             FROM workflow_history WHERE instance_id = $1 ORDER BY at, id",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(history_from_row).collect::<Result<_, _>>()?)
    }

    async fn statistics(&self) -> AppResult<WorkflowStatistics> {
        let instances = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'RUNNING') AS running,
                COUNT(*) FILTER (WHERE status = 'SUSPENDED') AS suspended,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
                COUNT(*) FILTER (WHERE status = 'TERMINATED') AS terminated
            FROM workflow_instances
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let tasks = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE status = 'PENDING') AS pending FROM workflow_tasks",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(WorkflowStatistics {
            total_instances: instances.get("total"),
            running_instances: instances.get("running"),
            suspended_instances: instances.get("suspended"),
            completed_instances: instances.get("completed"),
            terminated_instances: instances.get("terminated"),
            total_tasks: tasks.get("total"),
            pending_tasks: tasks.get("pending"),
        })
    }
}
