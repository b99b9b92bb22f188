//! Borrow records repository for database operations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, QueryBuilder, Row};

use super::BorrowRecordStore;
use crate::{
    error::{AppError, AppResult},
    models::borrow::{BorrowQuery, BorrowRecord, BorrowStatistics},
};

const COLUMNS: &str = r#"
    id, borrow_number, archive_id, borrower_id, status, purpose, requested_days, apply_time,
    approver_id, approve_time, approve_remark, borrow_time, expected_return_time,
    actual_return_time, return_remark, return_condition, damage_description,
    extension_count, extension_reason, cancel_reason, workflow_instance_id, version
"#;

#[derive(Clone)]
pub struct PgBorrowRecordStore {
    pool: Pool<Postgres>,
}

impl PgBorrowRecordStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &BorrowQuery) {
        builder.push(" WHERE TRUE");
        if let Some(borrower_id) = query.borrower_id {
            builder.push(" AND borrower_id = ").push_bind(borrower_id);
        }
        if let Some(archive_id) = query.archive_id {
            builder.push(" AND archive_id = ").push_bind(archive_id);
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status);
        }
    }
}

/// The partial unique index on active records surfaces as a unique violation
fn map_active_conflict(err: sqlx::Error, archive_id: i64) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::AlreadyBorrowed(format!(
            "Archive {} already has an active borrow record",
            archive_id
        )),
        _ => AppError::Database(err),
    }
}

#[async_trait]
impl BorrowRecordStore for PgBorrowRecordStore {
    async fn create_record(&self, record: &BorrowRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO borrow_records (
                id, borrow_number, archive_id, borrower_id, status, purpose, requested_days,
                apply_time, extension_count, workflow_instance_id, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.borrow_number)
        .bind(record.archive_id)
        .bind(record.borrower_id)
        .bind(record.status)
        .bind(&record.purpose)
        .bind(record.requested_days)
        .bind(record.apply_time)
        .bind(record.extension_count)
        .bind(record.workflow_instance_id)
        .bind(record.version)
        .execute(&self.pool)
        .await
        .map_err(|e| map_active_conflict(e, record.archive_id))?;

        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> AppResult<BorrowRecord> {
        sqlx::query_as::<_, BorrowRecord>(&format!("SELECT {} FROM borrow_records WHERE id = $1", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Borrow record with id {} not found", id)))
    }

    async fn get_active_by_archive(&self, archive_id: i64) -> AppResult<Option<BorrowRecord>> {
        let record = sqlx::query_as::<_, BorrowRecord>(&format!(
            "SELECT {} FROM borrow_records WHERE archive_id = $1 AND status IN ('PENDING', 'APPROVED', 'BORROWED')",
            COLUMNS
        ))
        .bind(archive_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_with_version_check(&self, record: &BorrowRecord, expected_version: i64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE borrow_records SET
                status = $3,
                approver_id = $4,
                approve_time = $5,
                approve_remark = $6,
                borrow_time = $7,
                expected_return_time = $8,
                actual_return_time = $9,
                return_remark = $10,
                return_condition = $11,
                damage_description = $12,
                extension_count = $13,
                extension_reason = $14,
                cancel_reason = $15,
                workflow_instance_id = $16,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id)
        .bind(expected_version)
        .bind(record.status)
        .bind(record.approver_id)
        .bind(record.approve_time)
        .bind(&record.approve_remark)
        .bind(record.borrow_time)
        .bind(record.expected_return_time)
        .bind(record.actual_return_time)
        .bind(&record.return_remark)
        .bind(record.return_condition)
        .bind(&record.damage_description)
        .bind(record.extension_count)
        .bind(&record.extension_reason)
        .bind(&record.cancel_reason)
        .bind(record.workflow_instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_active_conflict(e, record.archive_id))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish a stale version from a missing row
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM borrow_records WHERE id = $1)")
            .bind(record.id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(AppError::NotFound(format!("Borrow record with id {} not found", record.id)));
        }
        Ok(false)
    }

    async fn list_by_borrower(&self, borrower_id: i64) -> AppResult<Vec<BorrowRecord>> {
        let records = sqlx::query_as::<_, BorrowRecord>(&format!(
            "SELECT {} FROM borrow_records WHERE borrower_id = $1 ORDER BY apply_time DESC, id DESC",
            COLUMNS
        ))
        .bind(borrower_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> AppResult<Vec<BorrowRecord>> {
        let records = sqlx::query_as::<_, BorrowRecord>(&format!(
            r#"
            SELECT {} FROM borrow_records
            WHERE status = 'BORROWED' AND expected_return_time < $1
            ORDER BY expected_return_time
            "#,
            COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_due_before(
        &self,
        cutoff: DateTime<Utc>,
        after_id: Option<i64>,
        limit: i64,
    ) -> AppResult<Vec<BorrowRecord>> {
        let records = sqlx::query_as::<_, BorrowRecord>(&format!(
            r#"
            SELECT {} FROM borrow_records
            WHERE status = 'BORROWED'
              AND expected_return_time < $1
              AND ($2::BIGINT IS NULL OR id > $2)
            ORDER BY id
            LIMIT $3
            "#,
            COLUMNS
        ))
        .bind(cutoff)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn query(&self, query: &BorrowQuery) -> AppResult<(Vec<BorrowRecord>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM borrow_records");
        Self::push_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM borrow_records", COLUMNS));
        Self::push_filters(&mut select, query);
        select
            .push(" ORDER BY apply_time DESC, id DESC LIMIT ")
            .push_bind(query.page.limit())
            .push(" OFFSET ")
            .push_bind(query.page.offset());
        let records = select.build_query_as::<BorrowRecord>().fetch_all(&self.pool).await?;

        Ok((records, total))
    }

    async fn statistics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AppResult<BorrowStatistics> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                COUNT(*) FILTER (WHERE status IN ('APPROVED', 'BORROWED', 'RETURNED')) AS approved,
                COUNT(*) FILTER (WHERE status = 'REJECTED') AS rejected,
                COUNT(*) FILTER (WHERE status = 'CANCELLED') AS cancelled,
                COUNT(*) FILTER (WHERE status = 'BORROWED') AS borrowed,
                COUNT(*) FILTER (WHERE status = 'BORROWED' AND expected_return_time < $3) AS overdue,
                COUNT(*) FILTER (WHERE status = 'RETURNED') AS returned
            FROM borrow_records
            WHERE ($1::TIMESTAMPTZ IS NULL OR apply_time >= $1)
              AND ($2::TIMESTAMPTZ IS NULL OR apply_time <= $2)
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(BorrowStatistics {
            total_applications: row.get("total"),
            pending_applications: row.get("pending"),
            approved_applications: row.get("approved"),
            rejected_applications: row.get("rejected"),
            cancelled_applications: row.get("cancelled"),
            current_borrowings: row.get("borrowed"),
            overdue_records: row.get("overdue"),
            returned_records: row.get("returned"),
            approval_rate: 0.0,
        }
        .with_rate())
    }
}
