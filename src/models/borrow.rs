//! Borrow record model and its status transition table

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::PageRequest;
use crate::error::{AppError, AppResult, ErrorCode};

/// Lifecycle status of a borrow record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "borrow_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BorrowStatus {
    Pending,
    Approved,
    Rejected,
    Borrowed,
    Returned,
    Cancelled,
}

impl BorrowStatus {
    /// Statuses that hold the archive (at most one such record per archive)
    pub const ACTIVE: [BorrowStatus; 3] = [BorrowStatus::Pending, BorrowStatus::Approved, BorrowStatus::Borrowed];

    pub fn can_transition_to(self, next: BorrowStatus) -> bool {
        use BorrowStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Approved, Borrowed)
                | (Borrowed, Returned)
        )
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BorrowStatus::Returned | BorrowStatus::Rejected | BorrowStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BorrowStatus::Pending => "PENDING",
            BorrowStatus::Approved => "APPROVED",
            BorrowStatus::Rejected => "REJECTED",
            BorrowStatus::Borrowed => "BORROWED",
            BorrowStatus::Returned => "RETURNED",
            BorrowStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for BorrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer decision on a pending application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// Physical condition of the archive unit when handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "return_condition", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCondition {
    Good,
    Damaged,
    MissingParts,
}

impl Default for ReturnCondition {
    fn default() -> Self {
        ReturnCondition::Good
    }
}

/// One lending transaction, from application to return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BorrowRecord {
    pub id: i64,
    pub borrow_number: String,
    pub archive_id: i64,
    pub borrower_id: i64,
    pub status: BorrowStatus,
    pub purpose: Option<String>,
    pub requested_days: i32,
    pub apply_time: DateTime<Utc>,
    pub approver_id: Option<i64>,
    pub approve_time: Option<DateTime<Utc>>,
    pub approve_remark: Option<String>,
    pub borrow_time: Option<DateTime<Utc>>,
    pub expected_return_time: Option<DateTime<Utc>>,
    pub actual_return_time: Option<DateTime<Utc>>,
    pub return_remark: Option<String>,
    pub return_condition: Option<ReturnCondition>,
    pub damage_description: Option<String>,
    pub extension_count: i32,
    pub extension_reason: Option<String>,
    pub cancel_reason: Option<String>,
    pub workflow_instance_id: Option<i64>,
    pub version: i64,
}

/// Fields of a new application
#[derive(Debug, Clone)]
pub struct NewBorrow {
    pub id: i64,
    pub borrow_number: String,
    pub archive_id: i64,
    pub borrower_id: i64,
    pub requested_days: i32,
    pub purpose: Option<String>,
    pub workflow_instance_id: Option<i64>,
    pub apply_time: DateTime<Utc>,
}

impl BorrowRecord {
    pub fn new(new: NewBorrow) -> Self {
        Self {
            id: new.id,
            borrow_number: new.borrow_number,
            archive_id: new.archive_id,
            borrower_id: new.borrower_id,
            status: BorrowStatus::Pending,
            purpose: new.purpose,
            requested_days: new.requested_days,
            apply_time: new.apply_time,
            approver_id: None,
            approve_time: None,
            approve_remark: None,
            borrow_time: None,
            expected_return_time: None,
            actual_return_time: None,
            return_remark: None,
            return_condition: None,
            damage_description: None,
            extension_count: 0,
            extension_reason: None,
            cancel_reason: None,
            workflow_instance_id: new.workflow_instance_id,
            version: 0,
        }
    }

    fn transition(&mut self, next: BorrowStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "Borrow {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Approve and immediately lend: PENDING -> APPROVED -> BORROWED
    pub fn approve_and_lend(
        &mut self,
        approver_id: i64,
        remark: Option<String>,
        days: i32,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if days <= 0 {
            return Err(AppError::Validation("Loan duration must be positive".to_string()));
        }
        self.transition(BorrowStatus::Approved)?;
        self.approver_id = Some(approver_id);
        self.approve_time = Some(now);
        self.approve_remark = remark;
        self.transition(BorrowStatus::Borrowed)?;
        self.borrow_time = Some(now);
        self.expected_return_time = Some(now + Duration::days(days as i64));
        Ok(())
    }

    pub fn reject(&mut self, approver_id: i64, remark: Option<String>, now: DateTime<Utc>) -> AppResult<()> {
        self.transition(BorrowStatus::Rejected)?;
        self.approver_id = Some(approver_id);
        self.approve_time = Some(now);
        self.approve_remark = remark;
        Ok(())
    }

    pub fn mark_returned(
        &mut self,
        condition: ReturnCondition,
        damage_description: Option<String>,
        remark: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.transition(BorrowStatus::Returned)?;
        self.actual_return_time = Some(now);
        self.return_condition = Some(condition);
        self.damage_description = damage_description;
        self.return_remark = remark;
        Ok(())
    }

    /// Push out the due date; the hold check is the caller's concern
    pub fn extend(&mut self, days: i32, reason: Option<String>, max_extensions: i32) -> AppResult<()> {
        if self.status != BorrowStatus::Borrowed {
            return Err(AppError::InvalidState(format!(
                "Borrow {} is {} and cannot be extended",
                self.id, self.status
            )));
        }
        if days <= 0 {
            return Err(AppError::Validation("Extension days must be positive".to_string()));
        }
        if self.extension_count >= max_extensions {
            return Err(AppError::ExtensionLimitExceeded {
                used: self.extension_count,
                max: max_extensions,
            });
        }
        let due = self
            .expected_return_time
            .ok_or_else(|| AppError::Internal(format!("Borrow {} has no due date", self.id)))?;
        self.expected_return_time = Some(due + Duration::days(days as i64));
        self.extension_count += 1;
        self.extension_reason = reason;
        Ok(())
    }

    pub fn cancel(&mut self, reason: Option<String>) -> AppResult<()> {
        self.transition(BorrowStatus::Cancelled)?;
        self.cancel_reason = reason;
        Ok(())
    }

    /// Overdue is derived, never stored
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == BorrowStatus::Borrowed && self.expected_return_time.map(|due| due < now).unwrap_or(false)
    }

    pub fn ensure_status(&self, expected: BorrowStatus) -> AppResult<()> {
        if self.status != expected {
            return Err(AppError::InvalidState(format!(
                "Borrow {} is {}, expected {}",
                self.id, self.status, expected
            )));
        }
        Ok(())
    }
}

/// Listing filter for borrow records
#[derive(Debug, Clone, Default)]
pub struct BorrowQuery {
    pub borrower_id: Option<i64>,
    pub archive_id: Option<i64>,
    pub status: Option<BorrowStatus>,
    pub page: PageRequest,
}

impl BorrowQuery {
    pub fn matches(&self, record: &BorrowRecord) -> bool {
        self.borrower_id.map_or(true, |id| record.borrower_id == id)
            && self.archive_id.map_or(true, |id| record.archive_id == id)
            && self.status.map_or(true, |s| record.status == s)
    }
}

/// System-wide lending figures over an application-time window
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct BorrowStatistics {
    pub total_applications: i64,
    pub pending_applications: i64,
    pub approved_applications: i64,
    pub rejected_applications: i64,
    pub cancelled_applications: i64,
    pub current_borrowings: i64,
    pub overdue_records: i64,
    pub returned_records: i64,
    /// Percentage of applications that were approved
    pub approval_rate: f64,
}

impl BorrowStatistics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a BorrowRecord>, now: DateTime<Utc>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total_applications += 1;
            match record.status {
                BorrowStatus::Pending => stats.pending_applications += 1,
                BorrowStatus::Rejected => stats.rejected_applications += 1,
                BorrowStatus::Cancelled => stats.cancelled_applications += 1,
                BorrowStatus::Approved => stats.approved_applications += 1,
                BorrowStatus::Borrowed => {
                    stats.approved_applications += 1;
                    stats.current_borrowings += 1;
                    if record.is_overdue(now) {
                        stats.overdue_records += 1;
                    }
                }
                BorrowStatus::Returned => {
                    stats.approved_applications += 1;
                    stats.returned_records += 1;
                }
            }
        }
        stats.with_rate()
    }

    pub fn with_rate(mut self) -> Self {
        self.approval_rate = if self.total_applications > 0 {
            self.approved_applications as f64 / self.total_applications as f64 * 100.0
        } else {
            0.0
        };
        self
    }
}

/// Outcome of one overdue sweep pass
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct SweepReport {
    pub overdue: Vec<BorrowRecord>,
    pub due_soon: usize,
    pub notified: usize,
    pub failed: usize,
    /// Id the pass resumed after, when a previous pass was interrupted
    pub resumed_after: Option<i64>,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchFailure {
    pub borrow_id: i64,
    pub code: ErrorCode,
    pub message: String,
}

/// Partial-success summary of a batch review
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct BatchReviewReport {
    pub succeeded: Vec<i64>,
    pub failed: Vec<BatchFailure>,
}

/// Current lending situation of one archive unit
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ArchiveAvailabilityStatus {
    pub archive_id: i64,
    pub on_loan: bool,
    pub on_hold: bool,
    pub active_borrow_id: Option<i64>,
    pub active_status: Option<BorrowStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn pending() -> BorrowRecord {
        BorrowRecord::new(NewBorrow {
            id: 1,
            borrow_number: "BR20250301-1".to_string(),
            archive_id: 10,
            borrower_id: 5,
            requested_days: 7,
            purpose: None,
            workflow_instance_id: None,
            apply_time: now(),
        })
    }

    #[test]
    fn test_transition_table() {
        use BorrowStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Approved.can_transition_to(Borrowed));
        assert!(Borrowed.can_transition_to(Returned));
        assert!(!Borrowed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Returned));
        for terminal in [Returned, Rejected, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Approved, Rejected, Borrowed, Returned, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_approve_sets_loan_window() {
        let mut record = pending();
        record.approve_and_lend(2, Some("ok".into()), 7, now()).unwrap();

        assert_eq!(record.status, BorrowStatus::Borrowed);
        assert_eq!(record.borrow_time, Some(now()));
        assert_eq!(record.expected_return_time, Some(now() + Duration::days(7)));
        assert_eq!(record.approver_id, Some(2));
        assert!(record.actual_return_time.is_none());
    }

    #[test]
    fn test_return_sets_actual_time_only_once() {
        let mut record = pending();
        record.approve_and_lend(2, None, 7, now()).unwrap();
        record
            .mark_returned(ReturnCondition::Good, None, None, now() + Duration::days(3))
            .unwrap();
        assert_eq!(record.status, BorrowStatus::Returned);
        assert!(record.actual_return_time.is_some());

        let err = record.mark_returned(ReturnCondition::Good, None, None, now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[test]
    fn test_extension_limit() {
        let mut record = pending();
        record.approve_and_lend(2, None, 7, now()).unwrap();
        record.extend(5, None, 2).unwrap();
        record.extend(5, Some("thesis".into()), 2).unwrap();
        assert_eq!(record.extension_count, 2);
        assert_eq!(record.expected_return_time, Some(now() + Duration::days(17)));

        let err = record.extend(5, None, 2).unwrap_err();
        assert!(matches!(err, AppError::ExtensionLimitExceeded { used: 2, max: 2 }));
        assert_eq!(record.extension_count, 2);
    }

    #[test]
    fn test_rejected_record_cannot_be_returned_or_cancelled() {
        let mut record = pending();
        record.reject(2, Some("restricted".into()), now()).unwrap();
        assert!(record.mark_returned(ReturnCondition::Good, None, None, now()).is_err());
        assert!(record.cancel(None).is_err());
        assert!(!record.status.is_active());
    }

    #[test]
    fn test_overdue_is_derived_from_due_date() {
        let mut record = pending();
        assert!(!record.is_overdue(now() + Duration::days(30)));
        record.approve_and_lend(2, None, 7, now()).unwrap();
        assert!(!record.is_overdue(now() + Duration::days(7)));
        assert!(record.is_overdue(now() + Duration::days(8)));
    }

    #[test]
    fn test_statistics_rate() {
        let mut borrowed = pending();
        borrowed.approve_and_lend(2, None, 1, now()).unwrap();
        let mut rejected = pending();
        rejected.reject(2, None, now()).unwrap();
        let open = pending();

        let stats = BorrowStatistics::from_records([&borrowed, &rejected, &open, &borrowed], now() + Duration::days(2));
        assert_eq!(stats.total_applications, 4);
        assert_eq!(stats.current_borrowings, 2);
        assert_eq!(stats.overdue_records, 2);
        assert_eq!(stats.rejected_applications, 1);
        assert_eq!(stats.approval_rate, 50.0);
    }
}
