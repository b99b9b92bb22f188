//! Borrow lifecycle: apply, review, lend, extend, return, cancel
//!
//! Records are mutated through read, transition, then version-checked write. A
//! stale write surfaces as `Conflict` and is never retried here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    availability::ArchiveAvailability,
    clock::{borrow_number, Clock, IdGenerator},
    notifications::Notifier,
    workflow::{OutcomeEvent, StartWorkflow, TaskCompletion, WorkflowEngine, WorkflowParticipant},
};
use crate::{
    config::BorrowConfig,
    error::{AppError, AppResult},
    models::{
        borrow::{
            ArchiveAvailabilityStatus, BatchFailure, BatchReviewReport, BorrowQuery, BorrowRecord, BorrowStatistics,
            BorrowStatus, NewBorrow, ReturnCondition, ReviewDecision,
        },
        workflow::{Assignment, HistoryEntry, StepSpec, TaskResult, WorkflowInstance, WorkflowOutcome},
        Page, Variables,
    },
    repository::BorrowRecordStore,
};

/// Business type under which borrow approvals run
pub const BORROW_BUSINESS_TYPE: &str = "archive-borrow";

/// Workflow variable carrying a reviewer's loan length override
pub const APPROVED_DAYS_VAR: &str = "approved_days";

#[derive(Debug, Clone)]
pub struct ApplyBorrow {
    pub archive_id: i64,
    pub borrower_id: i64,
    pub requested_days: i32,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewBorrow {
    pub borrow_id: i64,
    pub approver_id: i64,
    pub decision: ReviewDecision,
    pub remark: Option<String>,
    /// Loan length granted instead of the requested one
    pub approved_days: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ReturnBorrow {
    pub borrow_id: i64,
    pub condition: ReturnCondition,
    pub damage_description: Option<String>,
    pub remark: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtendBorrow {
    pub borrow_id: i64,
    pub days: i32,
    pub reason: Option<String>,
}

/// Applies workflow outcomes to borrow records
pub struct BorrowParticipant {
    store: Arc<dyn BorrowRecordStore>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    reviewer_ids: Vec<i64>,
}

impl BorrowParticipant {
    pub fn new(
        store: Arc<dyn BorrowRecordStore>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        reviewer_ids: Vec<i64>,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            reviewer_ids,
        }
    }

    /// Move a PENDING record to BORROWED or REJECTED
    pub async fn apply_outcome(&self, event: &OutcomeEvent) -> AppResult<BorrowRecord> {
        let mut record = self.store.get_by_id(event.business_id).await?;
        let expected_version = record.version;
        let now = self.clock.now();

        match event.outcome {
            WorkflowOutcome::Approved => {
                let days = event
                    .variables
                    .get_int(APPROVED_DAYS_VAR)
                    .and_then(|d| i32::try_from(d).ok())
                    .unwrap_or(record.requested_days);
                record.approve_and_lend(event.resolver_id, event.comment.clone(), days, now)?;
            }
            WorkflowOutcome::Rejected => record.reject(event.resolver_id, event.comment.clone(), now)?,
        }

        if !self.store.update_with_version_check(&record, expected_version).await? {
            return Err(AppError::Conflict(format!(
                "Borrow record {} was modified concurrently",
                record.id
            )));
        }
        record.version = expected_version + 1;

        tracing::info!(
            borrow_id = record.id,
            instance_id = event.instance_id,
            outcome = ?event.outcome,
            status = %record.status,
            "Borrow decided by workflow"
        );
        self.notifier.approval_result(record.id, event.outcome).await;
        Ok(record)
    }
}

#[async_trait]
impl WorkflowParticipant for BorrowParticipant {
    async fn resolve_assignee(&self, _instance: &WorkflowInstance, _step: &StepSpec) -> AppResult<Assignment> {
        Assignment::any_of(self.reviewer_ids.clone())
    }

    async fn on_outcome(&self, event: &OutcomeEvent) -> AppResult<()> {
        self.apply_outcome(event).await.map(|_| ())
    }
}

#[derive(Clone)]
pub struct BorrowLifecycle {
    store: Arc<dyn BorrowRecordStore>,
    engine: WorkflowEngine,
    participant: Arc<BorrowParticipant>,
    availability: Arc<dyn ArchiveAvailability>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    policy: BorrowConfig,
}

impl BorrowLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BorrowRecordStore>,
        engine: WorkflowEngine,
        participant: Arc<BorrowParticipant>,
        availability: Arc<dyn ArchiveAvailability>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        policy: BorrowConfig,
    ) -> Self {
        Self {
            store,
            engine,
            participant,
            availability,
            notifier,
            clock,
            ids,
            policy,
        }
    }

    pub fn policy(&self) -> &BorrowConfig {
        &self.policy
    }

    async fn save(&self, record: &mut BorrowRecord, expected_version: i64) -> AppResult<()> {
        if !self.store.update_with_version_check(record, expected_version).await? {
            tracing::debug!(borrow_id = record.id, expected_version, "Stale borrow record version");
            return Err(AppError::Conflict(format!(
                "Borrow record {} was modified concurrently",
                record.id
            )));
        }
        record.version = expected_version + 1;
        Ok(())
    }

    fn check_days(&self, days: i32, max: i32, what: &str) -> AppResult<()> {
        if days <= 0 || days > max {
            return Err(AppError::Validation(format!("{} must be between 1 and {} days", what, max)));
        }
        Ok(())
    }

    /// File a new application; starts an approval workflow when the archive requires one
    pub async fn apply(&self, request: ApplyBorrow) -> AppResult<BorrowRecord> {
        self.check_days(request.requested_days, self.policy.max_borrow_days, "Requested loan")?;

        if let Some(active) = self.store.get_active_by_archive(request.archive_id).await? {
            tracing::debug!(archive_id = request.archive_id, active_id = active.id, "Archive already taken");
            return Err(AppError::AlreadyBorrowed(format!(
                "Archive {} already has an active borrow record",
                request.archive_id
            )));
        }

        let definition = if self.availability.requires_approval(request.archive_id).await? {
            let current = self.engine.current_definition(BORROW_BUSINESS_TYPE).await?;
            if current.is_none() {
                tracing::warn!(
                    archive_id = request.archive_id,
                    "Archive requires approval but no borrow workflow is published; using direct review"
                );
            }
            current
        } else {
            None
        };

        let now = self.clock.now();
        let id = self.ids.next_id();
        let instance_id = definition.as_ref().map(|_| self.ids.next_id());
        let mut record = BorrowRecord::new(NewBorrow {
            id,
            borrow_number: borrow_number(now, id),
            archive_id: request.archive_id,
            borrower_id: request.borrower_id,
            requested_days: request.requested_days,
            purpose: request.purpose,
            workflow_instance_id: instance_id,
            apply_time: now,
        });
        self.store.create_record(&record).await?;

        if let Some(definition) = definition {
            let variables = Variables::new()
                .with("archive_id", record.archive_id)
                .with("borrower_id", record.borrower_id)
                .with("requested_days", record.requested_days);
            let started = self
                .engine
                .start_workflow(StartWorkflow {
                    definition_id: definition.id,
                    business_type: BORROW_BUSINESS_TYPE.to_string(),
                    business_id: record.id,
                    initiator_id: record.borrower_id,
                    variables,
                    instance_id,
                })
                .await;
            if let Err(e) = started {
                tracing::error!(borrow_id = record.id, error = %e, "Approval workflow failed to start");
                let expected_version = record.version;
                record.cancel(Some("Approval workflow could not be started".to_string()))?;
                self.save(&mut record, expected_version).await?;
                return Err(e);
            }
        }

        tracing::info!(
            borrow_id = record.id,
            archive_id = record.archive_id,
            borrower_id = record.borrower_id,
            workflow = record.workflow_instance_id.is_some(),
            "Borrow application filed"
        );
        Ok(record)
    }

    /// Decide a pending application, through its workflow task when it has one
    pub async fn review(&self, request: ReviewBorrow) -> AppResult<BorrowRecord> {
        if let Some(days) = request.approved_days {
            self.check_days(days, self.policy.max_borrow_days, "Approved loan")?;
        }
        let mut record = self.store.get_by_id(request.borrow_id).await?;
        record.ensure_status(BorrowStatus::Pending)?;

        match record.workflow_instance_id {
            Some(instance_id) => self.review_through_workflow(record, instance_id, request).await,
            None => {
                let expected_version = record.version;
                let now = self.clock.now();
                let outcome = match request.decision {
                    ReviewDecision::Approve => {
                        let days = request.approved_days.unwrap_or(record.requested_days);
                        record.approve_and_lend(request.approver_id, request.remark, days, now)?;
                        WorkflowOutcome::Approved
                    }
                    ReviewDecision::Reject => {
                        record.reject(request.approver_id, request.remark, now)?;
                        WorkflowOutcome::Rejected
                    }
                };
                self.save(&mut record, expected_version).await?;

                tracing::info!(
                    borrow_id = record.id,
                    approver_id = request.approver_id,
                    status = %record.status,
                    "Borrow reviewed"
                );
                self.notifier.approval_result(record.id, outcome).await;
                Ok(record)
            }
        }
    }

    async fn review_through_workflow(
        &self,
        record: BorrowRecord,
        instance_id: i64,
        request: ReviewBorrow,
    ) -> AppResult<BorrowRecord> {
        let Some(task) = self.engine.pending_task(instance_id).await? else {
            // the workflow already decided but its callback never reached the record
            if let Some(event) = self.engine.recorded_outcome(instance_id).await? {
                tracing::warn!(
                    borrow_id = record.id,
                    instance_id,
                    outcome = ?event.outcome,
                    "Applying workflow outcome the record missed"
                );
                return self.participant.apply_outcome(&event).await;
            }
            return Err(AppError::InvalidState(format!(
                "Borrow {} has no pending approval task",
                record.id
            )));
        };

        let mut variables = Variables::new();
        if let Some(days) = request.approved_days {
            variables.insert(APPROVED_DAYS_VAR, days);
        }
        let result = match request.decision {
            ReviewDecision::Approve => TaskResult::Approve,
            ReviewDecision::Reject => TaskResult::Reject,
        };
        let completion: TaskCompletion = self
            .engine
            .complete_task(super::workflow::CompleteTask {
                task_id: task.id,
                actor_id: request.approver_id,
                result,
                comment: request.remark,
                variables,
            })
            .await?;

        let Some(outcome) = completion.outcome else {
            // more approval steps remain
            return self.store.get_by_id(record.id).await;
        };

        let mut current = self.store.get_by_id(record.id).await?;
        if current.status == BorrowStatus::Pending {
            // the callback did not land; apply the recorded outcome once more
            let event = OutcomeEvent {
                instance_id,
                business_id: record.id,
                outcome,
                resolver_id: request.approver_id,
                comment: completion.task.comment.clone(),
                variables: completion.instance.variables.clone(),
            };
            current = self.participant.apply_outcome(&event).await?;
        }

        let expected = match outcome {
            WorkflowOutcome::Approved => BorrowStatus::Borrowed,
            WorkflowOutcome::Rejected => BorrowStatus::Rejected,
        };
        current.ensure_status(expected)?;
        Ok(current)
    }

    /// Review several applications; each one succeeds or fails on its own
    pub async fn batch_review(
        &self,
        borrow_ids: &[i64],
        approver_id: i64,
        decision: ReviewDecision,
        remark: Option<String>,
    ) -> BatchReviewReport {
        let mut report = BatchReviewReport::default();
        for &borrow_id in borrow_ids {
            let result = self
                .review(ReviewBorrow {
                    borrow_id,
                    approver_id,
                    decision,
                    remark: remark.clone(),
                    approved_days: None,
                })
                .await;
            match result {
                Ok(_) => report.succeeded.push(borrow_id),
                Err(e) => {
                    tracing::warn!(borrow_id, error = %e, "Batch review item failed");
                    report.failed.push(BatchFailure {
                        borrow_id,
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            approver_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Batch review finished"
        );
        report
    }

    pub async fn return_archive(&self, request: ReturnBorrow) -> AppResult<BorrowRecord> {
        if request.condition != ReturnCondition::Good
            && request.damage_description.as_deref().map_or(true, |d| d.trim().is_empty())
        {
            return Err(AppError::Validation(
                "A damage description is required unless the archive is returned in good condition".to_string(),
            ));
        }

        let mut record = self.store.get_by_id(request.borrow_id).await?;
        let expected_version = record.version;
        let now = self.clock.now();
        let was_overdue = record.is_overdue(now);
        record.mark_returned(request.condition, request.damage_description, request.remark, now)?;
        self.save(&mut record, expected_version).await?;

        tracing::info!(
            borrow_id = record.id,
            archive_id = record.archive_id,
            condition = ?request.condition,
            was_overdue,
            "Archive returned"
        );
        Ok(record)
    }

    pub async fn request_extension(&self, request: ExtendBorrow) -> AppResult<BorrowRecord> {
        self.check_days(request.days, self.policy.max_extension_days, "Extension")?;

        let mut record = self.store.get_by_id(request.borrow_id).await?;
        let expected_version = record.version;
        record.extend(request.days, request.reason, self.policy.max_extensions)?;

        if self.availability.is_on_hold(record.archive_id).await? {
            tracing::debug!(borrow_id = record.id, archive_id = record.archive_id, "Extension blocked by hold");
            return Err(AppError::HoldConflict(format!(
                "Archive {} is reserved and cannot be extended",
                record.archive_id
            )));
        }
        self.save(&mut record, expected_version).await?;

        tracing::info!(
            borrow_id = record.id,
            extension_count = record.extension_count,
            due = ?record.expected_return_time,
            "Borrow extended"
        );
        Ok(record)
    }

    /// Withdraw a pending application; only the borrower may do so
    pub async fn cancel(&self, borrow_id: i64, actor_id: i64, reason: Option<String>) -> AppResult<BorrowRecord> {
        let mut record = self.store.get_by_id(borrow_id).await?;
        if record.borrower_id != actor_id {
            return Err(AppError::NotAuthorized(format!(
                "Only the borrower may cancel borrow {}",
                borrow_id
            )));
        }
        let expected_version = record.version;
        record.cancel(reason.clone())?;
        self.save(&mut record, expected_version).await?;

        if let Some(instance_id) = record.workflow_instance_id {
            if let Err(e) = self.engine.terminate_workflow(instance_id, actor_id, reason).await {
                tracing::warn!(borrow_id, instance_id, error = %e, "Could not terminate approval workflow");
            }
        }

        tracing::info!(borrow_id, "Borrow application cancelled");
        Ok(record)
    }

    // ---- Queries ----

    pub async fn get(&self, borrow_id: i64) -> AppResult<BorrowRecord> {
        self.store.get_by_id(borrow_id).await
    }

    pub async fn query(&self, mut query: BorrowQuery) -> AppResult<Page<BorrowRecord>> {
        query.page = query.page.clamped();
        let (records, total) = self.store.query(&query).await?;
        Ok(Page::new(records, total, query.page))
    }

    pub async fn user_history(&self, borrower_id: i64) -> AppResult<Vec<BorrowRecord>> {
        self.store.list_by_borrower(borrower_id).await
    }

    pub async fn list_overdue(&self, now: DateTime<Utc>) -> AppResult<Vec<BorrowRecord>> {
        self.store.list_overdue(now).await
    }

    pub async fn statistics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> AppResult<BorrowStatistics> {
        self.store.statistics(from, to, self.clock.now()).await
    }

    /// Approval trail of a borrow; empty for directly reviewed records
    pub async fn workflow_history(&self, borrow_id: i64) -> AppResult<Vec<HistoryEntry>> {
        let record = self.store.get_by_id(borrow_id).await?;
        match record.workflow_instance_id {
            Some(instance_id) => self.engine.get_history(instance_id).await,
            None => Ok(Vec::new()),
        }
    }

    // ---- Archive availability ----

    pub async fn availability(&self, archive_id: i64) -> AppResult<ArchiveAvailabilityStatus> {
        let active = self.store.get_active_by_archive(archive_id).await?;
        Ok(ArchiveAvailabilityStatus {
            archive_id,
            on_loan: active.as_ref().map_or(false, |r| r.status == BorrowStatus::Borrowed),
            on_hold: self.availability.is_on_hold(archive_id).await?,
            active_borrow_id: active.as_ref().map(|r| r.id),
            active_status: active.map(|r| r.status),
        })
    }

    pub async fn place_hold(&self, archive_id: i64) -> AppResult<ArchiveAvailabilityStatus> {
        if self.availability.place_hold(archive_id).await? {
            tracing::info!(archive_id, "Hold placed");
        }
        self.availability(archive_id).await
    }

    pub async fn release_hold(&self, archive_id: i64) -> AppResult<ArchiveAvailabilityStatus> {
        if self.availability.release_hold(archive_id).await? {
            tracing::info!(archive_id, "Hold released");
        }
        self.availability(archive_id).await
    }

    pub async fn set_requires_approval(&self, archive_id: i64, required: bool) -> AppResult<()> {
        self.availability.set_requires_approval(archive_id, required).await?;
        tracing::info!(archive_id, required, "Approval routing changed");
        Ok(())
    }
}
