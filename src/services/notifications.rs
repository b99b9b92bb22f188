//! Outbound notices about workflow and loan events
//!
//! Delivery is best effort: the [`Notifier`] applies a timeout and logs failures,
//! so a slow or broken channel never holds up a state transition.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use std::future::Future;

use super::email::EmailService;
use crate::{
    error::{AppError, AppResult},
    models::WorkflowOutcome,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify_assigned(&self, task_id: i64, assignee_id: i64) -> AppResult<()>;

    async fn notify_approval_result(&self, borrow_id: i64, outcome: WorkflowOutcome) -> AppResult<()>;

    async fn notify_due_soon(&self, borrow_id: i64) -> AppResult<()>;

    async fn notify_overdue(&self, borrow_id: i64) -> AppResult<()>;
}

/// Writes notices to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationGateway for LogNotifier {
    async fn notify_assigned(&self, task_id: i64, assignee_id: i64) -> AppResult<()> {
        tracing::info!(task_id, assignee_id, "Task assigned");
        Ok(())
    }

    async fn notify_approval_result(&self, borrow_id: i64, outcome: WorkflowOutcome) -> AppResult<()> {
        tracing::info!(borrow_id, ?outcome, "Borrow application decided");
        Ok(())
    }

    async fn notify_due_soon(&self, borrow_id: i64) -> AppResult<()> {
        tracing::info!(borrow_id, "Borrowed archive due soon");
        Ok(())
    }

    async fn notify_overdue(&self, borrow_id: i64) -> AppResult<()> {
        tracing::info!(borrow_id, "Borrowed archive overdue");
        Ok(())
    }
}

/// Mails notices to the circulation desk
#[derive(Clone)]
pub struct EmailNotifier {
    email: EmailService,
}

impl EmailNotifier {
    pub fn new(email: EmailService) -> Self {
        Self { email }
    }
}

#[async_trait]
impl NotificationGateway for EmailNotifier {
    async fn notify_assigned(&self, task_id: i64, assignee_id: i64) -> AppResult<()> {
        self.email
            .send_notice(
                &format!("Approval task {} assigned", task_id),
                &format!("Approval task {} is waiting for user {}.", task_id, assignee_id),
            )
            .await
    }

    async fn notify_approval_result(&self, borrow_id: i64, outcome: WorkflowOutcome) -> AppResult<()> {
        let verdict = match outcome {
            WorkflowOutcome::Approved => "approved",
            WorkflowOutcome::Rejected => "rejected",
        };
        self.email
            .send_notice(
                &format!("Borrow application {} {}", borrow_id, verdict),
                &format!("Borrow application {} was {}.", borrow_id, verdict),
            )
            .await
    }

    async fn notify_due_soon(&self, borrow_id: i64) -> AppResult<()> {
        self.email
            .send_notice(
                &format!("Borrow {} due soon", borrow_id),
                &format!("The archive lent under borrow {} is due back soon.", borrow_id),
            )
            .await
    }

    async fn notify_overdue(&self, borrow_id: i64) -> AppResult<()> {
        self.email
            .send_notice(
                &format!("Borrow {} overdue", borrow_id),
                &format!("The archive lent under borrow {} is past its return date.", borrow_id),
            )
            .await
    }
}

/// Timeout-bounded, failure-swallowing front of a [`NotificationGateway`]
#[derive(Clone)]
pub struct Notifier {
    gateway: Arc<dyn NotificationGateway>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(gateway: Arc<dyn NotificationGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    /// Returns whether the notice was delivered
    async fn deliver<F>(&self, kind: &'static str, subject_id: i64, send: F) -> bool
    where
        F: Future<Output = AppResult<()>>,
    {
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(kind, subject_id, error = %e, "Notification failed");
                false
            }
            Err(_) => {
                let e = AppError::Notification(format!("timed out after {:?}", self.timeout));
                tracing::warn!(kind, subject_id, error = %e, "Notification failed");
                false
            }
        }
    }

    pub async fn assigned(&self, task_id: i64, assignee_id: i64) -> bool {
        self.deliver("assigned", task_id, self.gateway.notify_assigned(task_id, assignee_id))
            .await
    }

    pub async fn approval_result(&self, borrow_id: i64, outcome: WorkflowOutcome) -> bool {
        self.deliver(
            "approval_result",
            borrow_id,
            self.gateway.notify_approval_result(borrow_id, outcome),
        )
        .await
    }

    pub async fn due_soon(&self, borrow_id: i64) -> bool {
        self.deliver("due_soon", borrow_id, self.gateway.notify_due_soon(borrow_id))
            .await
    }

    pub async fn overdue(&self, borrow_id: i64) -> bool {
        self.deliver("overdue", borrow_id, self.gateway.notify_overdue(borrow_id))
            .await
    }
}
