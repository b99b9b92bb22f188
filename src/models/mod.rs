//! Data models for the circulation server

pub mod borrow;
pub mod claims;
pub mod variables;
pub mod workflow;

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

// Re-export commonly used types
pub use borrow::{BorrowRecord, BorrowStatus, ReviewDecision};
pub use claims::{Role, UserClaims};
pub use variables::{Variable, Variables};
pub use workflow::{
    WorkflowDefinition, WorkflowInstance, WorkflowOutcome, WorkflowTask,
};

/// 1-based pagination request
#[derive(Debug, Clone, Copy, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageRequest {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    20
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl PageRequest {
    pub fn new(page: i64, per_page: i64) -> Self {
        Self { page, per_page }.clamped()
    }

    pub fn clamped(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, 200),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit()
    }

    pub fn limit(&self) -> i64 {
        self.per_page.clamp(1, 200)
    }

    /// Slice an already filtered and ordered list
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset() as usize)
            .take(self.limit() as usize)
            .cloned()
            .collect()
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize, ToSchema)]
#[aliases(
    BorrowPage = Page<borrow::BorrowRecord>,
    TaskPage = Page<workflow::WorkflowTask>,
    InstancePage = Page<workflow::WorkflowInstance>
)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page.max(1),
            per_page: request.limit(),
        }
    }
}
