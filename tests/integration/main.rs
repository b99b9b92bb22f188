//! In-process integration tests driving the HTTP router

mod api_tests;
mod borrow_flow;
mod common;
mod workflow_tests;
