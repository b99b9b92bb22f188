//! Shared fixtures: an in-memory application, tokens and a request helper

#![allow(dead_code)]

use std::sync::Arc;

use archive_circulation::{
    api,
    config::{AppConfig, BorrowConfig, StorageBackend},
    models::{Role, UserClaims},
    repository::Repository,
    services::{clock::ManualClock, Collaborators, Services},
    AppState,
};
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;

pub const ADMIN: i64 = 1;
pub const REVIEWER: i64 = 2;
pub const SECOND_REVIEWER: i64 = 3;

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub clock: ManualClock,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

pub fn test_app() -> TestApp {
    test_app_with(BorrowConfig {
        reviewer_ids: vec![REVIEWER],
        ..BorrowConfig::default()
    })
}

pub fn test_app_with(policy: BorrowConfig) -> TestApp {
    let mut config = AppConfig::default();
    config.storage.backend = StorageBackend::Memory;
    config.auth.jwt_secret = "integration-secret".to_string();
    config.borrow = policy.clone();

    let clock = ManualClock::new(start_time());
    let collaborators = Collaborators::in_memory(&policy, Arc::new(clock.clone()));
    let services = Services::new(Repository::in_memory(), policy, collaborators, None).unwrap();

    let state = AppState {
        config: Arc::new(config),
        services: Arc::new(services),
    };
    TestApp {
        router: api::router(state.clone()),
        state,
        clock,
    }
}

impl TestApp {
    pub fn token(&self, user_id: i64, role: Role) -> String {
        let now = Utc::now().timestamp();
        UserClaims {
            sub: format!("user-{}", user_id),
            user_id,
            role,
            exp: now + 3600,
            iat: now,
        }
        .create_token(&self.state.config.auth.jwt_secret)
        .unwrap()
    }

    pub fn reader(&self, user_id: i64) -> String {
        self.token(user_id, Role::Reader)
    }

    pub fn archivist(&self, user_id: i64) -> String {
        self.token(user_id, Role::Archivist)
    }

    pub fn admin(&self) -> String {
        self.token(ADMIN, Role::Admin)
    }

    pub async fn send(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(format!("/api/v1{}", uri));
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(token), Some(body)).await
    }

    /// Publish a one-step borrow approval workflow whose task goes to the configured reviewers
    pub async fn publish_borrow_workflow(&self) -> i64 {
        let admin = self.admin();
        let (status, draft) = self
            .post(
                "/workflow/definitions",
                &admin,
                serde_json::json!({
                    "name": "Borrow approval",
                    "business_type": "archive-borrow",
                    "steps": [{ "name": "desk review", "approver": { "rule": "participant" } }]
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", draft);
        let id = draft["id"].as_i64().unwrap();

        let (status, published) = self
            .post(&format!("/workflow/definitions/{}/publish", id), &admin, serde_json::json!({}))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", published);
        id
    }

    /// File an application as `borrower_id` and return the record
    pub async fn apply(&self, archive_id: i64, borrower_id: i64) -> (StatusCode, Value) {
        self.post(
            "/borrows",
            &self.reader(borrower_id),
            serde_json::json!({ "archive_id": archive_id, "requested_days": 7, "purpose": "research" }),
        )
        .await
    }
}
