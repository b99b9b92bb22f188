//! Borrow applications routed through the approval workflow

use archive_circulation::{
    error::AppError,
    models::{BorrowStatus, Role},
    services::borrows::ApplyBorrow,
};
use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::common::{start_time, test_app, ADMIN, REVIEWER};

fn timestamp(value: &Value) -> DateTime<Utc> {
    serde_json::from_value(value.clone()).unwrap()
}

#[tokio::test]
async fn test_task_approval_lends_the_archive() {
    let app = test_app();
    app.publish_borrow_workflow().await;

    let (status, record) = app.apply(10, 5).await;
    assert_eq!(status, StatusCode::CREATED, "{}", record);
    let borrow_id = record["id"].as_i64().unwrap();
    let instance_id = record["workflow_instance_id"].as_i64().unwrap();

    let reviewer = app.archivist(REVIEWER);
    let (status, tasks) = app.get("/workflow/tasks/mine", &reviewer).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tasks["total"], 1);
    let task = &tasks["items"][0];
    assert_eq!(task["instance_id"], instance_id);
    assert_eq!(task["status"], "PENDING");

    app.clock.advance(Duration::hours(2));
    let (status, completion) = app
        .post(
            &format!("/workflow/tasks/{}/complete", task["id"]),
            &reviewer,
            json!({ "result": "APPROVE", "comment": "fine" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", completion);
    assert_eq!(completion["outcome"], "APPROVED");
    assert_eq!(completion["instance"]["status"], "COMPLETED");

    let (_, lent) = app.get(&format!("/borrows/{}", borrow_id), &reviewer).await;
    assert_eq!(lent["status"], "BORROWED");
    assert_eq!(lent["approver_id"], REVIEWER);
    let borrowed_at = timestamp(&lent["borrow_time"]);
    assert_eq!(borrowed_at, start_time() + Duration::hours(2));
    assert_eq!(timestamp(&lent["expected_return_time"]), borrowed_at + Duration::days(7));

    let (status, history) = app.get(&format!("/borrows/{}/history", borrow_id), &app.reader(5)).await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<_> = history.as_array().unwrap().iter().map(|h| h["action"].clone()).collect();
    assert_eq!(
        actions,
        vec![json!("STARTED"), json!("TASK_CREATED"), json!("TASK_COMPLETED"), json!("COMPLETED")]
    );
}

#[tokio::test]
async fn test_review_endpoint_rejects_through_workflow() {
    let app = test_app();
    app.publish_borrow_workflow().await;
    let (_, record) = app.apply(10, 5).await;
    let borrow_id = record["id"].as_i64().unwrap();

    // the task belongs to the configured reviewer only
    let (status, _) = app
        .post(&format!("/borrows/{}/review", borrow_id), &app.archivist(77), json!({ "decision": "REJECT" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, rejected) = app
        .post(
            &format!("/borrows/{}/review", borrow_id),
            &app.archivist(REVIEWER),
            json!({ "decision": "REJECT", "remark": "fragile" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", rejected);
    assert_eq!(rejected["status"], "REJECTED");

    let instance_id = record["workflow_instance_id"].as_i64().unwrap();
    let (_, instance) = app
        .get(&format!("/workflow/instances/{}", instance_id), &app.archivist(REVIEWER))
        .await;
    assert_eq!(instance["outcome"], "REJECTED");

    let (status, body) = app
        .post(&format!("/borrows/{}/return", borrow_id), &app.archivist(REVIEWER), json!({}))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_reviewer_override_of_loan_length() {
    let app = test_app();
    app.publish_borrow_workflow().await;
    let (_, record) = app.apply(10, 5).await;
    let borrow_id = record["id"].as_i64().unwrap();

    let (status, lent) = app
        .post(
            &format!("/borrows/{}/review", borrow_id),
            &app.archivist(REVIEWER),
            json!({ "decision": "APPROVE", "approved_days": 3 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", lent);
    assert_eq!(
        timestamp(&lent["expected_return_time"]),
        timestamp(&lent["borrow_time"]) + Duration::days(3)
    );
}

#[tokio::test]
async fn test_archive_without_approval_skips_workflow() {
    let app = test_app();
    app.publish_borrow_workflow().await;

    let admin = app.token(ADMIN, Role::Admin);
    let (status, _) = app
        .send(
            axum::http::Method::PUT,
            "/archives/10/approval",
            Some(&admin),
            Some(json!({ "required": false })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, direct) = app.apply(10, 5).await;
    assert!(direct["workflow_instance_id"].is_null());
    let (_, routed) = app.apply(11, 5).await;
    assert!(routed["workflow_instance_id"].is_i64());
}

#[tokio::test]
async fn test_cancel_terminates_the_approval() {
    let app = test_app();
    app.publish_borrow_workflow().await;
    let (_, record) = app.apply(10, 5).await;
    let borrow_id = record["id"].as_i64().unwrap();
    let instance_id = record["workflow_instance_id"].as_i64().unwrap();

    let (status, _) = app.post(&format!("/borrows/{}/cancel", borrow_id), &app.reader(5), json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let reviewer = app.archivist(REVIEWER);
    let (_, instance) = app.get(&format!("/workflow/instances/{}", instance_id), &reviewer).await;
    assert_eq!(instance["status"], "TERMINATED");
    assert!(instance["outcome"].is_null());

    let (_, tasks) = app.get("/workflow/tasks/mine", &reviewer).await;
    assert_eq!(tasks["total"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applications_for_one_archive() {
    let app = test_app();
    let borrows = app.state.services.borrows.clone();

    let attempts: Vec<_> = (0..8)
        .map(|borrower| {
            let borrows = borrows.clone();
            tokio::spawn(async move {
                borrows
                    .apply(ApplyBorrow {
                        archive_id: 42,
                        borrower_id: 100 + borrower,
                        requested_days: 7,
                        purpose: None,
                    })
                    .await
            })
        })
        .collect();

    let mut won = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(record) => {
                assert_eq!(record.status, BorrowStatus::Pending);
                won += 1;
            }
            Err(AppError::AlreadyBorrowed(_)) | Err(AppError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(won, 1);

    let availability = app.state.services.borrows.availability(42).await.unwrap();
    assert_eq!(availability.active_status, Some(BorrowStatus::Pending));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_task_completion_resolves_once() {
    let app = test_app();
    app.publish_borrow_workflow().await;
    let (_, record) = app.apply(10, 5).await;
    let borrow_id = record["id"].as_i64().unwrap();

    let reviewer = app.archivist(REVIEWER);
    let uri = format!("/borrows/{}/review", borrow_id);
    let (first, second) = tokio::join!(
        app.post(&uri, &reviewer, json!({ "decision": "APPROVE" })),
        app.post(&uri, &reviewer, json!({ "decision": "REJECT" })),
    );

    let statuses = [first.0, second.0];
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 1, "{:?} {:?}", first, second);

    let (_, current) = app.get(&format!("/borrows/{}", borrow_id), &reviewer).await;
    let winner = if first.0 == StatusCode::OK { &first.1 } else { &second.1 };
    assert_eq!(current["status"], winner["status"]);
}
