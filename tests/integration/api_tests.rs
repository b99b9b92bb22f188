//! Borrow endpoints end to end

use axum::http::{Method, StatusCode};
use chrono::Duration;
use serde_json::json;

use crate::common::{start_time, test_app, REVIEWER};

#[tokio::test]
async fn test_health_check() {
    let app = test_app();
    let (status, body) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = app.send(Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_unauthorized_access() {
    let app = test_app();
    let (status, body) = app.send(Method::GET, "/borrows", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "NOT_AUTHENTICATED");

    let (status, _) = app.send(Method::GET, "/borrows", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_second_application_is_already_borrowed() {
    let app = test_app();

    let (status, first) = app.apply(10, 5).await;
    assert_eq!(status, StatusCode::CREATED, "{}", first);
    assert_eq!(first["status"], "PENDING");
    assert_eq!(first["borrower_id"], 5);

    let (status, body) = app.apply(10, 6).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_BORROWED");
}

#[tokio::test]
async fn test_rejected_application_cannot_be_returned() {
    let app = test_app();
    let reviewer = app.archivist(REVIEWER);
    let (_, record) = app.apply(10, 5).await;
    let id = record["id"].as_i64().unwrap();

    let (status, rejected) = app
        .post(&format!("/borrows/{}/review", id), &reviewer, json!({ "decision": "REJECT", "remark": "restricted" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", rejected);
    assert_eq!(rejected["status"], "REJECTED");
    assert_eq!(rejected["approve_remark"], "restricted");

    let (status, body) = app.post(&format!("/borrows/{}/return", id), &reviewer, json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_return_is_recorded_once() {
    let app = test_app();
    let reviewer = app.archivist(REVIEWER);
    let (_, record) = app.apply(10, 5).await;
    let id = record["id"].as_i64().unwrap();

    let (status, lent) = app
        .post(&format!("/borrows/{}/review", id), &reviewer, json!({ "decision": "APPROVE" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", lent);
    assert_eq!(lent["status"], "BORROWED");

    app.clock.advance(Duration::days(3));
    let (status, returned) = app
        .post(&format!("/borrows/{}/return", id), &reviewer, json!({ "condition": "GOOD", "remark": "intact" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", returned);
    assert_eq!(returned["status"], "RETURNED");
    assert!(returned["actual_return_time"].is_string());

    let (status, body) = app.post(&format!("/borrows/{}/return", id), &reviewer, json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INVALID_STATE");

    // the archive can be borrowed again
    let (status, _) = app.apply(10, 6).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_readers_cannot_review_or_see_other_records() {
    let app = test_app();
    let (_, record) = app.apply(10, 5).await;
    let id = record["id"].as_i64().unwrap();

    let (status, body) = app
        .post(&format!("/borrows/{}/review", id), &app.reader(5), json!({ "decision": "APPROVE" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "NOT_AUTHORIZED");

    let (status, _) = app.get(&format!("/borrows/{}", id), &app.reader(6)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app.get(&format!("/borrows/{}", id), &app.reader(5)).await;
    assert_eq!(status, StatusCode::OK);

    // readers only ever list their own records
    app.apply(11, 6).await;
    let (status, page) = app.get("/borrows?borrower_id=6", &app.reader(5)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["borrower_id"], 5);

    let (_, page) = app.get("/borrows", &app.archivist(REVIEWER)).await;
    assert_eq!(page["total"], 2);
}

#[tokio::test]
async fn test_extension_limit_and_hold() {
    let app = test_app();
    let reviewer = app.archivist(REVIEWER);
    let borrower = app.reader(5);
    let (_, record) = app.apply(10, 5).await;
    let id = record["id"].as_i64().unwrap();
    app.post(&format!("/borrows/{}/review", id), &reviewer, json!({ "decision": "APPROVE" }))
        .await;

    let extend = format!("/borrows/{}/extend", id);
    let (status, extended) = app.post(&extend, &borrower, json!({ "days": 5 })).await;
    assert_eq!(status, StatusCode::OK, "{}", extended);
    assert_eq!(extended["extension_count"], 1);

    let (status, availability) = app.post("/archives/10/hold", &reviewer, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(availability["on_hold"], true);
    assert_eq!(availability["on_loan"], true);

    let (status, body) = app.post(&extend, &borrower, json!({ "days": 5 })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "HOLD_CONFLICT");

    let (status, _) = app.send(Method::DELETE, "/archives/10/hold", Some(&reviewer), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.post(&extend, &borrower, json!({ "days": 5, "reason": "thesis" })).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app.post(&extend, &borrower, json!({ "days": 5 })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "EXTENSION_LIMIT_EXCEEDED");

    let (status, _) = app.post(&extend, &app.reader(6), json!({ "days": 1 })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invalid_requests_are_bad_values() {
    let app = test_app();
    let (status, body) = app
        .post("/borrows", &app.reader(5), json!({ "archive_id": 10, "requested_days": 0 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_VALUE");

    let (_, record) = app.apply(10, 5).await;
    let id = record["id"].as_i64().unwrap();
    let reviewer = app.archivist(REVIEWER);
    app.post(&format!("/borrows/{}/review", id), &reviewer, json!({ "decision": "APPROVE" }))
        .await;
    let (status, body) = app
        .post(&format!("/borrows/{}/return", id), &reviewer, json!({ "condition": "DAMAGED" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_VALUE");
}

#[tokio::test]
async fn test_cancel_by_borrower_only() {
    let app = test_app();
    let (_, record) = app.apply(10, 5).await;
    let id = record["id"].as_i64().unwrap();

    let (status, _) = app.post(&format!("/borrows/{}/cancel", id), &app.reader(6), json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, cancelled) = app
        .post(&format!("/borrows/{}/cancel", id), &app.reader(5), json!({ "reason": "found a copy" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", cancelled);
    assert_eq!(cancelled["status"], "CANCELLED");
    assert_eq!(cancelled["cancel_reason"], "found a copy");

    let (status, _) = app.apply(10, 6).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_batch_review_partial_success() {
    let app = test_app();
    let reviewer = app.archivist(REVIEWER);
    let (_, a) = app.apply(10, 5).await;
    let (_, b) = app.apply(11, 6).await;
    let b_id = b["id"].as_i64().unwrap();
    app.post(&format!("/borrows/{}/review", b_id), &reviewer, json!({ "decision": "REJECT" }))
        .await;

    let (status, report) = app
        .post(
            "/borrows/batch-review",
            &reviewer,
            json!({ "borrow_ids": [a["id"], b_id], "decision": "APPROVE" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", report);
    assert_eq!(report["succeeded"], json!([a["id"]]));
    assert_eq!(report["failed"][0]["borrow_id"], b_id);
    assert_eq!(report["failed"][0]["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_overdue_statistics_and_sweep() {
    let app = test_app();
    let reviewer = app.archivist(REVIEWER);
    let (_, a) = app.apply(10, 5).await;
    let a_id = a["id"].as_i64().unwrap();
    app.post(&format!("/borrows/{}/review", a_id), &reviewer, json!({ "decision": "APPROVE" }))
        .await;
    app.apply(11, 6).await;

    app.clock.set(start_time() + Duration::days(9));
    let (status, overdue) = app.get("/borrows/overdue", &reviewer).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(overdue.as_array().unwrap().len(), 1);
    assert_eq!(overdue[0]["id"], a_id);

    let (status, stats) = app.get("/borrows/statistics", &reviewer).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_applications"], 2);
    assert_eq!(stats["overdue_records"], 1);
    assert_eq!(stats["approval_rate"], 50.0);

    let (status, _) = app.post("/borrows/sweep", &reviewer, json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, report) = app.post("/borrows/sweep", &app.admin(), json!({})).await;
    assert_eq!(status, StatusCode::OK, "{}", report);
    assert_eq!(report["overdue"].as_array().unwrap().len(), 1);
    assert_eq!(report["interrupted"], false);

    let (status, history) = app.get("/users/5/borrows", &app.reader(5)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);
}
