//! Workflow engine endpoints with a business type that has no participant

use axum::http::StatusCode;
use serde_json::{json, Value};

use crate::common::{test_app, TestApp, REVIEWER, SECOND_REVIEWER};

const BUSINESS_TYPE: &str = "document-review";

async fn publish_two_step(app: &TestApp) -> i64 {
    let admin = app.admin();
    let (status, draft) = app
        .post(
            "/workflow/definitions",
            &admin,
            json!({
                "name": "Two-step review",
                "business_type": BUSINESS_TYPE,
                "steps": [
                    { "name": "first", "approver": { "rule": "user", "user_id": REVIEWER } },
                    { "name": "second", "approver": { "rule": "any_of", "user_ids": [SECOND_REVIEWER, 4] } }
                ]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", draft);
    assert_eq!(draft["status"], "DRAFT");
    let id = draft["id"].as_i64().unwrap();

    let (status, published) = app
        .post(&format!("/workflow/definitions/{}/publish", id), &admin, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", published);
    assert_eq!(published["is_current"], true);
    id
}

async fn start(app: &TestApp, business_id: i64) -> Value {
    let (status, instance) = app
        .post(
            "/workflow/instances",
            &app.archivist(9),
            json!({
                "business_type": BUSINESS_TYPE,
                "business_id": business_id,
                "variables": { "pages": { "type": "int", "value": 12 } }
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", instance);
    instance
}

async fn pending_task(app: &TestApp, instance_id: i64) -> Value {
    let (status, tasks) = app
        .get(&format!("/workflow/instances/{}/tasks", instance_id), &app.admin())
        .await;
    assert_eq!(status, StatusCode::OK);
    tasks
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["status"] == "PENDING")
        .cloned()
        .unwrap()
}

#[tokio::test]
async fn test_two_step_approval_runs_in_order() {
    let app = test_app();
    publish_two_step(&app).await;
    let instance = start(&app, 500).await;
    let instance_id = instance["id"].as_i64().unwrap();
    assert_eq!(instance["status"], "RUNNING");

    let first = pending_task(&app, instance_id).await;
    assert_eq!(first["assignee_id"], REVIEWER);

    // the second-step candidates cannot act on the first step
    let (status, _) = app
        .post(
            &format!("/workflow/tasks/{}/complete", first["id"]),
            &app.archivist(SECOND_REVIEWER),
            json!({ "result": "APPROVE" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, completion) = app
        .post(
            &format!("/workflow/tasks/{}/complete", first["id"]),
            &app.archivist(REVIEWER),
            json!({ "result": "APPROVE" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", completion);
    assert!(completion["outcome"].is_null());
    assert_eq!(completion["next_task"]["candidate_ids"], json!([SECOND_REVIEWER, 4]));

    let (_, mine) = app.get("/workflow/tasks/mine", &app.archivist(4)).await;
    assert_eq!(mine["total"], 1);

    let second_id = completion["next_task"]["id"].clone();
    let (status, done) = app
        .post(
            &format!("/workflow/tasks/{}/complete", second_id),
            &app.archivist(SECOND_REVIEWER),
            json!({ "result": "APPROVE", "variables": { "stamp": { "type": "text", "value": "ok" } } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", done);
    assert_eq!(done["outcome"], "APPROVED");
    assert_eq!(done["task"]["assignee_id"], SECOND_REVIEWER);
    assert_eq!(done["instance"]["variables"]["pages"]["value"], 12);
    assert_eq!(done["instance"]["variables"]["stamp"]["value"], "ok");

    // at most once
    let (status, body) = app
        .post(
            &format!("/workflow/tasks/{}/complete", second_id),
            &app.archivist(SECOND_REVIEWER),
            json!({ "result": "REJECT" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "TASK_ALREADY_RESOLVED");

    let (_, history) = app
        .get(&format!("/workflow/instances/{}/history", instance_id), &app.admin())
        .await;
    let actions: Vec<_> = history.as_array().unwrap().iter().map(|h| h["action"].clone()).collect();
    assert_eq!(
        actions,
        vec![
            json!("STARTED"),
            json!("TASK_CREATED"),
            json!("TASK_COMPLETED"),
            json!("TASK_CREATED"),
            json!("TASK_COMPLETED"),
            json!("COMPLETED")
        ]
    );
}

#[tokio::test]
async fn test_rejection_ends_the_instance() {
    let app = test_app();
    publish_two_step(&app).await;
    let instance = start(&app, 501).await;
    let instance_id = instance["id"].as_i64().unwrap();

    let first = pending_task(&app, instance_id).await;
    let (status, completion) = app
        .post(
            &format!("/workflow/tasks/{}/complete", first["id"]),
            &app.archivist(REVIEWER),
            json!({ "result": "REJECT", "comment": "incomplete" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(completion["outcome"], "REJECTED");
    assert!(completion["next_task"].is_null());

    let (_, tasks) = app
        .get(&format!("/workflow/instances/{}/tasks", instance_id), &app.admin())
        .await;
    assert_eq!(tasks.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancelled_is_not_a_valid_task_result() {
    let app = test_app();
    publish_two_step(&app).await;
    let instance = start(&app, 502).await;
    let first = pending_task(&app, instance["id"].as_i64().unwrap()).await;

    let (status, body) = app
        .post(
            &format!("/workflow/tasks/{}/complete", first["id"]),
            &app.archivist(REVIEWER),
            json!({ "result": "CANCELLED" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_VALUE");
}

#[tokio::test]
async fn test_suspended_instance_rejects_task_actions() {
    let app = test_app();
    publish_two_step(&app).await;
    let instance = start(&app, 503).await;
    let instance_id = instance["id"].as_i64().unwrap();
    let first = pending_task(&app, instance_id).await;
    let admin = app.admin();

    let (status, _) = app
        .post(&format!("/workflow/instances/{}/suspend", instance_id), &app.archivist(REVIEWER), json!({}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, suspended) = app
        .post(
            &format!("/workflow/instances/{}/suspend", instance_id),
            &admin,
            json!({ "reason": "audit" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(suspended["status"], "SUSPENDED");

    let complete = format!("/workflow/tasks/{}/complete", first["id"]);
    let (status, body) = app
        .post(&complete, &app.archivist(REVIEWER), json!({ "result": "APPROVE" }))
        .await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["code"], "INSTANCE_SUSPENDED");

    let (status, resumed) = app
        .post(&format!("/workflow/instances/{}/resume", instance_id), &admin, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["status"], "RUNNING");

    let (status, _) = app
        .post(&complete, &app.archivist(REVIEWER), json!({ "result": "APPROVE" }))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_terminate_cancels_pending_tasks() {
    let app = test_app();
    publish_two_step(&app).await;
    let instance = start(&app, 504).await;
    let instance_id = instance["id"].as_i64().unwrap();
    let first = pending_task(&app, instance_id).await;

    let (status, terminated) = app
        .post(
            &format!("/workflow/instances/{}/terminate", instance_id),
            &app.admin(),
            json!({ "reason": "withdrawn" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", terminated);
    assert_eq!(terminated["status"], "TERMINATED");

    let (_, task) = app.get(&format!("/workflow/tasks/{}", first["id"]), &app.admin()).await;
    assert_eq!(task["status"], "COMPLETED");
    assert_eq!(task["result"], "CANCELLED");

    let (status, _) = app
        .post(&format!("/workflow/instances/{}/resume", instance_id), &app.admin(), json!({}))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_transfer_hands_task_over() {
    let app = test_app();
    publish_two_step(&app).await;
    let instance = start(&app, 505).await;
    let first = pending_task(&app, instance["id"].as_i64().unwrap()).await;

    let transfer = format!("/workflow/tasks/{}/transfer", first["id"]);
    let (status, _) = app
        .post(&transfer, &app.archivist(SECOND_REVIEWER), json!({ "to_user_id": 8 }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, task) = app
        .post(&transfer, &app.archivist(REVIEWER), json!({ "to_user_id": 8, "reason": "on leave" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", task);
    assert_eq!(task["assignee_id"], 8);
    assert_eq!(task["status"], "PENDING");

    let (status, _) = app
        .post(
            &format!("/workflow/tasks/{}/complete", first["id"]),
            &app.archivist(REVIEWER),
            json!({ "result": "APPROVE" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (_, mine) = app.get("/workflow/tasks/mine", &app.reader(8)).await;
    assert_eq!(mine["total"], 1);
}

#[tokio::test]
async fn test_publishing_a_new_version_replaces_the_current_one() {
    let app = test_app();
    let first = publish_two_step(&app).await;
    let second = publish_two_step(&app).await;
    let admin = app.admin();

    let (status, current) = app
        .get(&format!("/workflow/definitions/current?business_type={}", BUSINESS_TYPE), &admin)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current["id"], second);
    assert_eq!(current["version"], 2);

    let (_, old) = app.get(&format!("/workflow/definitions/{}", first), &admin).await;
    assert_eq!(old["is_current"], false);
    assert_eq!(old["status"], "PUBLISHED");

    // published definitions are immutable
    let (status, _) = app
        .send(
            axum::http::Method::PUT,
            &format!("/workflow/definitions/{}/steps", second),
            Some(&admin),
            Some(json!({ "steps": [{ "name": "only", "approver": { "rule": "initiator" } }] })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = app
        .get("/workflow/definitions/current?business_type=unknown", &admin)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "DEFINITION_NOT_FOUND");
}

#[tokio::test]
async fn test_statistics_and_listing() {
    let app = test_app();
    publish_two_step(&app).await;
    let a = start(&app, 600).await;
    start(&app, 601).await;
    let admin = app.admin();

    app.post(&format!("/workflow/instances/{}/suspend", a["id"]), &admin, json!({}))
        .await;

    let (status, stats) = app.get("/workflow/statistics", &admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_instances"], 2);
    assert_eq!(stats["running_instances"], 1);
    assert_eq!(stats["suspended_instances"], 1);
    assert_eq!(stats["pending_tasks"], 2);

    let (_, page) = app.get("/workflow/instances?status=SUSPENDED", &admin).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["id"], a["id"]);
}
