use reqwest::Method;
use serde_json::{Value, json};

use crate::helpers::*;

async fn ingest(server: &TestServer, integration_id: i64, payload: Value) -> i64 {
    let resp = server
        .client
        .post(server.url(&format!("/integrations/{integration_id}/alerts")))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    body["alert_group_id"].as_i64().unwrap()
}

#[tokio::test]
async fn acknowledge_then_resolve_records_the_user() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;
    let group_id = ingest(&server, integration.id, json!({ "title": "disk" })).await;
    let path = format!("/alert-groups/{group_id}/actions");

    let resp = server
        .authed(Method::POST, &path)
        .json(&json!({ "action": "acknowledge", "user_id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["changed"], true);
    assert_eq!(body["alert_group"]["status"], "acknowledged");

    let body: Value = server
        .authed(Method::POST, &path)
        .json(&json!({ "action": "acknowledge", "user_id": "alice" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["changed"], false, "acknowledging twice is a no-op");

    let body: Value = server
        .authed(Method::POST, &path)
        .json(&json!({ "action": "resolve", "user_id": "alice" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["alert_group"]["status"], "resolved");

    let body: Value = server.get(&format!("/alert-groups/{group_id}/timeline")).await.json().await.unwrap();
    let events: Vec<&str> =
        body["timeline"].as_array().unwrap().iter().map(|e| e["event"]["type"].as_str().unwrap()).collect();
    assert!(events.contains(&"acknowledged"));
    assert!(events.contains(&"resolved"));

    server.cleanup().await;
}

#[tokio::test]
async fn action_validation() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;
    let group_id = ingest(&server, integration.id, json!({ "title": "disk" })).await;
    let path = format!("/alert-groups/{group_id}/actions");

    let resp = server
        .authed(Method::POST, &path)
        .json(&json!({ "action": "silence", "duration_secs": 0, "user_id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    let resp = server
        .authed(Method::POST, &path)
        .json(&json!({ "action": "acknowledge", "user_id": " " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    let resp = server
        .authed(Method::POST, "/alert-groups/999/actions")
        .json(&json!({ "action": "acknowledge", "user_id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = server
        .client
        .post(server.url(&path))
        .json(&json!({ "action": "acknowledge", "user_id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    server.cleanup().await;
}

#[tokio::test]
async fn bulk_action_reports_each_id() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;
    let a = ingest(&server, integration.id, json!({ "title": "a" })).await;
    let b = ingest(&server, integration.id, json!({ "title": "b" })).await;

    let resp = server
        .authed(Method::POST, "/alert-groups/bulk-action")
        .json(&json!({ "action": "resolve", "user_id": "alice", "alert_group_ids": [a, b, 999] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["result"], "applied");
    assert_eq!(results[2]["result"], "not_found");

    let body: Value = server.get("/alert-groups?status=resolved").await.json().await.unwrap();
    assert_eq!(body["alert_groups"].as_array().unwrap().len(), 2);

    let resp = server.get("/alert-groups?label=broken").await;
    assert_eq!(resp.status(), 400);

    server.cleanup().await;
}

#[tokio::test]
async fn direct_page_creates_a_group() {
    let server = TestServer::new().await;
    let integration = server.create_integration("manual").await;

    let resp = server
        .authed(Method::POST, "/paging")
        .json(&json!({
            "integration_id": integration.id,
            "title": "Database on fire",
            "responders": [{ "type": "user", "id": "alice", "tier": "important" }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["created"], true);

    let resp = server
        .authed(Method::POST, "/paging")
        .json(&json!({ "integration_id": integration.id, "title": "t", "responders": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    server.cleanup().await;
}
