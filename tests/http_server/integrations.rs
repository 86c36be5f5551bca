use reqwest::Method;
use serde_json::{Value, json};

use crate::helpers::*;

#[tokio::test]
async fn create_integration_requires_api_key_and_validates() {
    let server = TestServer::new().await;

    let resp = server.client.post(server.url("/integrations")).json(&json!({ "name": "grafana" })).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .authed(Method::POST, "/integrations")
        .json(&json!({ "name": "grafana", "grouping_template": "{{ payload.labels.alertname }}" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["integration"]["name"], "grafana");

    let resp = server
        .authed(Method::POST, "/integrations")
        .json(&json!({ "name": "broken", "resolve_condition": "payload.state ==" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    let resp = server.authed(Method::POST, "/integrations").json(&json!({ "name": "  " })).send().await.unwrap();
    assert_eq!(resp.status(), 422);

    let resp = server.get("/integrations").await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["integrations"].as_array().unwrap().len(), 1);

    server.cleanup().await;
}

#[tokio::test]
async fn ingest_groups_alerts_without_api_key() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;
    let path = format!("/integrations/{}/alerts", integration.id);

    let resp = server.client.post(server.url(&path)).json(&json!({ "title": "disk" })).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    let first: Value = resp.json().await.unwrap();
    assert_eq!(first["created"], true);

    let resp = server.get(&format!("/alert-groups/{}/alerts", first["alert_group_id"])).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["alerts"].as_array().unwrap().len(), 1);

    let resp = server.client.post(server.url("/integrations/999/alerts")).json(&json!({})).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    server.cleanup().await;
}

#[tokio::test]
async fn deleted_integration_rejects_alerts() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;

    let resp = server.authed(Method::DELETE, &format!("/integrations/{}", integration.id)).send().await.unwrap();
    assert_eq!(resp.status(), 204);

    let resp = server
        .client
        .post(server.url(&format!("/integrations/{}/alerts", integration.id)))
        .json(&json!({ "title": "late" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.cleanup().await;
}

#[tokio::test]
async fn heartbeat_configure_and_ping() {
    let server = TestServer::new().await;
    let integration = server.create_integration("cron").await;
    let path = format!("/integrations/{}/heartbeat", integration.id);

    let resp = server.client.post(server.url(&path)).send().await.unwrap();
    assert_eq!(resp.status(), 404, "ping before configuration");

    let resp = server.authed(Method::PUT, &path).json(&json!({ "interval_secs": 0 })).send().await.unwrap();
    assert_eq!(resp.status(), 422);

    let resp = server.authed(Method::PUT, &path).json(&json!({ "interval_secs": 60 })).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["heartbeat"]["interval_seconds"], 60);

    let resp = server.client.post(server.url(&path)).send().await.unwrap();
    assert_eq!(resp.status(), 204);

    server.cleanup().await;
}

#[tokio::test]
async fn maintenance_start_get_and_stop() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;
    let path = format!("/integrations/{}/maintenance", integration.id);

    let body: Value = server.get(&path).await.json().await.unwrap();
    assert_eq!(body["maintenance"], Value::Null);

    let resp = server
        .authed(Method::PUT, &path)
        .json(&json!({ "mode": "suppress", "duration_secs": 3600 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = server.get(&path).await.json().await.unwrap();
    assert_eq!(body["maintenance"]["mode"], "suppress");

    let resp = server.authed(Method::DELETE, &path).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    let resp = server.authed(Method::DELETE, &path).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    server.cleanup().await;
}
