use serde_json::{Value, json};

use crate::helpers::*;

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let server = TestServer::new().await;

    let resp = server.get("/health").await;

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");

    server.cleanup().await;
}

#[tokio::test]
async fn status_endpoint_reports_counters() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;
    server
        .client
        .post(server.url(&format!("/integrations/{}/alerts", integration.id)))
        .json(&json!({ "title": "disk" }))
        .send()
        .await
        .unwrap();

    let resp = server.get("/status").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["alerts_ingested"], 1);
    assert_eq!(body["alert_groups_created"], 1);
    assert_eq!(body["maintenance_windows"], 0);

    server.cleanup().await;
}
