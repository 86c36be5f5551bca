use reqwest::Method;
use serde_json::{Value, json};

use crate::helpers::*;

async fn add_route(server: &TestServer, integration_id: i64, expression: &str) -> Value {
    let resp = server
        .authed(Method::POST, &format!("/integrations/{integration_id}/routes"))
        .json(&json!({ "filter": { "type": "template", "value": expression } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    body["route"].clone()
}

#[tokio::test]
async fn routes_are_inserted_before_the_default() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;

    let critical = add_route(&server, integration.id, "payload.severity == 'critical'").await;
    assert_eq!(critical["position"], 0);

    let body: Value = server.get(&format!("/integrations/{}/routes", integration.id)).await.json().await.unwrap();
    let routes = body["routes"].as_array().unwrap();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[1]["filter"]["type"], "match_all");

    let resp = server
        .authed(Method::POST, &format!("/integrations/{}/routes", integration.id))
        .json(&json!({ "filter": { "type": "regex", "value": "(" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    server.cleanup().await;
}

#[tokio::test]
async fn default_route_cannot_be_deleted() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;

    let body: Value = server.get(&format!("/integrations/{}/routes", integration.id)).await.json().await.unwrap();
    let default_id = body["routes"][0]["id"].as_i64().unwrap();

    let resp = server.authed(Method::DELETE, &format!("/routes/{default_id}")).send().await.unwrap();
    assert_eq!(resp.status(), 422);

    server.cleanup().await;
}

#[tokio::test]
async fn move_with_stale_view_conflicts() {
    let server = TestServer::new().await;
    let integration = server.create_integration("grafana").await;
    let a = add_route(&server, integration.id, "payload.a").await;
    let b = add_route(&server, integration.id, "payload.b").await;
    let (a_id, b_id) = (a["id"].as_i64().unwrap(), b["id"].as_i64().unwrap());

    let resp = server
        .authed(Method::POST, &format!("/routes/{a_id}/move"))
        .json(&json!({ "from": 0, "to": 1, "expected_rule_at_to": a_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = server
        .authed(Method::POST, &format!("/routes/{a_id}/move"))
        .json(&json!({ "from": 0, "to": 1, "expected_rule_at_to": b_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["route"]["position"], 1);

    server.cleanup().await;
}
