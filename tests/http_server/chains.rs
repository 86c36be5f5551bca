use reqwest::Method;
use serde_json::{Value, json};

use crate::helpers::*;

#[tokio::test]
async fn chain_crud() {
    let server = TestServer::new().await;

    let chain = json!({
        "name": "critical",
        "steps": [
            { "type": "notify_users", "user_ids": ["alice"], "tier": "important" },
            { "type": "wait", "delay_secs": 300 },
            { "type": "repeat_escalation" }
        ]
    });
    let resp = server.authed(Method::POST, "/escalation-chains").json(&chain).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    let id = body["escalation_chain"]["id"].as_i64().unwrap();

    let resp = server.authed(Method::POST, "/escalation-chains").json(&chain).send().await.unwrap();
    assert_eq!(resp.status(), 409, "names are unique");

    let body: Value = server.get(&format!("/escalation-chains/{id}")).await.json().await.unwrap();
    assert_eq!(body["escalation_chain"]["steps"].as_array().unwrap().len(), 3);

    let resp = server
        .authed(Method::PUT, &format!("/escalation-chains/{id}"))
        .json(&json!({ "name": "critical", "steps": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = server.authed(Method::DELETE, &format!("/escalation-chains/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    assert_eq!(server.get(&format!("/escalation-chains/{id}")).await.status(), 404);

    server.cleanup().await;
}

#[tokio::test]
async fn invalid_chain_is_rejected() {
    let server = TestServer::new().await;

    let resp = server
        .authed(Method::POST, "/escalation-chains")
        .json(&json!({ "name": "", "steps": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    server.cleanup().await;
}
