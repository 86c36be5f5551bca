use std::{net::SocketAddr, sync::Arc};

use beacon::{
    config::{AppConfig, ServerConfig},
    engine::{
        pipeline::IngestHandle,
        workers::run_ingest_workers,
    },
    http_server::{self, ApiState},
    models::Integration,
    routing::PredicateEvaluator,
    test_helpers::EngineHarness,
};
use reqwest::{Client, RequestBuilder};
use tokio::task;
use tokio_util::sync::CancellationToken;

pub const API_KEY: &str = "test-key";

pub struct TestServer {
    pub address: SocketAddr,
    pub engine: EngineHarness,
    pub client: Client,
    token: CancellationToken,
    handles: Vec<task::JoinHandle<()>>,
}

impl TestServer {
    pub async fn new() -> Self {
        let engine = EngineHarness::new().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
        let address = listener.local_addr().expect("Failed to get address");

        let config = AppConfig {
            server: ServerConfig {
                listen_address: address.to_string(),
                api_key: Some(API_KEY.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let (ingest, ingest_rx) = IngestHandle::new(16);
        let state = ApiState {
            config: Arc::new(config),
            repo: engine.repo.clone(),
            metrics: engine.harness.metrics.clone(),
            clock: engine.clock.clone(),
            ingest,
            pipeline: engine.pipeline.clone(),
            actions: engine.actions.clone(),
            routes: engine.routes.clone(),
            maintenance: engine.maintenance.clone(),
            heartbeat: engine.heartbeat.clone(),
            evaluator: Arc::new(PredicateEvaluator::new()),
        };

        let token = CancellationToken::new();
        let workers =
            task::spawn(run_ingest_workers(engine.pipeline.clone(), ingest_rx, 2, token.clone()));
        let server = task::spawn(http_server::serve(listener, state, token.clone()));

        Self { address, engine, client: Client::new(), token, handles: vec![workers, server] }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.expect("Request failed")
    }

    /// A request carrying the API key.
    pub fn authed(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path)).bearer_auth(API_KEY)
    }

    pub async fn create_integration(&self, name: &str) -> Integration {
        let integration = self.engine.harness.create_integration(name).await;
        self.engine.routes.reload_integration(integration.id).await.unwrap();
        integration
    }

    pub async fn cleanup(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
