use serde::Deserialize;

/// Configuration for the REST API server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Whether the HTTP server is started.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Address and port for the HTTP server to listen on.
    #[serde(default = "default_api_server_listen_address")]
    pub listen_address: String,

    /// Optional API key for securing write-endpoints.
    /// If not set in config, falls back to `BEACON_API_KEY` env var.
    #[serde(rename = "api_key", default = "default_api_key_from_env")]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen_address: default_api_server_listen_address(),
            api_key: default_api_key_from_env(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Provides the default value for api_server_listen_address.
fn default_api_server_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Loads the API key from the `BEACON_API_KEY` environment variable.
fn default_api_key_from_env() -> Option<String> {
    std::env::var("BEACON_API_KEY").ok()
}
