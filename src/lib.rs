#![warn(missing_docs)]
//! Beacon routes alerts from monitoring integrations to escalation chains,
//! groups them into incidents and runs the chains until someone responds.

pub mod clock;
pub mod cmd;
pub mod config;
pub mod context;
pub mod engine;
pub mod http_client;
pub mod http_server;
pub mod initialization;
pub mod loader;
pub mod models;
pub mod notifier;
pub mod persistence;
pub mod routing;
pub mod supervisor;
pub mod test_helpers;
