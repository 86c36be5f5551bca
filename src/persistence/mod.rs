//! Durable state of the engine: configuration records, alert groups, their
//! timelines and escalation cursors.

pub mod error;
pub mod sqlite;
pub use sqlite::SqliteStateRepository;
pub mod traits;
