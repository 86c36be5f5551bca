//! A set of helpers for testing

mod fakes;
mod harness;

pub use fakes::{Delivery, RecordingNotifier, RecordingQueue, RecordingWebhookDispatcher};
pub use harness::{EngineHarness, TestHarness, test_start_time};
