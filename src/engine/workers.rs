//! Queue consumers: ingestion workers and the escalation dispatcher.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use super::{
    executor::{EscalationExecutor, RunOutcome},
    pipeline::{AlertPipeline, IngestRequest},
    queue::EscalationQueue,
};

/// Consumes the ingestion queue with `workers` tasks until cancelled or the
/// queue closes.
pub async fn run_ingest_workers(
    pipeline: Arc<AlertPipeline>,
    rx: mpsc::Receiver<IngestRequest>,
    workers: usize,
    cancellation_token: CancellationToken,
) {
    let rx = Arc::new(Mutex::new(rx));
    let mut set = JoinSet::new();
    for worker in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let pipeline = Arc::clone(&pipeline);
        let token = cancellation_token.clone();
        set.spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = token.cancelled() => break,
                    request = async { rx.lock().await.recv().await } => request,
                };
                let Some(IngestRequest { integration_id, payload, reply }) = request else { break };
                let result = pipeline.ingest(integration_id, payload).await;
                if let Err(e) = &result {
                    tracing::warn!(worker, integration_id, error = %e, "Alert rejected.");
                }
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
        });
    }
    tracing::info!(workers = workers.max(1), "Ingestion workers started.");
    while set.join_next().await.is_some() {}
    tracing::info!("Ingestion workers stopped.");
}

/// Feeds escalation run requests to the executor with bounded concurrency.
pub struct EscalationDispatcher {
    executor: Arc<EscalationExecutor>,
    queue: Arc<dyn EscalationQueue>,
    concurrency: usize,
    retry_delay: Duration,
}

impl EscalationDispatcher {
    /// Creates a new `EscalationDispatcher`.
    pub fn new(
        executor: Arc<EscalationExecutor>,
        queue: Arc<dyn EscalationQueue>,
        concurrency: usize,
        retry_delay: Duration,
    ) -> Self {
        Self { executor, queue, concurrency: concurrency.max(1), retry_delay }
    }

    /// Dispatches until cancelled or the queue closes, then waits for the
    /// runs in flight.
    pub async fn run(&self, mut rx: mpsc::Receiver<i64>, cancellation_token: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut runs = JoinSet::new();
        tracing::info!(concurrency = self.concurrency, "Escalation dispatcher started.");

        loop {
            let alert_group_id = tokio::select! {
                _ = cancellation_token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            while runs.try_join_next().is_some() {}

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
            let executor = Arc::clone(&self.executor);
            let queue = Arc::clone(&self.queue);
            let retry_delay = self.retry_delay;
            runs.spawn(async move {
                let result = executor.run(alert_group_id).await;
                // Re-queueing can block on a full queue; never while holding
                // a permit the dispatcher is waiting for.
                drop(permit);
                match result {
                    Ok(RunOutcome::Rerun) => queue.enqueue(alert_group_id).await,
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(alert_group_id, error = %e, retry_in_ms = retry_delay.as_millis() as u64, "Escalation run failed; re-queueing.");
                        tokio::time::sleep(retry_delay).await;
                        queue.enqueue(alert_group_id).await;
                    }
                    Err(e) => {
                        tracing::error!(alert_group_id, error = %e, "Escalation run failed.");
                    }
                }
            });
        }

        tracing::info!(in_flight = runs.len(), "Escalation dispatcher draining.");
        while runs.join_next().await.is_some() {}
        tracing::info!("Escalation dispatcher stopped.");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        engine::pipeline::IngestHandle,
        models::{EscalationStep, NotificationTier},
        test_helpers::EngineHarness,
    };

    #[tokio::test]
    async fn test_ingest_workers_answer_through_the_handle() {
        let h = EngineHarness::new().await;
        let integration = h.harness.create_integration("grafana").await;
        h.routes.load_all().await.unwrap();

        let (handle, rx) = IngestHandle::new(8);
        let token = CancellationToken::new();
        let workers = tokio::spawn(run_ingest_workers(h.pipeline.clone(), rx, 2, token.clone()));

        let receipt = handle.ingest(integration.id, json!({ "title": "a" })).await.unwrap();
        assert!(receipt.created);
        assert!(handle.ingest(999, json!({})).await.is_err());

        token.cancel();
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_runs_queued_groups() {
        let h = EngineHarness::new().await;
        let step = EscalationStep::NotifyUsers { user_ids: vec!["alice".into()], tier: NotificationTier::Default };
        let a = h.group_with_chain(vec![step.clone()]).await;
        let b = h.group_with_chain(vec![step]).await;

        let (tx, rx) = mpsc::channel(8);
        let dispatcher = EscalationDispatcher::new(h.executor.clone(), h.services.queue.clone(), 2, Duration::from_millis(10));
        let token = CancellationToken::new();
        tx.send(a.id).await.unwrap();
        tx.send(b.id).await.unwrap();
        drop(tx);

        dispatcher.run(rx, token).await;
        assert_eq!(h.notifier.deliveries().len(), 2);
    }
}
