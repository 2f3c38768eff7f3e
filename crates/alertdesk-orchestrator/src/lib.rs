//! Orchestrator: wires `alertdesk-evaluator` and `alertdesk-dispatch` into a
//! running worker pool.
//!
//! Two bounded, per-user round-robin queues sit between ingestion and
//! dispatch: one for transactions waiting to be evaluated, one for
//! notifications waiting to be sent. A fixed pool of workers drains each
//! queue concurrently. Enqueueing past either queue's capacity returns
//! `EnqueueError::RateLimited` immediately rather than growing unbounded —
//! the caller (the daemon's ingestion handler) is expected to surface that
//! as a 429.

mod queue;
mod worker;

pub use queue::EnqueueError;

use std::sync::Arc;
use std::time::Duration;

use alertdesk_analyzer::AnalyzerConfig;
use alertdesk_dispatch::{ChannelAdapter, DispatchConfig, Destination, EmailMessage, WebhookMessage};
use alertdesk_evaluator::EvaluatorConfig;
use alertdesk_schemas::Channel;
use async_trait::async_trait;
use queue::FairQueue;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Resolves where a user's notifications on a given channel should actually
/// go. Implemented by the daemon, which knows where that configuration
/// lives; this crate only needs to ask for it.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve(&self, user_id: Uuid, channel: Channel) -> Option<Destination>;
}

/// Tunables for one orchestrator instance.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Size of the evaluation worker pool (`W`).
    pub evaluate_workers: usize,
    /// Size of the dispatch worker pool (`W_d`).
    pub dispatch_workers: usize,
    /// Shared capacity for each of the two queues (`Q_max`).
    pub queue_capacity: usize,
    /// How long `shutdown` waits for in-flight work to drain before
    /// abandoning it (`T_drain`).
    pub drain_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn sane_defaults() -> Self {
        Self {
            evaluate_workers: 4,
            dispatch_workers: 4,
            queue_capacity: 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// A running pool of evaluation and dispatch workers. Dropping this without
/// calling [`Orchestrator::shutdown`] leaves the worker tasks detached;
/// always prefer an explicit graceful shutdown.
pub struct Orchestrator {
    incoming: Arc<FairQueue>,
    outgoing: Arc<FairQueue>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        pool: PgPool,
        analyzer_cfg: AnalyzerConfig,
        eval_cfg: EvaluatorConfig,
        dispatch_cfg: DispatchConfig,
        email_adapter: Arc<dyn ChannelAdapter<Request = EmailMessage>>,
        webhook_adapter: Arc<dyn ChannelAdapter<Request = WebhookMessage>>,
        resolver: Arc<dyn DestinationResolver>,
        audit: Arc<tokio::sync::Mutex<alertdesk_audit::AuditWriter>>,
        cfg: OrchestratorConfig,
    ) -> Self {
        let incoming = Arc::new(FairQueue::new(cfg.queue_capacity));
        let outgoing = Arc::new(FairQueue::new(cfg.queue_capacity));
        let analyzer_cfg = Arc::new(analyzer_cfg);
        let eval_cfg = Arc::new(eval_cfg);
        let dispatch_cfg = Arc::new(dispatch_cfg);

        let mut handles = Vec::with_capacity(cfg.evaluate_workers + cfg.dispatch_workers);

        for _ in 0..cfg.evaluate_workers {
            handles.push(tokio::spawn(worker::evaluate_worker(
                pool.clone(),
                analyzer_cfg.clone(),
                eval_cfg.clone(),
                audit.clone(),
                incoming.clone(),
                outgoing.clone(),
            )));
        }

        for _ in 0..cfg.dispatch_workers {
            handles.push(tokio::spawn(worker::dispatch_worker(
                pool.clone(),
                dispatch_cfg.clone(),
                email_adapter.clone(),
                webhook_adapter.clone(),
                resolver.clone(),
                outgoing.clone(),
            )));
        }

        Self {
            incoming,
            outgoing,
            handles: std::sync::Mutex::new(handles),
            drain_timeout: cfg.drain_timeout,
        }
    }

    /// Enqueues a freshly-ingested transaction for evaluation. Fails with
    /// [`EnqueueError`] once the evaluation queue is full.
    pub fn enqueue_transaction(&self, user_id: Uuid, transaction_id: Uuid) -> Result<(), EnqueueError> {
        self.incoming.push(user_id, transaction_id)
    }

    pub fn pending_evaluations(&self) -> usize {
        self.incoming.len()
    }

    pub fn pending_dispatches(&self) -> usize {
        self.outgoing.len()
    }

    /// Closes both queues to new work, waits up to `drain_timeout` for
    /// workers to finish what's already queued, then aborts anything still
    /// running. Takes `&self` (not `self`) so it can be called through the
    /// `Arc<Orchestrator>` the daemon shares with every request handler.
    pub async fn shutdown(&self) {
        self.incoming.close();
        self.outgoing.close();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            tracing::warn!("orchestrator drain timed out, worker tasks abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDestination;

    #[async_trait]
    impl DestinationResolver for NoDestination {
        async fn resolve(&self, _user_id: Uuid, _channel: Channel) -> Option<Destination> {
            None
        }
    }

    #[test]
    fn config_defaults_are_nonzero() {
        let cfg = OrchestratorConfig::sane_defaults();
        assert!(cfg.evaluate_workers > 0);
        assert!(cfg.dispatch_workers > 0);
        assert!(cfg.queue_capacity > 0);
    }

    #[tokio::test]
    async fn resolver_with_no_destination_compiles_and_resolves_none() {
        let resolver = NoDestination;
        let result = resolver.resolve(Uuid::new_v4(), Channel::Email).await;
        assert!(result.is_none());
    }
}
