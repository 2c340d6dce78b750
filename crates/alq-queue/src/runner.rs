//! The daemon's single control flow.
//!
//! Outer loop: one whiteboard scan per poll interval. Inner pump, until the
//! next scan is due: one dispatch attempt, an outbox drain, then every
//! pending broker message, in that order, so a terminal event received this
//! iteration is observed before the next dispatch decision for the same
//! branch. Suspension happens only at external I/O and the inter-iteration
//! sleep.

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::{comments, dispatch, events, ingest, QueueDeps, RunnerConfig};

pub struct QueueRunner {
    deps: QueueDeps,
    config: RunnerConfig,
}

impl QueueRunner {
    pub fn new(deps: QueueDeps, config: RunnerConfig) -> Self {
        Self { deps, config }
    }

    /// Run until `shutdown` flips to true. In-flight external calls finish;
    /// the store and the broker are the sources of truth across restarts.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("queue runner started");
        loop {
            ingest::scan(&self.deps).await;

            match self.deps.store.patchset_revisions().await {
                Ok(revisions) => {
                    debug!(count = revisions.len(), "revisions with a completed trial push: {revisions:?}")
                }
                Err(e) => error!("failed to list patchset revisions: {e}"),
            }

            let next_poll = Instant::now() + self.config.poll_interval;
            while Instant::now() < next_poll {
                self.pump_once().await;

                tokio::select! {
                    _ = sleep(self.config.pump_interval) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    info!("queue runner stopping");
                    return;
                }
            }
        }
    }

    /// One pump iteration: dispatch, outbox, broker drain.
    pub async fn pump_once(&self) {
        match self.deps.store.take_next_patchset().await {
            Ok(Some(ps)) => {
                if let Err(e) = dispatch::handle_patchset(&self.deps, &self.config.routing_key, ps).await {
                    error!("dispatch failed: {e:#}");
                }
            }
            Ok(None) => {}
            Err(e) => error!("failed to take next patchset: {e}"),
        }

        if let Err(e) = comments::drain_outbox(
            self.deps.tracker.as_ref(),
            self.deps.store.as_ref(),
            &self.config.dead_letter_path,
        )
        .await
        {
            error!("outbox drain failed: {e}");
        }

        loop {
            match self.deps.bus.poll().await {
                Ok(Some(payload)) => events::handle_message(&self.deps, &payload).await,
                Ok(None) => break,
                Err(e) => {
                    // Treated as "no message"; try again next iteration.
                    warn!("broker poll failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Convenience for wiring: a watch pair whose sender flips on shutdown.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
