//! Paylock - Auto-Release Sweeper
//!
//! A single background task that reconciles time-based transitions:
//! escrows past `auto_release_at` are released to the seller, and
//! arbitrations past their deadline are default-resolved in the
//! seller's favor.
//!
//! Each sweep runs on its own spawned task so a panic inside one batch
//! is isolated and logged while the ticker keeps going. The loop ends
//! on either the shared shutdown channel or the handle's `stop()`;
//! a batch already in flight finishes before the task returns.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::errors::EscrowError;
use crate::escrow::EscrowService;
use crate::storage::EscrowStore;
use crate::types::EscrowStatus;

/// The background reconciler for expired escrows and arbitrations.
pub struct AutoReleaseTimer {
    service: Arc<EscrowService>,
    store: Arc<dyn EscrowStore>,
    interval: std::time::Duration,
    batch: usize,
}

/// Controls a spawned [`AutoReleaseTimer`].
pub struct TimerHandle {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Signal the loop to stop and wait for the in-flight batch.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        if let Err(err) = self.task.await {
            warn!(error = %err, "sweeper task ended abnormally");
        }
    }
}

impl AutoReleaseTimer {
    pub fn new(
        service: Arc<EscrowService>,
        store: Arc<dyn EscrowStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            service,
            store,
            interval: config.sweep_interval,
            batch: config.sweep_batch,
        }
    }

    /// Spawn the sweep loop. It observes `shutdown` (true means stop)
    /// and the returned handle's `stop()`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> TimerHandle {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let timer = Arc::new(self);
        let task = tokio::spawn(timer.run(shutdown, stop_rx));
        TimerHandle { stop_tx, task }
    }

    async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut stop: mpsc::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Sweeps get their own receiver so they can observe shutdown
        // between per-escrow operations.
        let sweep_shutdown = shutdown.clone();
        info!(interval = ?self.interval, "auto-release sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // One task per sweep so a panic is contained and the
                    // ticker survives it.
                    let timer = Arc::clone(&self);
                    let sweep_rx = sweep_shutdown.clone();
                    let sweep = tokio::spawn(async move {
                        timer.sweep(&sweep_rx).await;
                    });
                    if let Err(err) = sweep.await {
                        if err.is_panic() {
                            error!(error = %err, "sweep panicked; continuing on next tick");
                        }
                    }
                }
                _ = stop.recv() => {
                    info!("auto-release sweeper stopped");
                    break;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("auto-release sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconciliation pass. Public so deployments and tests can
    /// drive sweeps explicitly.
    pub async fn sweep(&self, shutdown: &watch::Receiver<bool>) {
        self.sweep_expired(shutdown).await;
        self.sweep_arbitration_deadlines(shutdown).await;
    }

    /// Release every escrow past its auto-release time, skipping
    /// delivered ones whose dispute window is still open.
    async fn sweep_expired(&self, shutdown: &watch::Receiver<bool>) {
        let now = Utc::now();
        let expired = match self.store.list_expired(now, self.batch).await {
            Ok(expired) => expired,
            Err(err) => {
                error!(error = %err, "expired-escrow query failed");
                return;
            }
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "found expired escrows");
        }

        for escrow in expired {
            if *shutdown.borrow() {
                return;
            }
            if escrow.status == EscrowStatus::Delivered {
                if let Some(window) = escrow.dispute_window_until {
                    if window > now {
                        // Buyer still has time to dispute; revisit on a
                        // later tick.
                        continue;
                    }
                }
            }
            match self.service.auto_release(&escrow.id).await {
                Ok(released) => {
                    info!(
                        escrow_id = %released.id,
                        seller = %released.seller_addr,
                        amount = %released.amount,
                        "escrow auto-released"
                    );
                }
                // Lost the race against a concurrent confirm or
                // dispute; nothing to do.
                Err(EscrowError::AlreadyResolved { .. })
                | Err(EscrowError::InvalidStatus { .. }) => {}
                Err(err) => {
                    // Not re-queued: the record stays non-terminal, so
                    // the next tick retries it.
                    warn!(escrow_id = %escrow.id, error = %err, "auto-release failed");
                }
            }
        }
    }

    /// Default-resolve arbitrations whose deadline passed.
    async fn sweep_arbitration_deadlines(&self, shutdown: &watch::Receiver<bool>) {
        let now = Utc::now();
        let arbitrating = match self
            .store
            .list_by_status(EscrowStatus::Arbitrating, self.batch)
            .await
        {
            Ok(arbitrating) => arbitrating,
            Err(err) => {
                error!(error = %err, "arbitrating-escrow query failed");
                return;
            }
        };

        for escrow in arbitrating {
            if *shutdown.borrow() {
                return;
            }
            let overdue = matches!(escrow.arbitration_deadline, Some(deadline) if deadline < now);
            if !overdue {
                continue;
            }
            match self.service.resolve_deadline(&escrow.id).await {
                Ok(resolved) => {
                    info!(
                        escrow_id = %resolved.id,
                        seller = %resolved.seller_addr,
                        "arbitration deadline expired; released to seller"
                    );
                }
                Err(EscrowError::AlreadyResolved { .. })
                | Err(EscrowError::InvalidStatus { .. }) => {}
                Err(err) => {
                    warn!(
                        escrow_id = %escrow.id,
                        error = %err,
                        "deadline resolution failed"
                    );
                }
            }
        }
    }
}
