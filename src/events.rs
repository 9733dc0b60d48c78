//! Paylock - Events and Observers
//!
//! Every state transition emits an [`EscrowEvent`]. Observers are
//! fire-and-forget: delivery happens on spawned tasks after the store
//! update commits, observer failures are logged at warn and never reach
//! the mutating path. The mutating path owns correctness; observers own
//! reporting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::amount::Amount;
use crate::types::{Escrow, EscrowStatus, MultiStepEscrow, StepRecord};

/// A state transition, carrying a snapshot of the record after it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum EscrowEvent {
    /// Funds locked, record persisted.
    Created { escrow: Escrow },
    /// Seller marked delivery; the dispute window opened.
    Delivered { escrow: Escrow },
    /// Buyer disputed; funds stay locked.
    Disputed { escrow: Escrow },
    /// Arbitrator assigned; the deadline clock started.
    ArbitratorAssigned { escrow: Escrow },
    /// Terminal settlement: released, refunded, expired, or partial.
    /// `released` went to the seller, `refunded` back to the buyer.
    Settled {
        escrow: Escrow,
        released: Amount,
        refunded: Amount,
    },
    /// One multi-step pipeline step confirmed and released.
    StepConfirmed {
        escrow: MultiStepEscrow,
        step: StepRecord,
    },
    /// Every step confirmed; any residual budget refunded as dust.
    PipelineCompleted {
        escrow: MultiStepEscrow,
        dust_refund: Amount,
    },
    /// Buyer reclaimed the unspent budget.
    PipelineAborted {
        escrow: MultiStepEscrow,
        refunded: Amount,
    },
}

impl EscrowEvent {
    /// Short tag for logs and webhook routing.
    pub fn kind(&self) -> &'static str {
        match self {
            EscrowEvent::Created { .. } => "escrow.created",
            EscrowEvent::Delivered { .. } => "escrow.delivered",
            EscrowEvent::Disputed { .. } => "escrow.disputed",
            EscrowEvent::ArbitratorAssigned { .. } => "escrow.arbitrator_assigned",
            EscrowEvent::Settled { .. } => "escrow.settled",
            EscrowEvent::StepConfirmed { .. } => "multistep.step_confirmed",
            EscrowEvent::PipelineCompleted { .. } => "multistep.completed",
            EscrowEvent::PipelineAborted { .. } => "multistep.aborted",
        }
    }
}

/// A reporting sink for escrow events.
#[async_trait]
pub trait EscrowObserver: Send + Sync {
    /// Name used in delivery-failure logs.
    fn name(&self) -> &'static str;

    /// Handle one event. Errors are logged by the dispatcher and
    /// otherwise ignored.
    async fn on_event(&self, event: &EscrowEvent) -> anyhow::Result<()>;
}

/// The observer fan-out owned by the services.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Arc<Vec<Arc<dyn EscrowObserver>>>,
}

impl ObserverSet {
    pub fn new(observers: Vec<Arc<dyn EscrowObserver>>) -> Self {
        Self {
            observers: Arc::new(observers),
        }
    }

    /// Deliver `event` to every observer on its own task and return
    /// immediately. Never blocks or fails the caller.
    pub fn notify(&self, event: EscrowEvent) {
        if self.observers.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for observer in self.observers.iter() {
            let observer = Arc::clone(observer);
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if let Err(err) = observer.on_event(&event).await {
                    warn!(
                        observer = observer.name(),
                        event = event.kind(),
                        error = %err,
                        "observer delivery failed"
                    );
                }
            });
        }
    }
}

// ============================================================================
// Bundled observers
// ============================================================================

/// One settled fund movement, as seen by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransaction {
    pub escrow_id: String,
    pub buyer_addr: String,
    pub seller_addr: String,
    pub released: Amount,
    pub refunded: Amount,
    pub status: EscrowStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Keeps an in-memory log of settlements. Doubles as the test probe for
/// observer delivery.
#[derive(Default)]
pub struct TransactionRecorder {
    log: Mutex<Vec<RecordedTransaction>>,
}

impl TransactionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub async fn recorded(&self) -> Vec<RecordedTransaction> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl EscrowObserver for TransactionRecorder {
    fn name(&self) -> &'static str {
        "transaction_recorder"
    }

    async fn on_event(&self, event: &EscrowEvent) -> anyhow::Result<()> {
        if let EscrowEvent::Settled {
            escrow,
            released,
            refunded,
        } = event
        {
            self.log.lock().await.push(RecordedTransaction {
                escrow_id: escrow.id.clone(),
                buyer_addr: escrow.buyer_addr.clone(),
                seller_addr: escrow.seller_addr.clone(),
                released: *released,
                refunded: *refunded,
                status: escrow.status,
                recorded_at: Utc::now(),
            });
        }
        Ok(())
    }
}

/// Running totals of platform volume.
#[derive(Default)]
pub struct RevenueAccumulator {
    totals: Mutex<RevenueTotals>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevenueTotals {
    /// Volume released to sellers.
    pub released: Amount,
    /// Volume refunded to buyers.
    pub refunded: Amount,
    /// Number of settled escrows.
    pub settlements: u64,
}

impl RevenueAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn totals(&self) -> RevenueTotals {
        *self.totals.lock().await
    }
}

#[async_trait]
impl EscrowObserver for RevenueAccumulator {
    fn name(&self) -> &'static str {
        "revenue_accumulator"
    }

    async fn on_event(&self, event: &EscrowEvent) -> anyhow::Result<()> {
        match event {
            EscrowEvent::Settled {
                released, refunded, ..
            } => {
                let mut totals = self.totals.lock().await;
                totals.released += *released;
                totals.refunded += *refunded;
                totals.settlements += 1;
            }
            EscrowEvent::StepConfirmed { step, .. } => {
                let mut totals = self.totals.lock().await;
                totals.released += step.amount;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Tracks reputation deltas per agent: sellers gain on clean releases,
/// lose on refunds; buyers gain on confirmations they honored.
#[derive(Default)]
pub struct ReputationImpactor {
    scores: Mutex<HashMap<String, i64>>,
}

impl ReputationImpactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn score(&self, addr: &str) -> i64 {
        self.scores.lock().await.get(addr).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EscrowObserver for ReputationImpactor {
    fn name(&self) -> &'static str {
        "reputation_impactor"
    }

    async fn on_event(&self, event: &EscrowEvent) -> anyhow::Result<()> {
        if let EscrowEvent::Settled { escrow, .. } = event {
            let mut scores = self.scores.lock().await;
            match escrow.status {
                EscrowStatus::Released => {
                    *scores.entry(escrow.seller_addr.clone()).or_default() += 1;
                }
                EscrowStatus::Refunded => {
                    *scores.entry(escrow.seller_addr.clone()).or_default() -= 1;
                }
                // Expiry means the buyer never confirmed nor disputed;
                // the seller still got paid, no reputation signal.
                _ => {}
            }
        }
        Ok(())
    }
}

/// A receipt for a settled escrow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub receipt_id: String,
    pub escrow_id: String,
    pub payer: String,
    pub payee: String,
    pub released: Amount,
    pub refunded: Amount,
    pub issued_at: DateTime<Utc>,
}

/// Issues a receipt per settlement and logs it.
#[derive(Default)]
pub struct ReceiptIssuer {
    issued: Mutex<Vec<Receipt>>,
}

impl ReceiptIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issued(&self) -> Vec<Receipt> {
        self.issued.lock().await.clone()
    }
}

#[async_trait]
impl EscrowObserver for ReceiptIssuer {
    fn name(&self) -> &'static str {
        "receipt_issuer"
    }

    async fn on_event(&self, event: &EscrowEvent) -> anyhow::Result<()> {
        if let EscrowEvent::Settled {
            escrow,
            released,
            refunded,
        } = event
        {
            let receipt = Receipt {
                receipt_id: format!("rcp_{}", Uuid::new_v4().simple()),
                escrow_id: escrow.id.clone(),
                payer: escrow.buyer_addr.clone(),
                payee: escrow.seller_addr.clone(),
                released: *released,
                refunded: *refunded,
                issued_at: Utc::now(),
            };
            info!(
                receipt_id = %receipt.receipt_id,
                escrow_id = %receipt.escrow_id,
                released = %receipt.released,
                refunded = %receipt.refunded,
                "receipt issued"
            );
            self.issued.lock().await.push(receipt);
        }
        Ok(())
    }
}

/// A serialized event ready for an external webhook dispatcher.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    /// Event tag, e.g. `escrow.settled`.
    pub event: &'static str,
    /// Full event payload.
    pub payload: serde_json::Value,
}

/// Pushes serialized events onto an unbounded channel. The consuming
/// side (an HTTP dispatcher, a queue writer) lives outside the engine.
pub struct WebhookEmitter {
    tx: mpsc::UnboundedSender<WebhookDelivery>,
}

impl WebhookEmitter {
    /// Returns the emitter and the receiving end for the dispatcher.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WebhookDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EscrowObserver for WebhookEmitter {
    fn name(&self) -> &'static str {
        "webhook_emitter"
    }

    async fn on_event(&self, event: &EscrowEvent) -> anyhow::Result<()> {
        let delivery = WebhookDelivery {
            event: event.kind(),
            payload: serde_json::to_value(event)?,
        };
        self.tx
            .send(delivery)
            .map_err(|_| anyhow::anyhow!("webhook channel closed"))?;
        Ok(())
    }
}
