//! Paylock - Type Definitions
//!
//! Core data structures for the escrow engine: single-party escrow
//! records, multi-step pipeline records, and their lifecycle enums.
//!
//! Records are plain owned data. The store hands out deep copies, so a
//! clone of any of these types shares no buffers with persisted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;

/// Generate a fresh escrow id: `esc_` + 128 bits of randomness in hex.
pub fn new_escrow_id() -> String {
    format!("esc_{}", Uuid::new_v4().simple())
}

/// Generate a fresh multi-step escrow id: `mse_` + 128 bits of randomness.
pub fn new_multistep_id() -> String {
    format!("mse_{}", Uuid::new_v4().simple())
}

/// The lifecycle states of a single-party escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    /// Funds locked, awaiting delivery or confirmation.
    Pending,
    /// Seller marked the work delivered; the dispute window is open.
    Delivered,
    /// Buyer raised a dispute; funds stay locked for arbitration.
    Disputed,
    /// An arbitrator has been assigned and is on the clock.
    Arbitrating,
    /// Funds released to the seller. Terminal.
    Released,
    /// Funds refunded to the buyer via arbitration. Terminal.
    Refunded,
    /// Auto-released after timeout. Funds went to the seller. Terminal.
    Expired,
}

impl EscrowStatus {
    /// True for statuses after which no state transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Expired
        )
    }

    /// Stable lowercase name, matching the wire encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Delivered => "delivered",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Arbitrating => "arbitrating",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evidence entry attached to a disputed escrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceEntry {
    /// Lowercase address of the submitting party.
    pub submitter: String,
    /// Free-form evidence text.
    pub content: String,
    /// When the entry was recorded.
    pub submitted_at: DateTime<Utc>,
}

/// A single-party escrow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escrow {
    /// Unique identifier (`esc_` prefix).
    pub id: String,
    /// Lowercase address of the paying agent.
    pub buyer_addr: String,
    /// Lowercase address of the receiving agent.
    pub seller_addr: String,
    /// Locked amount. Immutable after creation.
    pub amount: Amount,
    /// Optional service the payment is for.
    pub service_id: Option<String>,
    /// Optional session key that initiated the payment.
    pub session_key_id: Option<String>,
    /// Current lifecycle status.
    pub status: EscrowStatus,
    /// When the escrow was created.
    pub created_at: DateTime<Utc>,
    /// When any field last changed.
    pub updated_at: DateTime<Utc>,
    /// When the timer may release the funds to the seller.
    pub auto_release_at: DateTime<Utc>,
    /// When the seller marked delivery, if they did.
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the escrow reached a terminal status. Set iff terminal.
    pub resolved_at: Option<DateTime<Utc>>,
    /// End of the post-delivery dispute window; auto-release is
    /// suppressed until this passes.
    pub dispute_window_until: Option<DateTime<Utc>>,
    /// Deadline for the assigned arbitrator to rule.
    pub arbitration_deadline: Option<DateTime<Utc>>,
    /// Reason given by the buyer when disputing.
    pub dispute_reason: Option<String>,
    /// Ordered evidence entries from both parties.
    pub dispute_evidence: Vec<EvidenceEntry>,
    /// Arbitrator authorized to resolve, once assigned.
    pub arbitrator_addr: Option<String>,
    /// Seller share of a partial arbitration settlement.
    pub partial_release_amount: Option<Amount>,
    /// Buyer share of a partial arbitration settlement.
    pub partial_refund_amount: Option<Amount>,
    /// Free-form tag describing how the escrow was resolved.
    pub resolution: Option<String>,
}

impl Escrow {
    /// True once the record is frozen.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when `addr` (already lowercase) is the buyer or the seller.
    pub fn involves(&self, addr: &str) -> bool {
        self.buyer_addr == addr || self.seller_addr == addr
    }
}

/// How an arbitrator ruled on a disputed escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Full release to the seller.
    Release,
    /// Full refund to the buyer.
    Refund,
    /// Split settlement: part to the seller, remainder back to the buyer.
    Partial,
}

impl Resolution {
    /// Parse the wire tag. Anything unknown is rejected by the caller.
    pub fn parse(s: &str) -> Option<Resolution> {
        match s {
            "release" => Some(Resolution::Release),
            "refund" => Some(Resolution::Refund),
            "partial" => Some(Resolution::Partial),
            _ => None,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Release => "release",
            Resolution::Refund => "refund",
            Resolution::Partial => "partial",
        }
    }
}

/// The lifecycle states of a multi-step escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiStepStatus {
    /// Budget locked; steps may still be confirmed.
    Open,
    /// Every planned step confirmed. Terminal.
    Completed,
    /// Buyer reclaimed the remainder. Terminal.
    Aborted,
}

impl MultiStepStatus {
    /// True for statuses after which no step activity is legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, MultiStepStatus::Completed | MultiStepStatus::Aborted)
    }

    /// Stable lowercase name, matching the wire encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            MultiStepStatus::Open => "open",
            MultiStepStatus::Completed => "completed",
            MultiStepStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for MultiStepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned payout in a multi-step pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    /// Lowercase address of the seller expected to claim this step.
    pub seller_addr: String,
    /// Exact amount the step releases.
    pub amount: Amount,
}

/// A confirmed step, recorded under the parent escrow by unique index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Zero-based position in the planned pipeline.
    pub index: u32,
    /// Seller the funds were released to.
    pub seller_addr: String,
    /// Amount released for this step.
    pub amount: Amount,
    /// When the step was confirmed.
    pub confirmed_at: DateTime<Utc>,
}

/// A multi-step escrow: a prepaid budget claimed by N sellers in sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiStepEscrow {
    /// Unique identifier (`mse_` prefix).
    pub id: String,
    /// Lowercase address of the paying agent.
    pub buyer_addr: String,
    /// Total budget locked at creation. Immutable.
    pub total_amount: Amount,
    /// Sum of confirmed step amounts. Monotonically non-decreasing.
    pub spent_amount: Amount,
    /// Number of planned steps.
    pub total_steps: u32,
    /// Number of steps confirmed so far.
    pub confirmed_steps: u32,
    /// The planned payout for each step, in order.
    pub planned_steps: Vec<PlannedStep>,
    /// Current lifecycle status.
    pub status: MultiStepStatus,
    /// When the pipeline was created.
    pub created_at: DateTime<Utc>,
    /// When any field last changed.
    pub updated_at: DateTime<Utc>,
    /// When the pipeline completed or was aborted.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl MultiStepEscrow {
    /// Budget not yet claimed by confirmed steps.
    pub fn remaining(&self) -> Amount {
        self.total_amount - self.spent_amount
    }
}
