//! Paylock - Error Definitions
//!
//! Three layers of errors cross this crate:
//!
//! - [`LedgerError`] from the fund-movement boundary,
//! - [`StoreError`] from the persistence boundary,
//! - [`EscrowError`] from the services, which wraps the other two and adds
//!   the policy kinds (authorization, status gates, amount validation) and
//!   the fund-safety [`EscrowError::Money`] wrapper.
//!
//! The precedence every operation follows before touching the ledger:
//! not-found, then terminal status, then authorization, then status gate,
//! then amount validation.

use thiserror::Error;

use crate::amount::Amount;
use crate::types::{EscrowStatus, MultiStepStatus};

/// Where the escrowed funds sit when a [`EscrowError::Money`] is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundsStatus {
    /// No fund movement happened, or it was fully compensated.
    NoChange,
    /// Funds are locked in escrow; the operation can be retried.
    LockedInEscrow,
    /// The ledger released the funds to the seller but the record could
    /// not be updated. Operator intervention is required.
    ReleasedToSeller,
}

impl FundsStatus {
    /// Stable snake_case name, used in logs and wire payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            FundsStatus::NoChange => "no_change",
            FundsStatus::LockedInEscrow => "locked_in_escrow",
            FundsStatus::ReleasedToSeller => "released_to_seller",
        }
    }
}

impl std::fmt::Display for FundsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a [`crate::ledger::Ledger`] implementation.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The agent's available balance cannot cover the lock.
    #[error("insufficient available balance for {agent}: requested {requested}, available {available}")]
    InsufficientAvailable {
        agent: String,
        requested: Amount,
        available: Amount,
    },

    /// The agent's escrowed balance cannot cover the move.
    #[error("insufficient escrowed balance for {agent}: requested {requested}, escrowed {escrowed}")]
    InsufficientEscrowed {
        agent: String,
        requested: Amount,
        escrowed: Amount,
    },

    /// A non-positive amount reached the ledger.
    #[error("ledger rejected non-positive amount {0}")]
    InvalidAmount(Amount),

    /// The backing store failed.
    #[error("ledger backend failure: {0}")]
    Backend(String),
}

/// Errors raised by a store implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No record with the given id.
    #[error("record {0} not found")]
    NotFound(String),

    /// Insert collided with an existing id.
    #[error("record {0} already exists")]
    Duplicate(String),

    /// A step row with the same (escrow, index) already exists.
    #[error("step {index} already recorded")]
    DuplicateStep { index: u32 },

    /// A conditional update found the record in the wrong status.
    #[error("conditional update rejected: {0}")]
    Conflict(String),

    /// The backing store failed.
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Errors raised by the escrow and multi-step services.
#[derive(Debug, Error)]
pub enum EscrowError {
    /// Unknown escrow or multi-step id.
    #[error("escrow {0} not found")]
    NotFound(String),

    /// Caller does not hold the role the operation requires.
    #[error("caller {caller} is not authorized to {action}")]
    Unauthorized { caller: String, action: &'static str },

    /// Operation is not legal from the record's current status.
    #[error("cannot {action} an escrow that is {status}")]
    InvalidStatus {
        status: EscrowStatus,
        action: &'static str,
    },

    /// Operation targeted a record that already reached a terminal status.
    #[error("escrow already resolved as {status}")]
    AlreadyResolved { status: EscrowStatus },

    /// Amount is non-positive, out of range, or inconsistent.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Request failed basic validation before any policy check.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Multi-step: seller or amount does not match the planned step.
    #[error("step {index} mismatch: planned seller {expected_seller} for {expected_amount}")]
    StepMismatch {
        index: u32,
        expected_seller: String,
        expected_amount: Amount,
    },

    /// Multi-step: the step index was already confirmed.
    #[error("step {index} already confirmed")]
    DuplicateStep { index: u32 },

    /// Multi-step: the step index is outside the planned pipeline.
    #[error("step {index} out of range for {total_steps} planned steps")]
    StepOutOfRange { index: u32, total_steps: u32 },

    /// Multi-step: confirming the step would overdraw the locked budget.
    #[error("step amount {requested} exceeds remaining budget {remaining}")]
    AmountExceedsTotal { requested: Amount, remaining: Amount },

    /// Multi-step: operation not legal once the pipeline closed.
    #[error("multi-step escrow is already {status}")]
    PipelineClosed { status: MultiStepStatus },

    /// A fund movement happened, or may have happened, while the
    /// operation failed. Carries enough context for the caller to act.
    #[error("fund-safety failure ({funds}) on {reference} for {amount}: {source}")]
    Money {
        /// Where the funds sit now.
        funds: FundsStatus,
        /// The amount at stake.
        amount: Amount,
        /// The ledger reference the movement was keyed by.
        reference: String,
        /// What the caller (or an operator) should do next.
        recovery: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<EscrowError>,
    },

    /// A store failure with no funds at stake.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A ledger failure with no funds at stake.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl EscrowError {
    /// Wrap `source` as a fund-safety error.
    pub fn money(
        funds: FundsStatus,
        amount: Amount,
        reference: impl Into<String>,
        recovery: &'static str,
        source: EscrowError,
    ) -> Self {
        EscrowError::Money {
            funds,
            amount,
            reference: reference.into(),
            recovery,
            source: Box::new(source),
        }
    }

    /// The funds status carried by this error, if it is a money error.
    pub fn funds_status(&self) -> Option<FundsStatus> {
        match self {
            EscrowError::Money { funds, .. } => Some(*funds),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_error_carries_funds_status_and_source() {
        let inner = EscrowError::Ledger(LedgerError::Backend("down".into()));
        let err = EscrowError::money(
            FundsStatus::LockedInEscrow,
            Amount::from_units(5),
            "esc_x",
            "retry the operation",
            inner,
        );
        assert_eq!(err.funds_status(), Some(FundsStatus::LockedInEscrow));
        let text = err.to_string();
        assert!(text.contains("locked_in_escrow"));
        assert!(text.contains("esc_x"));
    }

    #[test]
    fn funds_status_names_are_snake_case() {
        assert_eq!(FundsStatus::NoChange.as_str(), "no_change");
        assert_eq!(FundsStatus::LockedInEscrow.as_str(), "locked_in_escrow");
        assert_eq!(FundsStatus::ReleasedToSeller.as_str(), "released_to_seller");
    }
}
