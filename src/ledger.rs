//! Paylock - Ledger Boundary
//!
//! The ledger is the single source of truth for balances and serializes
//! its own updates. The engine consumes it through four idempotent
//! primitives, each keyed by `(operation, reference)`; replaying a call
//! with a reference it has already applied is a no-op.
//!
//! [`InMemoryLedger`] is the reference implementation. It enforces the
//! same constraints a SQL backend would at the schema level: `available`
//! and `escrowed` never go negative, and for every agent
//! `total_in - total_out == available + pending + escrowed`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::amount::Amount;
use crate::errors::LedgerError;

/// The four fund-movement operations, used for idempotency keying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    EscrowLock,
    ReleaseEscrow,
    RefundEscrow,
    PartialEscrowSettle,
}

/// Per-agent balance buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentBalance {
    /// Spendable funds.
    pub available: Amount,
    /// Funds reserved for on-chain transfers. Untouched by this engine.
    pub pending: Amount,
    /// Funds locked by active escrows.
    pub escrowed: Amount,
    /// Lifetime inflow.
    pub total_in: Amount,
    /// Lifetime outflow.
    pub total_out: Amount,
}

impl AgentBalance {
    /// The conservation invariant every movement must preserve.
    pub fn conserves(&self) -> bool {
        self.total_in - self.total_out == self.available + self.pending + self.escrowed
    }
}

/// Fund-movement primitives consumed by the escrow services.
///
/// Implementations must be idempotent by `(op, reference)` and must
/// reject movements that would drive `available` or `escrowed` negative.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Move `amount` from `agent.available` into `agent.escrowed`.
    async fn escrow_lock(
        &self,
        agent: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    /// Settle an escrow to the seller: decrement `buyer.escrowed`,
    /// credit `seller.available`, bump both lifetime totals.
    async fn release_escrow(
        &self,
        buyer: &str,
        seller: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    /// Move `amount` from `agent.escrowed` back to `agent.available`.
    async fn refund_escrow(
        &self,
        agent: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    /// Atomically split an escrow: `release` to the seller, `refund`
    /// back to the buyer. Either both legs apply or neither does.
    async fn partial_escrow_settle(
        &self,
        buyer: &str,
        seller: &str,
        release: Amount,
        refund: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, AgentBalance>,
    applied: HashSet<(LedgerOp, String)>,
}

impl LedgerState {
    fn account(&mut self, agent: &str) -> &mut AgentBalance {
        self.accounts.entry(agent.to_string()).or_default()
    }

    /// True when this `(op, reference)` pair has already been applied.
    fn already_applied(&self, op: LedgerOp, reference: &str) -> bool {
        self.applied.contains(&(op, reference.to_string()))
    }

    /// Record a successfully applied `(op, reference)` pair.
    fn mark_applied(&mut self, op: LedgerOp, reference: &str) {
        self.applied.insert((op, reference.to_string()));
    }
}

/// In-process ledger with the full balance-integrity contract.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit external funds into an agent's available balance.
    pub async fn deposit(&self, agent: &str, amount: Amount) {
        let mut state = self.state.lock().await;
        let account = state.account(agent);
        account.available += amount;
        account.total_in += amount;
    }

    /// Snapshot an agent's balances (all-zero when unknown).
    pub async fn balance(&self, agent: &str) -> AgentBalance {
        let state = self.state.lock().await;
        state.accounts.get(agent).cloned().unwrap_or_default()
    }
}

fn require_positive(amount: Amount) -> Result<(), LedgerError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(amount))
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn escrow_lock(
        &self,
        agent: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        require_positive(amount)?;
        let mut state = self.state.lock().await;
        if state.already_applied(LedgerOp::EscrowLock, reference) {
            return Ok(());
        }
        let account = state.account(agent);
        if account.available < amount {
            return Err(LedgerError::InsufficientAvailable {
                agent: agent.to_string(),
                requested: amount,
                available: account.available,
            });
        }
        account.available -= amount;
        account.escrowed += amount;
        state.mark_applied(LedgerOp::EscrowLock, reference);
        Ok(())
    }

    async fn release_escrow(
        &self,
        buyer: &str,
        seller: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        require_positive(amount)?;
        let mut state = self.state.lock().await;
        if state.already_applied(LedgerOp::ReleaseEscrow, reference) {
            return Ok(());
        }
        let buyer_account = state.account(buyer);
        if buyer_account.escrowed < amount {
            return Err(LedgerError::InsufficientEscrowed {
                agent: buyer.to_string(),
                requested: amount,
                escrowed: buyer_account.escrowed,
            });
        }
        buyer_account.escrowed -= amount;
        buyer_account.total_out += amount;
        let seller_account = state.account(seller);
        seller_account.available += amount;
        seller_account.total_in += amount;
        state.mark_applied(LedgerOp::ReleaseEscrow, reference);
        Ok(())
    }

    async fn refund_escrow(
        &self,
        agent: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        require_positive(amount)?;
        let mut state = self.state.lock().await;
        if state.already_applied(LedgerOp::RefundEscrow, reference) {
            return Ok(());
        }
        let account = state.account(agent);
        if account.escrowed < amount {
            return Err(LedgerError::InsufficientEscrowed {
                agent: agent.to_string(),
                requested: amount,
                escrowed: account.escrowed,
            });
        }
        account.escrowed -= amount;
        account.available += amount;
        state.mark_applied(LedgerOp::RefundEscrow, reference);
        Ok(())
    }

    async fn partial_escrow_settle(
        &self,
        buyer: &str,
        seller: &str,
        release: Amount,
        refund: Amount,
        reference: &str,
    ) -> Result<(), LedgerError> {
        require_positive(release)?;
        require_positive(refund)?;
        let total = release + refund;
        let mut state = self.state.lock().await;
        if state.already_applied(LedgerOp::PartialEscrowSettle, reference) {
            return Ok(());
        }
        let buyer_account = state.account(buyer);
        if buyer_account.escrowed < total {
            return Err(LedgerError::InsufficientEscrowed {
                agent: buyer.to_string(),
                requested: total,
                escrowed: buyer_account.escrowed,
            });
        }
        // Both legs apply under the one state lock; there is no
        // intermediate point where only half the split is visible.
        buyer_account.escrowed -= total;
        buyer_account.available += refund;
        buyer_account.total_out += release;
        let seller_account = state.account(seller);
        seller_account.available += release;
        seller_account.total_in += release;
        state.mark_applied(LedgerOp::PartialEscrowSettle, reference);
        Ok(())
    }
}
