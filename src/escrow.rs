//! Paylock - Escrow State Machine
//!
//! [`EscrowService`] owns the single-party escrow lifecycle: it locks
//! buyer funds at creation, serializes every mutation per escrow id, and
//! moves the ledger and the store in lockstep.
//!
//! ## Fund-safety protocol
//!
//! Every operation runs its policy checks (not-found, terminal status,
//! authorization, status gate, amount validation — in that order) before
//! the first ledger call. Once the ledger settles an escrow to the
//! seller there is no inverse move; if the follow-up record update fails
//! after one retry, the service logs at `CRITICAL:` and reports
//! `released_to_seller` so an operator can reconcile out of band. That
//! is the single documented inconsistency path.
//!
//! ## Per-id serialization
//!
//! A registry maps escrow id to an async mutex, created on first use
//! with an atomic load-or-insert and removed after a terminal
//! transition. A late operation that races the eviction simply creates
//! a fresh mutex and then fails on the terminal gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::amount::Amount;
use crate::config::{parse_duration, EngineConfig};
use crate::errors::{EscrowError, FundsStatus, StoreError};
use crate::events::{EscrowEvent, ObserverSet};
use crate::ledger::Ledger;
use crate::storage::EscrowStore;
use crate::types::{new_escrow_id, Escrow, EscrowStatus, EvidenceEntry, Resolution};

/// Parameters for [`EscrowService::create`].
#[derive(Debug, Clone)]
pub struct CreateEscrowRequest {
    /// Paying agent. Must match the caller.
    pub buyer_addr: String,
    /// Receiving agent.
    pub seller_addr: String,
    /// Amount to lock.
    pub amount: Amount,
    /// Optional service the payment is for.
    pub service_id: Option<String>,
    /// Optional session key that initiated the payment.
    pub session_key_id: Option<String>,
    /// Human-readable auto-release delay ("30s", "5m", "1h").
    /// Absent, unparsable, or non-positive falls back to the default.
    pub auto_release: Option<String>,
}

/// The single-party escrow state machine.
pub struct EscrowService {
    store: Arc<dyn EscrowStore>,
    ledger: Arc<dyn Ledger>,
    observers: ObserverSet,
    config: EngineConfig,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        ledger: Arc<dyn Ledger>,
        observers: ObserverSet,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            observers,
            config,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// The engine configuration this service runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Per-id mutex registry
    // ========================================================================

    /// Load-or-insert the mutex for `id`. Two concurrent lookups for a
    /// novel id observe the same mutex.
    fn entity_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("escrow lock registry poisoned");
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop the registry entry after a terminal transition. Purely a
    /// memory bound; a late operation recreates the mutex and then
    /// fails on the terminal gate.
    fn evict_lock(&self, id: &str) {
        let mut locks = self.locks.lock().expect("escrow lock registry poisoned");
        locks.remove(id);
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().expect("escrow lock registry poisoned").len()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Create an escrow and lock the buyer's funds.
    ///
    /// If the record insert fails after the lock succeeded, the lock is
    /// rolled back with a refund; only when that compensation also fails
    /// does the error report funds still locked.
    pub async fn create(
        &self,
        caller: &str,
        request: CreateEscrowRequest,
    ) -> Result<Escrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let buyer = request.buyer_addr.trim().to_lowercase();
        let seller = request.seller_addr.trim().to_lowercase();

        if buyer.is_empty() || seller.is_empty() {
            return Err(EscrowError::Validation(
                "buyer and seller addresses are required".into(),
            ));
        }
        if buyer == seller {
            return Err(EscrowError::Validation(
                "buyer and seller must be distinct agents".into(),
            ));
        }
        if caller != buyer {
            return Err(EscrowError::Unauthorized {
                caller,
                action: "create an escrow on behalf of this buyer",
            });
        }
        if !request.amount.is_positive() {
            return Err(EscrowError::InvalidAmount(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.amount > Amount::MAX {
            return Err(EscrowError::InvalidAmount(
                "amount exceeds the maximum".into(),
            ));
        }

        let delay = request
            .auto_release
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(self.config.default_auto_release);

        let now = Utc::now();
        let escrow = Escrow {
            id: new_escrow_id(),
            buyer_addr: buyer.clone(),
            seller_addr: seller,
            amount: request.amount,
            service_id: request.service_id,
            session_key_id: request.session_key_id,
            status: EscrowStatus::Pending,
            created_at: now,
            updated_at: now,
            auto_release_at: now + delay,
            delivered_at: None,
            resolved_at: None,
            dispute_window_until: None,
            arbitration_deadline: None,
            dispute_reason: None,
            dispute_evidence: Vec::new(),
            arbitrator_addr: None,
            partial_release_amount: None,
            partial_refund_amount: None,
            resolution: None,
        };

        self.ledger
            .escrow_lock(&buyer, escrow.amount, &escrow.id)
            .await
            .map_err(|err| {
                EscrowError::money(
                    FundsStatus::NoChange,
                    escrow.amount,
                    escrow.id.clone(),
                    "no funds moved; the request can be retried",
                    err.into(),
                )
            })?;

        if let Err(store_err) = self.store.create(&escrow).await {
            // The lock succeeded but the record did not; unwind the lock
            // so the buyer's funds are not stranded.
            match self
                .ledger
                .refund_escrow(&buyer, escrow.amount, &escrow.id)
                .await
            {
                Ok(()) => {
                    warn!(
                        escrow_id = %escrow.id,
                        error = %store_err,
                        "record insert failed; escrow lock rolled back"
                    );
                    return Err(EscrowError::money(
                        FundsStatus::NoChange,
                        escrow.amount,
                        escrow.id,
                        "the escrow lock was rolled back; retry the request",
                        store_err.into(),
                    ));
                }
                Err(refund_err) => {
                    error!(
                        escrow_id = %escrow.id,
                        buyer = %buyer,
                        amount = %escrow.amount,
                        store_error = %store_err,
                        refund_error = %refund_err,
                        "escrow lock could not be rolled back after insert failure"
                    );
                    return Err(EscrowError::money(
                        FundsStatus::LockedInEscrow,
                        escrow.amount,
                        escrow.id,
                        "funds are locked under this reference; refund manually or retry",
                        store_err.into(),
                    ));
                }
            }
        }

        info!(
            escrow_id = %escrow.id,
            buyer = %escrow.buyer_addr,
            seller = %escrow.seller_addr,
            amount = %escrow.amount,
            auto_release_at = %escrow.auto_release_at,
            "escrow created"
        );
        self.observers.notify(EscrowEvent::Created {
            escrow: escrow.clone(),
        });
        Ok(escrow)
    }

    /// Seller marks the work delivered, opening the dispute window.
    pub async fn mark_delivered(&self, caller: &str, id: &str) -> Result<Escrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let mut escrow = self.fetch(id).await?;
        if escrow.is_terminal() {
            return Err(EscrowError::AlreadyResolved {
                status: escrow.status,
            });
        }
        if caller != escrow.seller_addr {
            return Err(EscrowError::Unauthorized {
                caller,
                action: "mark this escrow delivered",
            });
        }
        if escrow.status != EscrowStatus::Pending {
            return Err(EscrowError::InvalidStatus {
                status: escrow.status,
                action: "mark delivered",
            });
        }

        let now = Utc::now();
        escrow.status = EscrowStatus::Delivered;
        escrow.delivered_at = Some(now);
        escrow.dispute_window_until = Some(now + self.config.dispute_window);
        escrow.updated_at = now;
        self.store.update(&escrow).await?;

        info!(escrow_id = %escrow.id, seller = %escrow.seller_addr, "escrow delivered");
        self.observers.notify(EscrowEvent::Delivered {
            escrow: escrow.clone(),
        });
        Ok(escrow)
    }

    /// Buyer confirms; funds release to the seller.
    pub async fn confirm(&self, caller: &str, id: &str) -> Result<Escrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let escrow = self.fetch(id).await?;
        if escrow.is_terminal() {
            return Err(EscrowError::AlreadyResolved {
                status: escrow.status,
            });
        }
        if caller != escrow.buyer_addr {
            return Err(EscrowError::Unauthorized {
                caller,
                action: "confirm this escrow",
            });
        }
        if !matches!(
            escrow.status,
            EscrowStatus::Pending | EscrowStatus::Delivered
        ) {
            return Err(EscrowError::InvalidStatus {
                status: escrow.status,
                action: "confirm",
            });
        }

        self.settle_to_seller(escrow, EscrowStatus::Released, None)
            .await
    }

    /// Timer path: release an expired escrow to the seller.
    pub async fn auto_release(&self, id: &str) -> Result<Escrow, EscrowError> {
        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let escrow = self.fetch(id).await?;
        if escrow.is_terminal() {
            return Err(EscrowError::AlreadyResolved {
                status: escrow.status,
            });
        }
        if !matches!(
            escrow.status,
            EscrowStatus::Pending | EscrowStatus::Delivered
        ) {
            return Err(EscrowError::InvalidStatus {
                status: escrow.status,
                action: "auto-release",
            });
        }

        self.settle_to_seller(escrow, EscrowStatus::Expired, None)
            .await
    }

    /// Buyer disputes; funds stay locked for arbitration.
    pub async fn dispute(
        &self,
        caller: &str,
        id: &str,
        reason: &str,
    ) -> Result<Escrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EscrowError::Validation("dispute reason is required".into()));
        }

        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let mut escrow = self.fetch(id).await?;
        if escrow.is_terminal() {
            return Err(EscrowError::AlreadyResolved {
                status: escrow.status,
            });
        }
        if caller != escrow.buyer_addr {
            return Err(EscrowError::Unauthorized {
                caller,
                action: "dispute this escrow",
            });
        }
        if !matches!(
            escrow.status,
            EscrowStatus::Pending | EscrowStatus::Delivered
        ) {
            return Err(EscrowError::InvalidStatus {
                status: escrow.status,
                action: "dispute",
            });
        }

        let now = Utc::now();
        escrow.status = EscrowStatus::Disputed;
        escrow.dispute_reason = Some(reason.to_string());
        escrow.dispute_evidence.push(EvidenceEntry {
            submitter: escrow.buyer_addr.clone(),
            content: reason.to_string(),
            submitted_at: now,
        });
        escrow.updated_at = now;
        self.store.update(&escrow).await?;

        info!(escrow_id = %escrow.id, buyer = %escrow.buyer_addr, "escrow disputed");
        self.observers.notify(EscrowEvent::Disputed {
            escrow: escrow.clone(),
        });
        Ok(escrow)
    }

    /// Either party adds evidence while the dispute is open.
    pub async fn submit_evidence(
        &self,
        caller: &str,
        id: &str,
        content: &str,
    ) -> Result<Escrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let content = content.trim();
        if content.is_empty() {
            return Err(EscrowError::Validation(
                "evidence content is required".into(),
            ));
        }

        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let mut escrow = self.fetch(id).await?;
        if escrow.is_terminal() {
            return Err(EscrowError::AlreadyResolved {
                status: escrow.status,
            });
        }
        if !escrow.involves(&caller) {
            return Err(EscrowError::Unauthorized {
                caller,
                action: "submit evidence on this escrow",
            });
        }
        if !matches!(
            escrow.status,
            EscrowStatus::Disputed | EscrowStatus::Arbitrating
        ) {
            return Err(EscrowError::InvalidStatus {
                status: escrow.status,
                action: "submit evidence",
            });
        }

        let now = Utc::now();
        escrow.dispute_evidence.push(EvidenceEntry {
            submitter: caller,
            content: content.to_string(),
            submitted_at: now,
        });
        escrow.updated_at = now;
        self.store.update(&escrow).await?;
        Ok(escrow)
    }

    /// Hand a disputed escrow to an arbitrator and start their clock.
    /// Any caller may assign; in practice the buyer does.
    pub async fn assign_arbitrator(
        &self,
        caller: &str,
        id: &str,
        arbitrator_addr: &str,
    ) -> Result<Escrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let arbitrator = arbitrator_addr.trim().to_lowercase();
        if arbitrator.is_empty() {
            return Err(EscrowError::Validation(
                "arbitrator address is required".into(),
            ));
        }

        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let mut escrow = self.fetch(id).await?;
        if escrow.is_terminal() {
            return Err(EscrowError::AlreadyResolved {
                status: escrow.status,
            });
        }
        if escrow.status != EscrowStatus::Disputed {
            return Err(EscrowError::InvalidStatus {
                status: escrow.status,
                action: "assign an arbitrator",
            });
        }

        let now = Utc::now();
        escrow.status = EscrowStatus::Arbitrating;
        escrow.arbitrator_addr = Some(arbitrator);
        escrow.arbitration_deadline = Some(now + self.config.arbitration_window);
        escrow.updated_at = now;
        self.store.update(&escrow).await?;

        info!(
            escrow_id = %escrow.id,
            arbitrator = escrow.arbitrator_addr.as_deref().unwrap_or_default(),
            assigned_by = %caller,
            "arbitrator assigned"
        );
        self.observers.notify(EscrowEvent::ArbitratorAssigned {
            escrow: escrow.clone(),
        });
        Ok(escrow)
    }

    /// Arbitrator rules on a disputed escrow.
    ///
    /// `resolution` is one of `release`, `refund`, `partial`; anything
    /// else is rejected before funds move. The partial path settles both
    /// legs through one atomic ledger call.
    pub async fn resolve_arbitration(
        &self,
        caller: &str,
        id: &str,
        resolution: &str,
        release_amount: Option<Amount>,
        reason: Option<&str>,
    ) -> Result<Escrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let escrow = self.fetch(id).await?;
        if escrow.is_terminal() {
            return Err(EscrowError::AlreadyResolved {
                status: escrow.status,
            });
        }
        if let Some(arbitrator) = &escrow.arbitrator_addr {
            if caller != *arbitrator {
                return Err(EscrowError::Unauthorized {
                    caller,
                    action: "resolve this arbitration",
                });
            }
        }
        if !matches!(
            escrow.status,
            EscrowStatus::Disputed | EscrowStatus::Arbitrating
        ) {
            return Err(EscrowError::InvalidStatus {
                status: escrow.status,
                action: "resolve",
            });
        }

        let resolution = Resolution::parse(resolution).ok_or_else(|| {
            EscrowError::InvalidAmount(format!("unknown resolution {resolution:?}"))
        })?;
        self.resolve_locked(escrow, resolution, release_amount, reason)
            .await
    }

    /// Timer path: default-resolve an arbitration whose deadline passed.
    /// Rules for the seller, matching platform policy.
    pub async fn resolve_deadline(&self, id: &str) -> Result<Escrow, EscrowError> {
        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let escrow = self.fetch(id).await?;
        if escrow.is_terminal() {
            return Err(EscrowError::AlreadyResolved {
                status: escrow.status,
            });
        }
        if escrow.status != EscrowStatus::Arbitrating {
            return Err(EscrowError::InvalidStatus {
                status: escrow.status,
                action: "deadline-resolve",
            });
        }
        match escrow.arbitration_deadline {
            Some(deadline) if deadline <= Utc::now() => {}
            _ => {
                return Err(EscrowError::Validation(
                    "arbitration deadline has not passed".into(),
                ));
            }
        }

        self.resolve_locked(escrow, Resolution::Release, None, Some("deadline expired"))
            .await
    }

    /// Fetch a single escrow.
    pub async fn get(&self, id: &str) -> Result<Escrow, EscrowError> {
        self.fetch(id).await
    }

    /// Escrows where the address is buyer or seller, newest first.
    /// The limit defaults to 50 and is capped at 200.
    pub async fn list_by_agent(
        &self,
        addr: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Escrow>, EscrowError> {
        let addr = addr.trim().to_lowercase();
        let limit = self.config.clamp_limit(limit);
        Ok(self.store.list_by_agent(&addr, limit).await?)
    }

    // ========================================================================
    // Settlement internals (per-id mutex held by the caller)
    // ========================================================================

    async fn fetch(&self, id: &str) -> Result<Escrow, EscrowError> {
        match self.store.get(id).await {
            Ok(escrow) => Ok(escrow),
            Err(StoreError::NotFound(_)) => Err(EscrowError::NotFound(id.to_string())),
            Err(other) => Err(other.into()),
        }
    }

    /// Full release to the seller, used by confirm, auto-release, and
    /// the `release` arbitration ruling.
    async fn settle_to_seller(
        &self,
        mut escrow: Escrow,
        final_status: EscrowStatus,
        resolution: Option<String>,
    ) -> Result<Escrow, EscrowError> {
        let reference = escrow.id.clone();
        self.ledger
            .release_escrow(
                &escrow.buyer_addr,
                &escrow.seller_addr,
                escrow.amount,
                &reference,
            )
            .await
            .map_err(|err| {
                EscrowError::money(
                    FundsStatus::LockedInEscrow,
                    escrow.amount,
                    reference.clone(),
                    "funds remain locked; the operation can be retried",
                    err.into(),
                )
            })?;

        let now = Utc::now();
        escrow.status = final_status;
        escrow.resolved_at = Some(now);
        escrow.updated_at = now;
        if resolution.is_some() {
            escrow.resolution = resolution;
        }

        self.persist_settlement(
            &escrow,
            FundsStatus::ReleasedToSeller,
            escrow.amount,
            "the ledger released the funds to the seller; re-apply the record update out of band",
        )
        .await?;

        info!(
            escrow_id = %escrow.id,
            seller = %escrow.seller_addr,
            amount = %escrow.amount,
            status = %escrow.status,
            "escrow settled to seller"
        );
        self.observers.notify(EscrowEvent::Settled {
            escrow: escrow.clone(),
            released: escrow.amount,
            refunded: Amount::ZERO,
        });
        self.evict_lock(&escrow.id);
        Ok(escrow)
    }

    async fn resolve_locked(
        &self,
        mut escrow: Escrow,
        resolution: Resolution,
        release_amount: Option<Amount>,
        reason: Option<&str>,
    ) -> Result<Escrow, EscrowError> {
        let tag = match reason {
            Some(reason) => format!("{}: {}", resolution.as_str(), reason),
            None => resolution.as_str().to_string(),
        };

        match resolution {
            Resolution::Release => {
                self.settle_to_seller(escrow, EscrowStatus::Released, Some(tag))
                    .await
            }
            Resolution::Refund => {
                let reference = escrow.id.clone();
                self.ledger
                    .refund_escrow(&escrow.buyer_addr, escrow.amount, &reference)
                    .await
                    .map_err(|err| {
                        EscrowError::money(
                            FundsStatus::LockedInEscrow,
                            escrow.amount,
                            reference.clone(),
                            "funds remain locked; the operation can be retried",
                            err.into(),
                        )
                    })?;

                let now = Utc::now();
                escrow.status = EscrowStatus::Refunded;
                escrow.resolved_at = Some(now);
                escrow.updated_at = now;
                escrow.resolution = Some(tag);

                self.persist_settlement(
                    &escrow,
                    FundsStatus::NoChange,
                    escrow.amount,
                    "the funds were returned to the buyer; re-apply the record update out of band",
                )
                .await?;

                info!(
                    escrow_id = %escrow.id,
                    buyer = %escrow.buyer_addr,
                    amount = %escrow.amount,
                    "escrow refunded via arbitration"
                );
                self.observers.notify(EscrowEvent::Settled {
                    escrow: escrow.clone(),
                    released: Amount::ZERO,
                    refunded: escrow.amount,
                });
                self.evict_lock(&escrow.id);
                Ok(escrow)
            }
            Resolution::Partial => {
                let release = release_amount.ok_or_else(|| {
                    EscrowError::InvalidAmount(
                        "partial resolution requires a release amount".into(),
                    )
                })?;
                if !release.is_positive() || release >= escrow.amount {
                    return Err(EscrowError::InvalidAmount(format!(
                        "partial release must be within (0, {}), got {release}",
                        escrow.amount
                    )));
                }
                let refund = escrow.amount - release;
                let reference = format!("{}:partial", escrow.id);

                // One atomic ledger call; sequencing a release and a
                // refund is forbidden because a mid-sequence failure
                // cannot be compensated.
                self.ledger
                    .partial_escrow_settle(
                        &escrow.buyer_addr,
                        &escrow.seller_addr,
                        release,
                        refund,
                        &reference,
                    )
                    .await
                    .map_err(|err| {
                        EscrowError::money(
                            FundsStatus::LockedInEscrow,
                            escrow.amount,
                            reference.clone(),
                            "funds remain locked; the operation can be retried",
                            err.into(),
                        )
                    })?;

                let now = Utc::now();
                escrow.status = EscrowStatus::Released;
                escrow.partial_release_amount = Some(release);
                escrow.partial_refund_amount = Some(refund);
                escrow.resolved_at = Some(now);
                escrow.updated_at = now;
                escrow.resolution = Some(tag);

                self.persist_settlement(
                    &escrow,
                    FundsStatus::ReleasedToSeller,
                    release,
                    "the ledger split the settlement; re-apply the record update out of band",
                )
                .await?;

                info!(
                    escrow_id = %escrow.id,
                    released = %release,
                    refunded = %refund,
                    "escrow settled partially via arbitration"
                );
                self.observers.notify(EscrowEvent::Settled {
                    escrow: escrow.clone(),
                    released: release,
                    refunded: refund,
                });
                self.evict_lock(&escrow.id);
                Ok(escrow)
            }
        }
    }

    /// Persist a post-ledger record update with one retry. The ledger
    /// move has no inverse at this point, so a persistent failure is
    /// logged at CRITICAL and surfaced as a money error instead of being
    /// compensated.
    async fn persist_settlement(
        &self,
        escrow: &Escrow,
        funds: FundsStatus,
        amount: Amount,
        recovery: &'static str,
    ) -> Result<(), EscrowError> {
        if let Err(first) = self.store.update(escrow).await {
            warn!(
                escrow_id = %escrow.id,
                error = %first,
                "record update failed after ledger settlement; retrying once"
            );
            if let Err(second) = self.store.update(escrow).await {
                error!(
                    escrow_id = %escrow.id,
                    seller = %escrow.seller_addr,
                    amount = %amount,
                    error = %second,
                    "CRITICAL: ledger settled but the record update failed twice; \
                     operator reconciliation required"
                );
                return Err(EscrowError::money(
                    funds,
                    amount,
                    escrow.id.clone(),
                    recovery,
                    second.into(),
                ));
            }
        }
        Ok(())
    }
}
