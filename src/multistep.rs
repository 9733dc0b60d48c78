//! Paylock - Multi-Step Escrow
//!
//! [`MultiStepService`] handles pipeline payments: the buyer prepays a
//! budget covering N planned steps, each step's seller claims their
//! share in any order, and the buyer can reclaim the unspent remainder
//! while the pipeline is still open.
//!
//! The store's `record_step` is the atomicity point: the duplicate-index
//! check and the spent/confirmed counter bump commit together, so two
//! racing confirmations of the same step cannot both pass. The ledger
//! release happens after the row is recorded; if that release fails the
//! step stays recorded and the failure is logged at `CRITICAL:` as the
//! recovery signal (the store exposes `delete_step` for callers that
//! prefer to compensate).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::amount::Amount;
use crate::config::EngineConfig;
use crate::errors::{EscrowError, FundsStatus, StoreError};
use crate::events::{EscrowEvent, ObserverSet};
use crate::ledger::Ledger;
use crate::storage::MultiStepStore;
use crate::types::{
    new_multistep_id, MultiStepEscrow, MultiStepStatus, PlannedStep, StepRecord,
};

/// Parameters for [`MultiStepService::lock_steps`].
#[derive(Debug, Clone)]
pub struct LockStepsRequest {
    /// Paying agent. Must match the caller.
    pub buyer_addr: String,
    /// Total budget to lock. Must cover the sum of the planned steps;
    /// any surplus returns to the buyer as dust at completion.
    pub total_amount: Amount,
    /// Number of planned steps.
    pub total_steps: u32,
    /// The payout plan, one entry per step.
    pub planned_steps: Vec<PlannedStep>,
}

/// The pipeline escrow service.
pub struct MultiStepService {
    store: Arc<dyn MultiStepStore>,
    ledger: Arc<dyn Ledger>,
    observers: ObserverSet,
    config: EngineConfig,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Ledger reference for the initial budget lock.
fn lock_reference(id: &str) -> String {
    format!("mse:{id}")
}

/// Ledger reference for one step release.
fn step_reference(id: &str, index: u32) -> String {
    format!("mse:{id}:step:{index}")
}

impl MultiStepService {
    pub fn new(
        store: Arc<dyn MultiStepStore>,
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

    fn entity_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("multistep lock registry poisoned");
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn evict_lock(&self, id: &str) {
        let mut locks = self.locks.lock().expect("multistep lock registry poisoned");
        locks.remove(id);
    }

    /// Lock the buyer's budget for an N-step pipeline.
    pub async fn lock_steps(
        &self,
        caller: &str,
        request: LockStepsRequest,
    ) -> Result<MultiStepEscrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let buyer = request.buyer_addr.trim().to_lowercase();

        if buyer.is_empty() {
            return Err(EscrowError::Validation("buyer address is required".into()));
        }
        if caller != buyer {
            return Err(EscrowError::Unauthorized {
                caller,
                action: "lock a multi-step budget for this buyer",
            });
        }
        if request.total_steps == 0 || request.total_steps > self.config.max_steps {
            return Err(EscrowError::Validation(format!(
                "totalSteps must be within 1..={}, got {}",
                self.config.max_steps, request.total_steps
            )));
        }
        if request.planned_steps.len() != request.total_steps as usize {
            return Err(EscrowError::Validation(format!(
                "expected {} planned steps, got {}",
                request.total_steps,
                request.planned_steps.len()
            )));
        }

        let mut planned = Vec::with_capacity(request.planned_steps.len());
        let mut planned_total = Amount::ZERO;
        for (index, step) in request.planned_steps.into_iter().enumerate() {
            let seller = step.seller_addr.trim().to_lowercase();
            if seller.is_empty() {
                return Err(EscrowError::Validation(format!(
                    "planned step {index} is missing a seller address"
                )));
            }
            if !step.amount.is_positive() {
                return Err(EscrowError::InvalidAmount(format!(
                    "planned step {index} amount must be positive, got {}",
                    step.amount
                )));
            }
            planned_total += step.amount;
            planned.push(PlannedStep {
                seller_addr: seller,
                amount: step.amount,
            });
        }
        // The plan may undershoot the locked total (the residue comes
        // back as a dust refund at completion) but never exceed it.
        if planned_total > request.total_amount {
            return Err(EscrowError::InvalidAmount(format!(
                "planned steps sum to {planned_total}, exceeding the locked total {}",
                request.total_amount
            )));
        }

        let now = Utc::now();
        let escrow = MultiStepEscrow {
            id: new_multistep_id(),
            buyer_addr: buyer.clone(),
            total_amount: request.total_amount,
            spent_amount: Amount::ZERO,
            total_steps: request.total_steps,
            confirmed_steps: 0,
            planned_steps: planned,
            status: MultiStepStatus::Open,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };

        let reference = lock_reference(&escrow.id);
        self.ledger
            .escrow_lock(&buyer, escrow.total_amount, &reference)
            .await
            .map_err(|err| {
                EscrowError::money(
                    FundsStatus::NoChange,
                    escrow.total_amount,
                    reference.clone(),
                    "no funds moved; the request can be retried",
                    err.into(),
                )
            })?;

        if let Err(store_err) = self.store.create(&escrow).await {
            match self
                .ledger
                .refund_escrow(&buyer, escrow.total_amount, &reference)
                .await
            {
                Ok(()) => {
                    warn!(
                        multistep_id = %escrow.id,
                        error = %store_err,
                        "record insert failed; budget lock rolled back"
                    );
                    return Err(EscrowError::money(
                        FundsStatus::NoChange,
                        escrow.total_amount,
                        reference,
                        "the budget lock was rolled back; retry the request",
                        store_err.into(),
                    ));
                }
                Err(refund_err) => {
                    error!(
                        multistep_id = %escrow.id,
                        buyer = %buyer,
                        amount = %escrow.total_amount,
                        store_error = %store_err,
                        refund_error = %refund_err,
                        "budget lock could not be rolled back after insert failure"
                    );
                    return Err(EscrowError::money(
                        FundsStatus::LockedInEscrow,
                        escrow.total_amount,
                        reference,
                        "funds are locked under this reference; refund manually or retry",
                        store_err.into(),
                    ));
                }
            }
        }

        info!(
            multistep_id = %escrow.id,
            buyer = %escrow.buyer_addr,
            total = %escrow.total_amount,
            steps = escrow.total_steps,
            "multi-step budget locked"
        );
        Ok(escrow)
    }

    /// Confirm one planned step and release its share to the seller.
    ///
    /// The caller must be the step's planned seller, and the claimed
    /// amount must match the plan exactly.
    pub async fn confirm_step(
        &self,
        caller: &str,
        id: &str,
        index: u32,
        seller_addr: &str,
        amount: Amount,
    ) -> Result<MultiStepEscrow, EscrowError> {
        let caller = caller.trim().to_lowercase();
        let seller = seller_addr.trim().to_lowercase();

        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let escrow = self.fetch(id).await?;
        if escrow.status != MultiStepStatus::Open {
            // A replayed confirmation of an already-recorded step is
            // reported as the duplicate it is, even after the pipeline
            // closed; anything else is the closed-pipeline gate.
            let steps = self.store.steps(id).await.unwrap_or_default();
            if steps.iter().any(|s| s.index == index) {
                return Err(EscrowError::DuplicateStep { index });
            }
            return Err(EscrowError::PipelineClosed {
                status: escrow.status,
            });
        }
        if index >= escrow.total_steps {
            return Err(EscrowError::StepOutOfRange {
                index,
                total_steps: escrow.total_steps,
            });
        }
        let planned = &escrow.planned_steps[index as usize];
        if seller != planned.seller_addr || caller != planned.seller_addr {
            return Err(EscrowError::StepMismatch {
                index,
                expected_seller: planned.seller_addr.clone(),
                expected_amount: planned.amount,
            });
        }
        if amount != planned.amount {
            return Err(EscrowError::StepMismatch {
                index,
                expected_seller: planned.seller_addr.clone(),
                expected_amount: planned.amount,
            });
        }
        if escrow.spent_amount + amount > escrow.total_amount {
            return Err(EscrowError::AmountExceedsTotal {
                requested: amount,
                remaining: escrow.remaining(),
            });
        }

        let step = StepRecord {
            index,
            seller_addr: seller,
            amount,
            confirmed_at: Utc::now(),
        };

        // Atomicity point: duplicate rejection and counter bump commit
        // together inside the store.
        let updated = match self.store.record_step(id, step.clone()).await {
            Ok(updated) => updated,
            Err(StoreError::DuplicateStep { index }) => {
                return Err(EscrowError::DuplicateStep { index });
            }
            Err(other) => return Err(other.into()),
        };

        let reference = step_reference(id, index);
        if let Err(release_err) = self
            .ledger
            .release_escrow(&escrow.buyer_addr, &step.seller_addr, amount, &reference)
            .await
        {
            error!(
                multistep_id = %id,
                step = index,
                seller = %step.seller_addr,
                amount = %amount,
                error = %release_err,
                "CRITICAL: step recorded but the ledger release failed; \
                 operator reconciliation required"
            );
            return Err(EscrowError::money(
                FundsStatus::LockedInEscrow,
                amount,
                reference,
                "the step is recorded but funds were not released; retry or delete the step",
                release_err.into(),
            ));
        }

        info!(
            multistep_id = %id,
            step = index,
            seller = %step.seller_addr,
            amount = %amount,
            confirmed = updated.confirmed_steps,
            total = updated.total_steps,
            "pipeline step confirmed"
        );
        self.observers.notify(EscrowEvent::StepConfirmed {
            escrow: updated.clone(),
            step,
        });

        if updated.confirmed_steps == updated.total_steps {
            return self.complete_pipeline(updated).await;
        }
        Ok(updated)
    }

    /// Buyer aborts the pipeline and reclaims the unspent budget.
    pub async fn refund_remaining(
        &self,
        caller: &str,
        id: &str,
    ) -> Result<MultiStepEscrow, EscrowError> {
        let caller = caller.trim().to_lowercase();

        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let escrow = self.fetch(id).await?;
        if caller != escrow.buyer_addr {
            return Err(EscrowError::Unauthorized {
                caller,
                action: "refund this multi-step escrow",
            });
        }
        if escrow.status != MultiStepStatus::Open {
            return Err(EscrowError::PipelineClosed {
                status: escrow.status,
            });
        }

        let remaining = escrow.remaining();
        if remaining.is_positive() {
            let reference = format!("mse:{id}:refund");
            self.ledger
                .refund_escrow(&escrow.buyer_addr, remaining, &reference)
                .await
                .map_err(|err| {
                    EscrowError::money(
                        FundsStatus::LockedInEscrow,
                        remaining,
                        reference,
                        "the remainder is still locked; the refund can be retried",
                        err.into(),
                    )
                })?;
        }

        let aborted = match self.store.abort(id, Utc::now()).await {
            Ok(aborted) => aborted,
            Err(err) => {
                error!(
                    multistep_id = %id,
                    buyer = %escrow.buyer_addr,
                    refunded = %remaining,
                    error = %err,
                    "CRITICAL: remainder refunded but the abort update failed; \
                     operator reconciliation required"
                );
                return Err(EscrowError::money(
                    FundsStatus::NoChange,
                    remaining,
                    id.to_string(),
                    "the remainder was refunded to the buyer; re-apply the abort out of band",
                    err.into(),
                ));
            }
        };

        info!(
            multistep_id = %id,
            buyer = %aborted.buyer_addr,
            refunded = %remaining,
            "multi-step escrow aborted"
        );
        self.observers.notify(EscrowEvent::PipelineAborted {
            escrow: aborted.clone(),
            refunded: remaining,
        });
        self.evict_lock(id);
        Ok(aborted)
    }

    /// Fetch a single multi-step escrow.
    pub async fn get(&self, id: &str) -> Result<MultiStepEscrow, EscrowError> {
        self.fetch(id).await
    }

    /// Confirmed steps for an escrow, ordered by index.
    pub async fn steps(&self, id: &str) -> Result<Vec<StepRecord>, EscrowError> {
        match self.store.steps(id).await {
            Ok(steps) => Ok(steps),
            Err(StoreError::NotFound(_)) => Err(EscrowError::NotFound(id.to_string())),
            Err(other) => Err(other.into()),
        }
    }

    async fn fetch(&self, id: &str) -> Result<MultiStepEscrow, EscrowError> {
        match self.store.get(id).await {
            Ok(escrow) => Ok(escrow),
            Err(StoreError::NotFound(_)) => Err(EscrowError::NotFound(id.to_string())),
            Err(other) => Err(other.into()),
        }
    }

    /// Final step confirmed: mark completed and return any residual
    /// budget to the buyer as a dust refund.
    async fn complete_pipeline(
        &self,
        escrow: MultiStepEscrow,
    ) -> Result<MultiStepEscrow, EscrowError> {
        let dust = escrow.remaining();
        if dust.is_positive() {
            let reference = format!("mse:{}:dust", escrow.id);
            if let Err(err) = self
                .ledger
                .refund_escrow(&escrow.buyer_addr, dust, &reference)
                .await
            {
                error!(
                    multistep_id = %escrow.id,
                    dust = %dust,
                    error = %err,
                    "CRITICAL: pipeline finished but the dust refund failed; \
                     operator reconciliation required"
                );
                return Err(EscrowError::money(
                    FundsStatus::LockedInEscrow,
                    dust,
                    reference,
                    "the dust remainder is still locked; retry the refund",
                    err.into(),
                ));
            }
        }

        let completed = match self.store.complete(&escrow.id, Utc::now()).await {
            Ok(completed) => completed,
            Err(err) => {
                error!(
                    multistep_id = %escrow.id,
                    dust = %dust,
                    error = %err,
                    "CRITICAL: pipeline settled but the completion update failed; \
                     operator reconciliation required"
                );
                return Err(EscrowError::money(
                    FundsStatus::NoChange,
                    dust,
                    escrow.id.clone(),
                    "every step settled and dust was refunded; re-apply the completion out of band",
                    err.into(),
                ));
            }
        };
        info!(
            multistep_id = %completed.id,
            spent = %completed.spent_amount,
            dust = %dust,
            "multi-step escrow completed"
        );
        self.observers.notify(EscrowEvent::PipelineCompleted {
            escrow: completed.clone(),
            dust_refund: dust,
        });
        self.evict_lock(&completed.id);
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::storage::InMemoryMultiStepStore;

    fn plan(entries: &[(&str, &str)]) -> Vec<PlannedStep> {
        entries
            .iter()
            .map(|(seller, amount)| PlannedStep {
                seller_addr: (*seller).into(),
                amount: amount.parse().unwrap(),
            })
            .collect()
    }

    async fn service_with_funds(deposit: &str) -> (MultiStepService, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.deposit("0xbuyer", deposit.parse().unwrap()).await;
        let service = MultiStepService::new(
            Arc::new(InMemoryMultiStepStore::new()),
            ledger.clone(),
            ObserverSet::default(),
            EngineConfig::default(),
        );
        (service, ledger)
    }

    fn lock_request(total: &str, steps: Vec<PlannedStep>) -> LockStepsRequest {
        LockStepsRequest {
            buyer_addr: "0xbuyer".into(),
            total_amount: total.parse().unwrap(),
            total_steps: steps.len() as u32,
            planned_steps: steps,
        }
    }

    #[tokio::test]
    async fn lock_steps_rejects_a_plan_that_exceeds_the_total() {
        let (service, ledger) = service_with_funds("1").await;
        let err = service
            .lock_steps(
                "0xbuyer",
                lock_request("0.030", plan(&[("0xs1", "0.020"), ("0xs2", "0.020")])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidAmount(_)));
        assert_eq!(ledger.balance("0xbuyer").await.escrowed, Amount::ZERO);
    }

    #[tokio::test]
    async fn lock_steps_rejects_too_many_steps() {
        let (service, _ledger) = service_with_funds("1000").await;
        let steps: Vec<PlannedStep> = (0..33)
            .map(|i| PlannedStep {
                seller_addr: format!("0xs{i}"),
                amount: Amount::from_units(1),
            })
            .collect();
        let err = service
            .lock_steps("0xbuyer", lock_request("33", steps))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[tokio::test]
    async fn confirm_step_enforces_the_plan() {
        let (service, _ledger) = service_with_funds("1").await;
        let escrow = service
            .lock_steps(
                "0xbuyer",
                lock_request("0.030", plan(&[("0xs1", "0.010"), ("0xs2", "0.020")])),
            )
            .await
            .unwrap();

        // Wrong seller for the index.
        let err = service
            .confirm_step("0xs2", &escrow.id, 0, "0xs2", "0.010".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::StepMismatch { .. }));

        // Wrong amount for the index.
        let err = service
            .confirm_step("0xs1", &escrow.id, 0, "0xs1", "0.020".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::StepMismatch { .. }));

        // Out-of-range index.
        let err = service
            .confirm_step("0xs1", &escrow.id, 5, "0xs1", "0.010".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::StepOutOfRange { .. }));
    }

    #[tokio::test]
    async fn refund_remaining_is_buyer_only_and_aborts() {
        let (service, ledger) = service_with_funds("1").await;
        let escrow = service
            .lock_steps(
                "0xbuyer",
                lock_request("0.030", plan(&[("0xs1", "0.010"), ("0xs2", "0.020")])),
            )
            .await
            .unwrap();

        let err = service
            .refund_remaining("0xs1", &escrow.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized { .. }));

        service
            .confirm_step("0xs1", &escrow.id, 0, "0xs1", "0.010".parse().unwrap())
            .await
            .unwrap();
        let aborted = service
            .refund_remaining("0xbuyer", &escrow.id)
            .await
            .unwrap();
        assert_eq!(aborted.status, MultiStepStatus::Aborted);

        let buyer = ledger.balance("0xbuyer").await;
        assert_eq!(buyer.escrowed, Amount::ZERO);
        assert_eq!(
            buyer.available,
            "0.990".parse::<Amount>().unwrap()
        );
        assert!(buyer.conserves());

        // Terminal pipelines reject further activity.
        let err = service
            .refund_remaining("0xbuyer", &escrow.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::PipelineClosed { .. }));
    }
}
