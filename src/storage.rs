//! Paylock - Storage Layer
//!
//! Store traits consumed by the services, plus the in-memory reference
//! implementations. The contract every backend must honor:
//!
//! - `get` returns a deep copy (evidence and step lists included), so a
//!   caller can never mutate persisted state through a returned record.
//! - `create` rejects duplicate ids; `update` rejects unknown ids
//!   (no upsert).
//! - `record_step` is the multi-step atomicity point: the duplicate
//!   check, the spent/confirmed counter bump, and the row insert happen
//!   in one critical section (serializable isolation under SQL, a single
//!   mutex hold here).
//!
//! A SQL backend would add a partial index on `auto_release_at` filtered
//! to non-terminal statuses for `list_expired`, and a unique key on
//! `(escrow_id, step_index)` for the duplicate-step invariant.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::errors::StoreError;
use crate::types::{
    Escrow, EscrowStatus, MultiStepEscrow, MultiStepStatus, StepRecord,
};

/// Persistence contract for single-party escrows.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Insert a new record. Duplicate id is an error.
    async fn create(&self, escrow: &Escrow) -> Result<(), StoreError>;

    /// Fetch a deep copy of a record. Not-found is a distinguished error.
    async fn get(&self, id: &str) -> Result<Escrow, StoreError>;

    /// Overwrite the mutable fields of an existing record. No upsert.
    async fn update(&self, escrow: &Escrow) -> Result<(), StoreError>;

    /// Records where the address is buyer or seller, newest first.
    async fn list_by_agent(&self, addr: &str, limit: usize) -> Result<Vec<Escrow>, StoreError>;

    /// Records with `auto_release_at < before` and status pending or
    /// delivered. Disputed and arbitrating records are never returned.
    async fn list_expired(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Escrow>, StoreError>;

    /// Records with the given status, newest first.
    async fn list_by_status(
        &self,
        status: EscrowStatus,
        limit: usize,
    ) -> Result<Vec<Escrow>, StoreError>;
}

/// Persistence contract for multi-step escrows and their step rows.
#[async_trait]
pub trait MultiStepStore: Send + Sync {
    /// Insert a new record. Duplicate id is an error.
    async fn create(&self, escrow: &MultiStepEscrow) -> Result<(), StoreError>;

    /// Fetch a deep copy of a record.
    async fn get(&self, id: &str) -> Result<MultiStepEscrow, StoreError>;

    /// Confirmed steps for an escrow, ordered by index.
    async fn steps(&self, id: &str) -> Result<Vec<StepRecord>, StoreError>;

    /// Atomically insert a step row and bump the counters. Rejects a
    /// duplicate `(id, index)` and any record that is not `open`.
    /// Returns the updated record.
    async fn record_step(
        &self,
        id: &str,
        step: StepRecord,
    ) -> Result<MultiStepEscrow, StoreError>;

    /// Inverse of `record_step`: drop the row and roll the counters
    /// back. Compensation hook for callers that unwind a failed release.
    async fn delete_step(&self, id: &str, index: u32) -> Result<MultiStepEscrow, StoreError>;

    /// Transition `open` -> `completed`. Conditional on `open`.
    async fn complete(
        &self,
        id: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<MultiStepEscrow, StoreError>;

    /// Transition `open` -> `aborted`. Conditional on `open`.
    async fn abort(
        &self,
        id: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<MultiStepEscrow, StoreError>;
}

// ============================================================================
// In-memory escrow store
// ============================================================================

/// HashMap-backed [`EscrowStore`].
#[derive(Default)]
pub struct InMemoryEscrowStore {
    records: Mutex<HashMap<String, Escrow>>,
}

impl InMemoryEscrowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Newest-first by creation time, capped at `limit`.
fn newest_first(mut records: Vec<Escrow>, limit: usize) -> Vec<Escrow> {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    records.truncate(limit);
    records
}

#[async_trait]
impl EscrowStore for InMemoryEscrowStore {
    async fn create(&self, escrow: &Escrow) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&escrow.id) {
            return Err(StoreError::Duplicate(escrow.id.clone()));
        }
        // Clone on write keeps the stored record disjoint from the
        // caller's copy, evidence buffer included.
        records.insert(escrow.id.clone(), escrow.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Escrow, StoreError> {
        let records = self.records.lock().await;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(&self, escrow: &Escrow) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        match records.get_mut(&escrow.id) {
            Some(slot) => {
                *slot = escrow.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(escrow.id.clone())),
        }
    }

    async fn list_by_agent(&self, addr: &str, limit: usize) -> Result<Vec<Escrow>, StoreError> {
        let records = self.records.lock().await;
        let matched = records
            .values()
            .filter(|e| e.involves(addr))
            .cloned()
            .collect();
        Ok(newest_first(matched, limit))
    }

    async fn list_expired(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Escrow>, StoreError> {
        let records = self.records.lock().await;
        let mut matched: Vec<Escrow> = records
            .values()
            .filter(|e| {
                matches!(e.status, EscrowStatus::Pending | EscrowStatus::Delivered)
                    && e.auto_release_at < before
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.auto_release_at.cmp(&b.auto_release_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn list_by_status(
        &self,
        status: EscrowStatus,
        limit: usize,
    ) -> Result<Vec<Escrow>, StoreError> {
        let records = self.records.lock().await;
        let matched = records
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        Ok(newest_first(matched, limit))
    }
}

// ============================================================================
// In-memory multi-step store
// ============================================================================

#[derive(Default)]
struct MultiStepState {
    records: HashMap<String, MultiStepEscrow>,
    // Parent id -> step rows keyed by index; the BTreeMap keeps
    // `steps()` ordered and makes the duplicate check a plain lookup.
    steps: HashMap<String, BTreeMap<u32, StepRecord>>,
}

/// HashMap-backed [`MultiStepStore`].
#[derive(Default)]
pub struct InMemoryMultiStepStore {
    state: Mutex<MultiStepState>,
}

impl InMemoryMultiStepStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn require_open(record: &MultiStepEscrow) -> Result<(), StoreError> {
    if record.status == MultiStepStatus::Open {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "multistep {} is {}",
            record.id, record.status
        )))
    }
}

#[async_trait]
impl MultiStepStore for InMemoryMultiStepStore {
    async fn create(&self, escrow: &MultiStepEscrow) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&escrow.id) {
            return Err(StoreError::Duplicate(escrow.id.clone()));
        }
        state.records.insert(escrow.id.clone(), escrow.clone());
        state.steps.insert(escrow.id.clone(), BTreeMap::new());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<MultiStepEscrow, StoreError> {
        let state = self.state.lock().await;
        state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn steps(&self, id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let state = self.state.lock().await;
        if !state.records.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(state
            .steps
            .get(id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_step(
        &self,
        id: &str,
        step: StepRecord,
    ) -> Result<MultiStepEscrow, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        require_open(&record)?;

        let rows = state.steps.entry(id.to_string()).or_default();
        if rows.contains_key(&step.index) {
            return Err(StoreError::DuplicateStep { index: step.index });
        }
        let new_spent = record.spent_amount + step.amount;
        if new_spent > record.total_amount {
            return Err(StoreError::Conflict(format!(
                "step would overdraw budget: spent {new_spent} of {}",
                record.total_amount
            )));
        }

        rows.insert(step.index, step.clone());
        let record = state
            .records
            .get_mut(id)
            .expect("record existed under the same lock");
        record.spent_amount = new_spent;
        record.confirmed_steps += 1;
        record.updated_at = step.confirmed_at;
        Ok(record.clone())
    }

    async fn delete_step(&self, id: &str, index: u32) -> Result<MultiStepEscrow, StoreError> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let removed = state
            .steps
            .get_mut(id)
            .and_then(|rows| rows.remove(&index))
            .ok_or(StoreError::Conflict(format!("step {index} not recorded")))?;
        let record = state
            .records
            .get_mut(id)
            .expect("record existed under the same lock");
        record.spent_amount -= removed.amount;
        record.confirmed_steps -= 1;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn complete(
        &self,
        id: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<MultiStepEscrow, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        require_open(record)?;
        record.status = MultiStepStatus::Completed;
        record.resolved_at = Some(resolved_at);
        record.updated_at = resolved_at;
        Ok(record.clone())
    }

    async fn abort(
        &self,
        id: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<MultiStepEscrow, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        require_open(record)?;
        record.status = MultiStepStatus::Aborted;
        record.resolved_at = Some(resolved_at);
        record.updated_at = resolved_at;
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::types::{new_escrow_id, new_multistep_id, EvidenceEntry, PlannedStep};

    fn sample_escrow(status: EscrowStatus, auto_release_at: DateTime<Utc>) -> Escrow {
        let now = Utc::now();
        Escrow {
            id: new_escrow_id(),
            buyer_addr: "0xbuyer".into(),
            seller_addr: "0xseller".into(),
            amount: Amount::from_units(10),
            service_id: None,
            session_key_id: None,
            status,
            created_at: now,
            updated_at: now,
            auto_release_at,
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
        }
    }

    fn sample_multistep(total: Amount, steps: Vec<PlannedStep>) -> MultiStepEscrow {
        let now = Utc::now();
        MultiStepEscrow {
            id: new_multistep_id(),
            buyer_addr: "0xbuyer".into(),
            total_amount: total,
            spent_amount: Amount::ZERO,
            total_steps: steps.len() as u32,
            confirmed_steps: 0,
            planned_steps: steps,
            status: MultiStepStatus::Open,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = InMemoryEscrowStore::new();
        let escrow = sample_escrow(EscrowStatus::Pending, Utc::now());
        store.create(&escrow).await.unwrap();
        let err = store.create(&escrow).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn update_refuses_upsert() {
        let store = InMemoryEscrowStore::new();
        let escrow = sample_escrow(EscrowStatus::Pending, Utc::now());
        let err = store.update(&escrow).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_returns_a_deep_copy_of_the_evidence_list() {
        let store = InMemoryEscrowStore::new();
        let mut escrow = sample_escrow(EscrowStatus::Disputed, Utc::now());
        escrow.dispute_evidence.push(EvidenceEntry {
            submitter: "0xbuyer".into(),
            content: "late".into(),
            submitted_at: Utc::now(),
        });
        store.create(&escrow).await.unwrap();

        // Mutating the returned copy must not leak into the store.
        let mut copy = store.get(&escrow.id).await.unwrap();
        copy.dispute_evidence[0].content = "tampered".into();
        copy.dispute_evidence.push(EvidenceEntry {
            submitter: "0xseller".into(),
            content: "injected".into(),
            submitted_at: Utc::now(),
        });

        let fresh = store.get(&escrow.id).await.unwrap();
        assert_eq!(fresh.dispute_evidence.len(), 1);
        assert_eq!(fresh.dispute_evidence[0].content, "late");
    }

    #[tokio::test]
    async fn list_expired_excludes_disputed_and_arbitrating() {
        let store = InMemoryEscrowStore::new();
        let past = Utc::now() - chrono::Duration::minutes(1);
        for status in [
            EscrowStatus::Pending,
            EscrowStatus::Delivered,
            EscrowStatus::Disputed,
            EscrowStatus::Arbitrating,
            EscrowStatus::Released,
        ] {
            store.create(&sample_escrow(status, past)).await.unwrap();
        }
        let expired = store.list_expired(Utc::now(), 100).await.unwrap();
        assert_eq!(expired.len(), 2);
        for e in expired {
            assert!(matches!(
                e.status,
                EscrowStatus::Pending | EscrowStatus::Delivered
            ));
        }
    }

    #[tokio::test]
    async fn list_by_agent_matches_either_side_and_caps() {
        let store = InMemoryEscrowStore::new();
        for _ in 0..5 {
            store
                .create(&sample_escrow(EscrowStatus::Pending, Utc::now()))
                .await
                .unwrap();
        }
        let as_buyer = store.list_by_agent("0xbuyer", 3).await.unwrap();
        assert_eq!(as_buyer.len(), 3);
        let as_seller = store.list_by_agent("0xseller", 100).await.unwrap();
        assert_eq!(as_seller.len(), 5);
        let stranger = store.list_by_agent("0xnobody", 100).await.unwrap();
        assert!(stranger.is_empty());
    }

    #[tokio::test]
    async fn record_step_rejects_duplicates_and_bumps_counters() {
        let store = InMemoryMultiStepStore::new();
        let ms = sample_multistep(
            Amount::from_micros(30_000),
            vec![
                PlannedStep {
                    seller_addr: "0xs1".into(),
                    amount: Amount::from_micros(10_000),
                },
                PlannedStep {
                    seller_addr: "0xs2".into(),
                    amount: Amount::from_micros(20_000),
                },
            ],
        );
        store.create(&ms).await.unwrap();

        let step = StepRecord {
            index: 0,
            seller_addr: "0xs1".into(),
            amount: Amount::from_micros(10_000),
            confirmed_at: Utc::now(),
        };
        let updated = store.record_step(&ms.id, step.clone()).await.unwrap();
        assert_eq!(updated.confirmed_steps, 1);
        assert_eq!(updated.spent_amount, Amount::from_micros(10_000));

        let err = store.record_step(&ms.id, step).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStep { index: 0 }));
    }

    #[tokio::test]
    async fn delete_step_rolls_the_counters_back() {
        let store = InMemoryMultiStepStore::new();
        let ms = sample_multistep(
            Amount::from_micros(10_000),
            vec![PlannedStep {
                seller_addr: "0xs1".into(),
                amount: Amount::from_micros(10_000),
            }],
        );
        store.create(&ms).await.unwrap();
        store
            .record_step(
                &ms.id,
                StepRecord {
                    index: 0,
                    seller_addr: "0xs1".into(),
                    amount: Amount::from_micros(10_000),
                    confirmed_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        let rolled = store.delete_step(&ms.id, 0).await.unwrap();
        assert_eq!(rolled.confirmed_steps, 0);
        assert_eq!(rolled.spent_amount, Amount::ZERO);
        assert!(store.steps(&ms.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_and_abort_are_conditional_on_open() {
        let store = InMemoryMultiStepStore::new();
        let ms = sample_multistep(Amount::from_units(1), vec![PlannedStep {
            seller_addr: "0xs1".into(),
            amount: Amount::from_units(1),
        }]);
        store.create(&ms).await.unwrap();
        store.complete(&ms.id, Utc::now()).await.unwrap();
        let err = store.abort(&ms.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
