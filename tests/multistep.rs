//! End-to-end tests for multi-step pipelines: sequential claims, the
//! duplicate-step invariant, dust refunds, and abort semantics.

use std::sync::Arc;

use paylock::events::ObserverSet;
use paylock::{
    Amount, EngineConfig, EscrowError, InMemoryLedger, InMemoryMultiStepStore, LockStepsRequest,
    MultiStepService, MultiStepStatus, PlannedStep,
};

struct Harness {
    multistep: Arc<MultiStepService>,
    ledger: Arc<InMemoryLedger>,
}

async fn harness(deposit: &str) -> Harness {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.deposit("0xb", deposit.parse().unwrap()).await;
    let multistep = Arc::new(MultiStepService::new(
        Arc::new(InMemoryMultiStepStore::new()),
        ledger.clone(),
        ObserverSet::default(),
        EngineConfig::default(),
    ));
    Harness { multistep, ledger }
}

fn amount(s: &str) -> Amount {
    s.parse().unwrap()
}

fn plan(entries: &[(&str, &str)]) -> Vec<PlannedStep> {
    entries
        .iter()
        .map(|(seller, amount)| PlannedStep {
            seller_addr: (*seller).into(),
            amount: amount.parse().unwrap(),
        })
        .collect()
}

fn lock_request(total: &str, steps: Vec<PlannedStep>) -> LockStepsRequest {
    LockStepsRequest {
        buyer_addr: "0xb".into(),
        total_amount: total.parse().unwrap(),
        total_steps: steps.len() as u32,
        planned_steps: steps,
    }
}

#[tokio::test]
async fn three_step_pipeline_completes_with_three_releases() {
    let h = harness("1.00").await;
    let escrow = h
        .multistep
        .lock_steps(
            "0xb",
            lock_request(
                "0.030",
                plan(&[("0xs1", "0.010"), ("0xs2", "0.010"), ("0xs3", "0.010")]),
            ),
        )
        .await
        .unwrap();
    assert_eq!(h.ledger.balance("0xb").await.escrowed, amount("0.030"));

    // 1. Each seller claims their planned step.
    for (index, seller) in [(0, "0xs1"), (1, "0xs2"), (2, "0xs3")] {
        h.multistep
            .confirm_step("0xb_ignored", &escrow.id, index, seller, amount("0.010"))
            .await
            .expect_err("caller must be the planned seller");
        h.multistep
            .confirm_step(seller, &escrow.id, index, seller, amount("0.010"))
            .await
            .unwrap();
    }

    // 2. Pipeline closed, every seller paid, budget fully spent.
    let finished = h.multistep.get(&escrow.id).await.unwrap();
    assert_eq!(finished.status, MultiStepStatus::Completed);
    assert_eq!(finished.confirmed_steps, 3);
    assert_eq!(finished.spent_amount, amount("0.030"));
    for seller in ["0xs1", "0xs2", "0xs3"] {
        let balance = h.ledger.balance(seller).await;
        assert_eq!(balance.available, amount("0.010"));
        assert!(balance.conserves());
    }
    let buyer = h.ledger.balance("0xb").await;
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert!(buyer.conserves());

    // 3. Replaying a confirmed step is a precise duplicate error.
    let err = h
        .multistep
        .confirm_step("0xs1", &escrow.id, 0, "0xs1", amount("0.010"))
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::DuplicateStep { index: 0 }));
}

#[tokio::test]
async fn undershooting_plan_triggers_a_dust_refund_at_completion() {
    let h = harness("1.00").await;
    // Lock 0.030 against a 0.020 plan; the residue is dust.
    let escrow = h
        .multistep
        .lock_steps(
            "0xb",
            lock_request("0.030", plan(&[("0xs1", "0.010"), ("0xs2", "0.010")])),
        )
        .await
        .unwrap();

    h.multistep
        .confirm_step("0xs1", &escrow.id, 0, "0xs1", amount("0.010"))
        .await
        .unwrap();
    let finished = h
        .multistep
        .confirm_step("0xs2", &escrow.id, 1, "0xs2", amount("0.010"))
        .await
        .unwrap();

    assert_eq!(finished.status, MultiStepStatus::Completed);
    assert_eq!(finished.spent_amount, amount("0.020"));

    // spent + dust == total: the 0.010 residue went back to the buyer.
    let buyer = h.ledger.balance("0xb").await;
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert_eq!(buyer.available, amount("0.980"));
    assert!(buyer.conserves());
}

#[tokio::test]
async fn concurrent_claims_of_one_step_have_a_single_winner() {
    let h = harness("1.00").await;
    let escrow = h
        .multistep
        .lock_steps(
            "0xb",
            lock_request("0.020", plan(&[("0xs1", "0.010"), ("0xs2", "0.010")])),
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let service = h.multistep.clone();
        let id = escrow.id.clone();
        tasks.push(tokio::spawn(async move {
            service
                .confirm_step("0xs1", &id, 0, "0xs1", "0.010".parse().unwrap())
                .await
        }));
    }

    let mut ok = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EscrowError::DuplicateStep { index: 0 }) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(duplicates, 5);

    // Exactly one release reached the seller.
    assert_eq!(h.ledger.balance("0xs1").await.available, amount("0.010"));
    let fresh = h.multistep.get(&escrow.id).await.unwrap();
    assert_eq!(fresh.confirmed_steps, 1);
    assert_eq!(fresh.spent_amount, amount("0.010"));
}

#[tokio::test]
async fn abort_refunds_the_remainder_and_freezes_the_pipeline() {
    let h = harness("1.00").await;
    let escrow = h
        .multistep
        .lock_steps(
            "0xb",
            lock_request("0.030", plan(&[("0xs1", "0.010"), ("0xs2", "0.020")])),
        )
        .await
        .unwrap();
    h.multistep
        .confirm_step("0xs1", &escrow.id, 0, "0xs1", amount("0.010"))
        .await
        .unwrap();

    let aborted = h.multistep.refund_remaining("0xb", &escrow.id).await.unwrap();
    assert_eq!(aborted.status, MultiStepStatus::Aborted);
    assert!(aborted.resolved_at.is_some());

    let buyer = h.ledger.balance("0xb").await;
    assert_eq!(buyer.escrowed, Amount::ZERO);
    assert_eq!(buyer.available, amount("0.990"));
    assert!(buyer.conserves());

    // No step can land after the abort.
    let err = h
        .multistep
        .confirm_step("0xs2", &escrow.id, 1, "0xs2", amount("0.020"))
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::PipelineClosed { .. }));
}

#[tokio::test]
async fn spent_never_exceeds_total() {
    let h = harness("1.00").await;
    let escrow = h
        .multistep
        .lock_steps(
            "0xb",
            lock_request("0.020", plan(&[("0xs1", "0.010"), ("0xs2", "0.010")])),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        h.multistep
            .confirm_step("0xs1", &escrow.id, 0, "0xs1", amount("0.010"))
            .await
            .ok();
    }
    let fresh = h.multistep.get(&escrow.id).await.unwrap();
    assert!(fresh.spent_amount <= fresh.total_amount);
    assert_eq!(fresh.spent_amount, amount("0.010"));
}

#[tokio::test]
async fn unknown_pipeline_ids_are_not_found() {
    let h = harness("1.00").await;
    let err = h
        .multistep
        .confirm_step("0xs1", "mse_missing", 0, "0xs1", amount("0.010"))
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::NotFound(_)));
}
