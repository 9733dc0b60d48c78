//! Paylock server: in-memory backends, the auto-release sweeper, and
//! the HTTP surface on one listener.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use paylock::events::{
    ObserverSet, ReceiptIssuer, ReputationImpactor, RevenueAccumulator, TransactionRecorder,
    WebhookEmitter,
};
use paylock::http::{router, AppState};
use paylock::{
    AutoReleaseTimer, EngineConfig, EscrowService, InMemoryEscrowStore, InMemoryLedger,
    InMemoryMultiStepStore, MultiStepService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::default();
    let ledger = Arc::new(InMemoryLedger::new());
    let escrow_store = Arc::new(InMemoryEscrowStore::new());
    let multistep_store = Arc::new(InMemoryMultiStepStore::new());

    let (webhooks, mut webhook_rx) = WebhookEmitter::channel();
    let observers = ObserverSet::new(vec![
        Arc::new(TransactionRecorder::new()),
        Arc::new(RevenueAccumulator::new()),
        Arc::new(ReputationImpactor::new()),
        Arc::new(ReceiptIssuer::new()),
        Arc::new(webhooks),
    ]);
    // Stand-in webhook dispatcher: log deliveries until an outbound
    // sender is wired up.
    tokio::spawn(async move {
        while let Some(delivery) = webhook_rx.recv().await {
            info!(event = delivery.event, "webhook delivery queued");
        }
    });

    let escrow = Arc::new(EscrowService::new(
        escrow_store.clone(),
        ledger.clone(),
        observers.clone(),
        config.clone(),
    ));
    let multistep = Arc::new(MultiStepService::new(
        multistep_store,
        ledger,
        observers,
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let timer = AutoReleaseTimer::new(escrow.clone(), escrow_store, &config);
    let timer_handle = timer.spawn(shutdown_rx);

    let addr = std::env::var("PAYLOCK_ADDR").unwrap_or_else(|_| "0.0.0.0:8642".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "paylock listening");

    let app = router(AppState { escrow, multistep });
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Let the sweeper finish any in-flight batch before exiting.
    let _ = shutdown_tx.send(true);
    timer_handle.stop().await;
    Ok(())
}
