//! Paylock - HTTP Surface
//!
//! A thin binding layer over the services: request parsing, caller
//! identification, and error-to-status mapping. No policy lives here.
//!
//! The caller's agent address arrives in the `x-agent-address` header;
//! upstream session middleware is expected to have authenticated it.
//! Validation errors map to 400, authorization to 403, unknown ids to
//! 404, and status-gate rejections to 409. Fund-safety errors are
//! logged and surfaced as 500.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::amount::Amount;
use crate::errors::EscrowError;
use crate::escrow::{CreateEscrowRequest, EscrowService};
use crate::multistep::{LockStepsRequest, MultiStepService};
use crate::types::{Escrow, MultiStepEscrow, PlannedStep, StepRecord};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub escrow: Arc<EscrowService>,
    pub multistep: Arc<MultiStepService>,
}

/// Build the full route table from §6 of the platform API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/escrow", post(create_escrow))
        .route("/v1/escrow/:id", get(get_escrow))
        .route("/v1/escrow/:id/deliver", post(deliver))
        .route("/v1/escrow/:id/confirm", post(confirm))
        .route("/v1/escrow/:id/dispute", post(dispute))
        .route("/v1/escrow/:id/evidence", post(submit_evidence))
        .route("/v1/escrow/:id/arbitrate", post(assign_arbitrator))
        .route("/v1/escrow/:id/resolve", post(resolve))
        .route("/v1/agents/:address/escrows", get(list_agent_escrows))
        .route("/v1/escrow/multistep", post(create_multistep))
        .route("/v1/escrow/multistep/:id", get(get_multistep))
        .route("/v1/escrow/multistep/:id/confirm-step", post(confirm_step))
        .route("/v1/escrow/multistep/:id/refund", post(refund_multistep))
        .with_state(state)
}

// ============================================================================
// Caller binding and error mapping
// ============================================================================

/// The authenticated agent address, read from `x-agent-address`.
pub struct Caller(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let addr = parts
            .headers
            .get("x-agent-address")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::bad_request("missing x-agent-address header"))?;
        Ok(Caller(addr))
    }
}

/// A status code plus a JSON error body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        let status = match &err {
            EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
            EscrowError::Unauthorized { .. } | EscrowError::StepMismatch { .. } => {
                StatusCode::FORBIDDEN
            }
            EscrowError::InvalidStatus { .. }
            | EscrowError::AlreadyResolved { .. }
            | EscrowError::DuplicateStep { .. }
            | EscrowError::PipelineClosed { .. } => StatusCode::CONFLICT,
            EscrowError::InvalidAmount(_)
            | EscrowError::Validation(_)
            | EscrowError::StepOutOfRange { .. }
            | EscrowError::AmountExceedsTotal { .. } => StatusCode::BAD_REQUEST,
            EscrowError::Money { .. } | EscrowError::Store(_) | EscrowError::Ledger(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed with a backend or fund-safety error");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn parse_amount(raw: &str) -> Result<Amount, ApiError> {
    raw.parse()
        .map_err(|err: crate::amount::ParseAmountError| ApiError::bad_request(err.to_string()))
}

// ============================================================================
// Single-party escrow handlers
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEscrowBody {
    buyer_addr: String,
    seller_addr: String,
    amount: String,
    service_id: Option<String>,
    session_key_id: Option<String>,
    auto_release: Option<String>,
}

async fn create_escrow(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<CreateEscrowBody>,
) -> Result<(StatusCode, Json<Escrow>), ApiError> {
    let amount = parse_amount(&body.amount)?;
    let escrow = state
        .escrow
        .create(
            &caller.0,
            CreateEscrowRequest {
                buyer_addr: body.buyer_addr,
                seller_addr: body.seller_addr,
                amount,
                service_id: body.service_id,
                session_key_id: body.session_key_id,
                auto_release: body.auto_release,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(escrow)))
}

async fn get_escrow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Escrow>, ApiError> {
    Ok(Json(state.escrow.get(&id).await?))
}

async fn deliver(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Escrow>, ApiError> {
    Ok(Json(state.escrow.mark_delivered(&caller.0, &id).await?))
}

async fn confirm(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Escrow>, ApiError> {
    Ok(Json(state.escrow.confirm(&caller.0, &id).await?))
}

#[derive(Debug, Deserialize)]
struct DisputeBody {
    reason: Option<String>,
}

async fn dispute(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<DisputeBody>,
) -> Result<Json<Escrow>, ApiError> {
    let reason = body
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .ok_or_else(|| ApiError::bad_request("dispute reason is required"))?;
    Ok(Json(state.escrow.dispute(&caller.0, &id, reason).await?))
}

#[derive(Debug, Deserialize)]
struct EvidenceBody {
    content: String,
}

async fn submit_evidence(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<EvidenceBody>,
) -> Result<Json<Escrow>, ApiError> {
    Ok(Json(
        state
            .escrow
            .submit_evidence(&caller.0, &id, &body.content)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArbitrateBody {
    arbitrator_addr: String,
}

async fn assign_arbitrator(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<ArbitrateBody>,
) -> Result<Json<Escrow>, ApiError> {
    Ok(Json(
        state
            .escrow
            .assign_arbitrator(&caller.0, &id, &body.arbitrator_addr)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    resolution: String,
    release_amount: Option<String>,
    reason: Option<String>,
}

async fn resolve(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Escrow>, ApiError> {
    let release_amount = match &body.release_amount {
        Some(raw) => Some(parse_amount(raw)?),
        None => None,
    };
    Ok(Json(
        state
            .escrow
            .resolve_arbitration(
                &caller.0,
                &id,
                &body.resolution,
                release_amount,
                body.reason.as_deref(),
            )
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_agent_escrows(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Escrow>>, ApiError> {
    Ok(Json(
        state.escrow.list_by_agent(&address, query.limit).await?,
    ))
}

// ============================================================================
// Multi-step handlers
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannedStepBody {
    seller_addr: String,
    amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMultiStepBody {
    total_amount: String,
    total_steps: u32,
    planned_steps: Vec<PlannedStepBody>,
}

/// Multi-step record plus its confirmed step rows.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MultiStepView {
    #[serde(flatten)]
    escrow: MultiStepEscrow,
    steps: Vec<StepRecord>,
}

async fn create_multistep(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<CreateMultiStepBody>,
) -> Result<(StatusCode, Json<MultiStepEscrow>), ApiError> {
    let total_amount = parse_amount(&body.total_amount)?;
    let mut planned_steps = Vec::with_capacity(body.planned_steps.len());
    for step in body.planned_steps {
        planned_steps.push(PlannedStep {
            seller_addr: step.seller_addr,
            amount: parse_amount(&step.amount)?,
        });
    }
    let escrow = state
        .multistep
        .lock_steps(
            &caller.0,
            LockStepsRequest {
                buyer_addr: caller.0.clone(),
                total_amount,
                total_steps: body.total_steps,
                planned_steps,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(escrow)))
}

async fn get_multistep(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MultiStepView>, ApiError> {
    let escrow = state.multistep.get(&id).await?;
    let steps = state.multistep.steps(&id).await?;
    Ok(Json(MultiStepView { escrow, steps }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmStepBody {
    step_index: u32,
    seller_addr: String,
    amount: String,
}

async fn confirm_step(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<ConfirmStepBody>,
) -> Result<Json<MultiStepEscrow>, ApiError> {
    let amount = parse_amount(&body.amount)?;
    Ok(Json(
        state
            .multistep
            .confirm_step(&caller.0, &id, body.step_index, &body.seller_addr, amount)
            .await?,
    ))
}

async fn refund_multistep(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<MultiStepEscrow>, ApiError> {
    Ok(Json(state.multistep.refund_remaining(&caller.0, &id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::ObserverSet;
    use crate::ledger::InMemoryLedger;
    use crate::storage::{InMemoryEscrowStore, InMemoryMultiStepStore};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_router() -> (Router, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .deposit("0xbuyer", Amount::from_units(100))
            .await;
        let config = EngineConfig::default();
        let escrow = Arc::new(EscrowService::new(
            Arc::new(InMemoryEscrowStore::new()),
            ledger.clone(),
            ObserverSet::default(),
            config.clone(),
        ));
        let multistep = Arc::new(MultiStepService::new(
            Arc::new(InMemoryMultiStepStore::new()),
            ledger.clone(),
            ObserverSet::default(),
            config,
        ));
        (router(AppState { escrow, multistep }), ledger)
    }

    fn post_json(uri: &str, caller: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-agent-address", caller)
            .body(Body::from(body.to_string()))
            .expect("request build")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn create_returns_201_with_normalized_record() {
        let (app, _ledger) = test_router().await;
        let response = app
            .oneshot(post_json(
                "/v1/escrow",
                "0xBuyer",
                serde_json::json!({
                    "buyerAddr": "0xBUYER",
                    "sellerAddr": "0xSeller",
                    "amount": "15.00",
                    "autoRelease": "5m"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["buyerAddr"], "0xbuyer");
        assert_eq!(body["sellerAddr"], "0xseller");
        assert_eq!(body["amount"], "15.000000");
        assert_eq!(body["status"], "pending");
    }

    #[tokio::test]
    async fn create_rejects_caller_that_is_not_the_buyer() {
        let (app, _ledger) = test_router().await;
        let response = app
            .oneshot(post_json(
                "/v1/escrow",
                "0xsomeoneelse",
                serde_json::json!({
                    "buyerAddr": "0xbuyer",
                    "sellerAddr": "0xseller",
                    "amount": "15.00"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn dispute_without_reason_is_a_400() {
        let (app, _ledger) = test_router().await;
        let created = app
            .clone()
            .oneshot(post_json(
                "/v1/escrow",
                "0xbuyer",
                serde_json::json!({
                    "buyerAddr": "0xbuyer",
                    "sellerAddr": "0xseller",
                    "amount": "1.00"
                }),
            ))
            .await
            .expect("response");
        let id = body_json(created).await["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(post_json(
                &format!("/v1/escrow/{id}/dispute"),
                "0xbuyer",
                serde_json::json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_escrow_is_a_404_and_double_confirm_a_409() {
        let (app, _ledger) = test_router().await;
        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/escrow/esc_unknown")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let created = app
            .clone()
            .oneshot(post_json(
                "/v1/escrow",
                "0xbuyer",
                serde_json::json!({
                    "buyerAddr": "0xbuyer",
                    "sellerAddr": "0xseller",
                    "amount": "1.00"
                }),
            ))
            .await
            .expect("response");
        let id = body_json(created).await["id"].as_str().unwrap().to_string();

        let confirm_uri = format!("/v1/escrow/{id}/confirm");
        let first = app
            .clone()
            .oneshot(post_json(&confirm_uri, "0xbuyer", serde_json::json!({})))
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(post_json(&confirm_uri, "0xbuyer", serde_json::json!({})))
            .await
            .expect("response");
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn multistep_round_trip_over_http() {
        let (app, _ledger) = test_router().await;
        let created = app
            .clone()
            .oneshot(post_json(
                "/v1/escrow/multistep",
                "0xbuyer",
                serde_json::json!({
                    "totalAmount": "0.030",
                    "totalSteps": 2,
                    "plannedSteps": [
                        { "sellerAddr": "0xs1", "amount": "0.010" },
                        { "sellerAddr": "0xs2", "amount": "0.020" }
                    ]
                }),
            ))
            .await
            .expect("response");
        assert_eq!(created.status(), StatusCode::CREATED);
        let id = body_json(created).await["id"].as_str().unwrap().to_string();

        let confirmed = app
            .clone()
            .oneshot(post_json(
                &format!("/v1/escrow/multistep/{id}/confirm-step"),
                "0xs1",
                serde_json::json!({
                    "stepIndex": 0,
                    "sellerAddr": "0xs1",
                    "amount": "0.010"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(confirmed.status(), StatusCode::OK);

        let fetched = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/escrow/multistep/{id}"))
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("response");
        assert_eq!(fetched.status(), StatusCode::OK);
        let body = body_json(fetched).await;
        assert_eq!(body["confirmedSteps"], 1);
        assert_eq!(body["steps"][0]["sellerAddr"], "0xs1");
    }

    #[tokio::test]
    async fn step_mismatch_maps_to_403() {
        let (app, _ledger) = test_router().await;
        let created = app
            .clone()
            .oneshot(post_json(
                "/v1/escrow/multistep",
                "0xbuyer",
                serde_json::json!({
                    "totalAmount": "0.010",
                    "totalSteps": 1,
                    "plannedSteps": [{ "sellerAddr": "0xs1", "amount": "0.010" }]
                }),
            ))
            .await
            .expect("response");
        let id = body_json(created).await["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(post_json(
                &format!("/v1/escrow/multistep/{id}/confirm-step"),
                "0xintruder",
                serde_json::json!({
                    "stepIndex": 0,
                    "sellerAddr": "0xintruder",
                    "amount": "0.010"
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
