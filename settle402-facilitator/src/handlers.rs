//! Axum route handlers for the facilitator service.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /health` | liveness |
//! | `GET /networks` | supported networks |
//! | `POST /authorizations` | build an authorization and its typed data |
//! | `POST /settle` | settle one signed authorization |
//! | `POST /settle/batch` | settle several, in order, through one facilitator |
//! | `GET /facilitators` | routable facilitators, optionally by network |
//! | `POST /facilitators` | create a facilitator |
//! | `GET /facilitators/owner/{owner}` | an owner's facilitators |
//! | `GET /facilitators/{id}/funding` | reconcile status against the live balance |
//! | `DELETE /facilitators/{id}` | delete, owner only (`X-Owner-Address`) |

use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::Address;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use settle402::authorization::{
    AuthorizationCodec, SignedAuthorization, TransferAuthorization, TypedData, from_wire_form,
};
use settle402::networks::{ChainId, NetworkDescriptor};
use tower_http::cors;

use crate::directory::{Directory, FacilitatorView, NetworkFilter, NewFacilitator};
use crate::engine::{BatchOutcome, NetworkHint, SettlementEngine, SettlementOutcome, TokenHint};
use crate::error::{ServiceError, settle_status};
use crate::monitor::{FundingMonitor, FundingReport};

/// Header naming the caller of owner-only routes.
pub const OWNER_HEADER: &str = "x-owner-address";

/// Components shared by every handler.
#[derive(Debug)]
pub struct AppContext {
    /// Authorization builder.
    pub codec: AuthorizationCodec,
    /// Facilitator records.
    pub directory: Arc<Directory>,
    /// Funding reconciliation.
    pub monitor: FundingMonitor,
    /// On-chain settlement.
    pub engine: SettlementEngine,
}

/// Shared application state.
pub type AppState = Arc<AppContext>;

/// Body of `POST /authorizations`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    /// Payer.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Human decimal amount, e.g. `"2.50"`.
    pub amount: String,
    /// Network id.
    pub network: String,
}

/// Response of `POST /authorizations`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationResponse {
    /// The unsigned authorization.
    pub authorization: TransferAuthorization,
    /// What the payer's wallet must sign.
    pub typed_data: TypedData,
}

/// Body of `POST /settle`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleBody {
    /// Facilitator to use; the least recently used funded one when absent.
    #[serde(default)]
    pub facilitator_id: Option<String>,
    /// Network hint.
    #[serde(flatten)]
    pub network: NetworkHint,
    /// Token hint.
    #[serde(flatten)]
    pub token: TokenHint,
    /// Signed authorization in wire form.
    pub authorization: serde_json::Value,
}

/// Body of `POST /settle/batch`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchBody {
    /// Facilitator paying for every leg.
    pub facilitator_id: String,
    /// Network all legs settle on.
    pub network: String,
    /// Token hint applied to every leg.
    #[serde(flatten)]
    pub token: TokenHint,
    /// Signed authorizations in wire form, in execution order.
    pub authorizations: Vec<serde_json::Value>,
}

/// Query of `GET /facilitators`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Network id filter.
    #[serde(default)]
    pub network: Option<String>,
    /// Chain id filter, used when `network` is absent.
    #[serde(default)]
    pub chain_id: Option<ChainId>,
    /// Refresh every status against live balances first.
    #[serde(default)]
    pub reconcile: bool,
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /networks`
pub async fn get_networks(State(app): State<AppState>) -> Json<Vec<NetworkDescriptor>> {
    Json(
        app.directory
            .registry()
            .list()
            .into_iter()
            .cloned()
            .collect(),
    )
}

/// `POST /authorizations`
///
/// # Errors
///
/// Returns 400 for an unknown network or an amount that does not fit the
/// token's decimals.
pub async fn post_authorization(
    State(app): State<AppState>,
    Json(body): Json<AuthorizationRequest>,
) -> Result<Json<AuthorizationResponse>, ServiceError> {
    let authorization =
        app.codec
            .build_authorization(body.from, body.to, body.amount.trim(), &body.network)?;
    let typed_data = app.codec.typed_data_for(&authorization, &body.network)?;
    Ok(Json(AuthorizationResponse {
        authorization,
        typed_data,
    }))
}

/// `POST /settle`
///
/// # Errors
///
/// Maps [`SettleError`](crate::engine::SettleError) to 400/404/422/500/502/504.
pub async fn post_settle(
    State(app): State<AppState>,
    Json(body): Json<SettleBody>,
) -> Result<Json<SettlementOutcome>, ServiceError> {
    let signed = from_wire_form(body.authorization)?;
    let outcome = match body.facilitator_id.as_deref() {
        Some(id) => app.engine.settle(id, &body.network, body.token, &signed).await?,
        None => app.engine.settle_any(&body.network, body.token, &signed).await?,
    };
    Ok(Json(outcome))
}

/// `POST /settle/batch`
///
/// Responds with the batch outcome in every case where legs were attempted;
/// the status reflects the failing leg, if any.
///
/// # Errors
///
/// Returns an error response without a batch outcome if nothing was attempted.
pub async fn post_settle_batch(
    State(app): State<AppState>,
    Json(body): Json<BatchBody>,
) -> Result<Response, ServiceError> {
    let legs = body
        .authorizations
        .into_iter()
        .map(from_wire_form)
        .collect::<Result<Vec<SignedAuthorization>, _>>()?;
    let outcome: BatchOutcome = app
        .engine
        .settle_batch(&body.facilitator_id, &body.network, &legs, body.token)
        .await?;
    let status = outcome
        .failure
        .as_ref()
        .map_or(StatusCode::OK, |f| settle_status(&f.error));
    Ok((status, Json(outcome)).into_response())
}

/// `GET /facilitators`
///
/// # Errors
///
/// Returns 400 if the filter names an unknown network.
pub async fn get_facilitators(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<FacilitatorView>>, ServiceError> {
    let filter = match (query.network, query.chain_id) {
        (Some(network), _) => Some(NetworkFilter::Name(network)),
        (None, Some(chain_id)) => Some(NetworkFilter::ChainId(chain_id)),
        (None, None) => None,
    };
    let views = app.directory.list_active(filter.as_ref()).await?;
    if query.reconcile {
        return Ok(Json(app.monitor.reconcile_all(views).await));
    }
    Ok(Json(views))
}

/// `POST /facilitators`
///
/// # Errors
///
/// Returns 400 on invalid input.
pub async fn post_facilitator(
    State(app): State<AppState>,
    Json(body): Json<NewFacilitator>,
) -> Result<(StatusCode, Json<FacilitatorView>), ServiceError> {
    let id = app.directory.create(body).await?;
    let record = app.directory.require(&id).await?;
    Ok((StatusCode::CREATED, Json(record.view())))
}

fn parse_owner(raw: &str) -> Result<Address, ServiceError> {
    Address::from_str(raw.trim())
        .map_err(|_| ServiceError::BadRequest(format!("invalid owner address `{raw}`")))
}

/// `GET /facilitators/owner/{owner}`
///
/// # Errors
///
/// Returns 400 for a malformed address.
pub async fn get_owner_facilitators(
    State(app): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<Vec<FacilitatorView>>, ServiceError> {
    let owner = parse_owner(&owner)?;
    Ok(Json(app.directory.list_by_owner(owner).await?))
}

/// `GET /facilitators/{id}/funding`
///
/// # Errors
///
/// Returns 404 for an unknown facilitator or 502 if the balance read fails.
pub async fn get_funding(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FundingReport>, ServiceError> {
    Ok(Json(app.monitor.check_and_reconcile(&id).await?))
}

/// `DELETE /facilitators/{id}`
///
/// # Errors
///
/// Returns 400 without an owner header, 403 if the caller is not the owner,
/// or 404.
pub async fn delete_facilitator(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ServiceError> {
    let caller = headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::BadRequest(format!("missing {OWNER_HEADER} header")))?;
    app.directory.delete(&id, parse_owner(caller)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Builds the router with permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/networks", get(get_networks))
        .route("/authorizations", post(post_authorization))
        .route("/settle", post(post_settle))
        .route("/settle/batch", post(post_settle_batch))
        .route("/facilitators", get(get_facilitators).post(post_facilitator))
        .route("/facilitators/owner/{owner}", get(get_owner_facilitators))
        .route("/facilitators/{id}/funding", get(get_funding))
        .route("/facilitators/{id}", delete(delete_facilitator))
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(cors::Any),
        )
        .with_state(state)
}
