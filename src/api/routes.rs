//! HTTP handlers for the core surface.
//!
//! Authentication happens in an external middleware; handlers trust the
//! validated request context carried in `x-user-id` / `x-user-role` headers
//! and only enforce the role table from the API contract.

use crate::api::response::{ApiFailure, ApiResponse, ApiResult};
use crate::api::ws::websocket_handler;
use crate::error::CoreError;
use crate::inventory::{IntakeRequest, ReceiptLine, StockFilters};
use crate::models::WineType;
use crate::pairing::{PairingFeedback, PairingRequest};
use crate::state::AppState;
use crate::sync::{ClientOperation, OpOutcome, OpStatus};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    Crew,
    Admin,
}

impl Role {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "crew" => Role::Crew,
            _ => Role::Guest,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Crew => "crew",
            Role::Admin => "admin",
        }
    }
}

/// Validated request context injected by the auth collaborator.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: String,
    pub role: Role,
}

impl RequestContext {
    fn require_crew(&self) -> Result<(), ApiFailure> {
        match self.role {
            Role::Crew | Role::Admin => Ok(()),
            Role::Guest => Err(ApiFailure::forbidden(self.role.as_str())),
        }
    }

    fn require_admin(&self) -> Result<(), ApiFailure> {
        match self.role {
            Role::Admin => Ok(()),
            other => Err(ApiFailure::forbidden(other.as_str())),
        }
    }
}

#[async_trait::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Ok(Self {
            user_id: header("x-user-id").unwrap_or_else(|| "anonymous".to_string()),
            role: Role::parse(&header("x-user-role").unwrap_or_default()),
        })
    }
}

/// Sync envelope clients attach to replayed mutations.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEnvelope {
    pub op_id: String,
    pub updated_at: i64,
    pub origin: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/system/health", get(get_system_health))
        .route("/api/inventory/stock", get(get_stock))
        .route("/api/inventory/summary", get(get_stock_summary))
        .route("/api/inventory/ledger", get(get_ledger))
        .route("/api/inventory/consume", post(post_consume))
        .route("/api/inventory/move", post(post_move))
        .route("/api/inventory/reserve", post(post_reserve))
        .route("/api/inventory/unreserve", post(post_unreserve))
        .route("/api/inventory/intake", post(post_intake))
        .route("/api/inventory/intake/:id/receive", post(post_receive))
        .route("/api/inventory/intake/:id/status", get(get_intake_status))
        .route("/api/inventory/repair", post(post_repair))
        .route("/api/pairing/recommend", post(post_pairing_recommend))
        .route("/api/pairing/feedback", post(post_pairing_feedback))
        .route("/api/pairing/experiment", get(get_experiment_summary))
        .route("/api/sync/apply", post(post_sync_apply))
        .route("/api/vintage/analysis/:wine_id", get(get_vintage_analysis))
        .route("/api/vintage/enrich", post(post_vintage_enrich))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            crate::middleware::logging::request_logging,
        ))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "SommOS operational"
}

#[derive(Debug, Serialize)]
struct SystemHealth {
    status: crate::metrics::HealthStatus,
    metrics: crate::metrics::MetricsSummary,
    websocket_connections: usize,
    storage_ok: bool,
}

/// Aggregate health. Degrades gracefully: a storage fault flips the flag but
/// the rest of the report still renders.
async fn get_system_health(State(state): State<AppState>) -> ApiResult<SystemHealth> {
    let storage_ok = state
        .store
        .read(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .is_ok();
    let metrics = state.metrics.summary();
    Ok(ApiResponse::ok(SystemHealth {
        status: metrics.health,
        metrics,
        websocket_connections: state.hub.connection_count(),
        storage_ok,
    }))
}

#[derive(Debug, Deserialize)]
struct StockQuery {
    #[serde(rename = "type")]
    wine_type: Option<String>,
    region: Option<String>,
    location: Option<String>,
    #[serde(default)]
    available_only: bool,
    search: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn get_stock(
    State(state): State<AppState>,
    Query(query): Query<StockQuery>,
) -> ApiResult<Value> {
    let wine_type = match query.wine_type.as_deref() {
        Some(raw) => Some(
            WineType::parse(raw)
                .ok_or_else(|| ApiFailure::from(CoreError::invalid(format!("wine type '{raw}'"))))?,
        ),
        None => None,
    };
    let views = state.inventory.get_stock(&StockFilters {
        wine_type,
        region: query.region,
        location: query.location,
        available_only: query.available_only,
        search: query.search,
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0),
    })?;
    Ok(ApiResponse::ok(json!({
        "items": views,
        "count": views.len(),
    })))
}

async fn get_stock_summary(State(state): State<AppState>) -> ApiResult<Value> {
    let summary = state.inventory.stock_summary()?;
    Ok(ApiResponse::ok(to_json(summary)?))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, ApiFailure> {
    serde_json::to_value(value).map_err(|e| ApiFailure::from(CoreError::Storage(e.to_string())))
}

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    vintage_id: Option<i64>,
    location: Option<String>,
    limit: Option<usize>,
}

async fn get_ledger(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<LedgerQuery>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    let entries = state.inventory.list_ledger(
        query.vintage_id,
        query.location.as_deref(),
        query.limit.unwrap_or(100),
    )?;
    Ok(ApiResponse::ok(json!({
        "entries": entries,
        "count": entries.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct ConsumeBody {
    vintage_id: i64,
    location: String,
    quantity: i64,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    sync: Option<SyncEnvelope>,
}

/// Mutations carrying a sync envelope run through the reconciler so online
/// writes and offline replays share idempotence and conflict semantics.
fn apply_synced(
    state: &AppState,
    ctx: &RequestContext,
    sync: SyncEnvelope,
    endpoint: &str,
    payload: Value,
) -> Result<OpOutcome, ApiFailure> {
    let operation = ClientOperation {
        op_id: sync.op_id,
        updated_at: sync.updated_at,
        updated_by: ctx.user_id.clone(),
        origin: sync.origin,
        endpoint: endpoint.to_string(),
        method: "POST".to_string(),
        payload,
    };
    let outcome = state
        .reconciler
        .apply_batch(std::slice::from_ref(&operation))
        .into_iter()
        .next()
        .expect("one outcome per op");
    if outcome.status == OpStatus::Rejected {
        return Err(failure_from_outcome(&outcome));
    }
    Ok(outcome)
}

fn failure_from_outcome(outcome: &OpOutcome) -> ApiFailure {
    let code = outcome.code.clone().unwrap_or_else(|| "storage".to_string());
    let status = match code.as_str() {
        "invalid_argument" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "inventory_conflict" => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ApiFailure {
        status,
        code,
        message: outcome
            .reason
            .clone()
            .unwrap_or_else(|| "operation rejected".to_string()),
    }
}

async fn post_consume(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<ConsumeBody>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    if let Some(sync) = body.sync {
        let payload = json!({
            "vintage_id": body.vintage_id,
            "location": body.location,
            "quantity": body.quantity,
            "notes": body.notes,
        });
        let outcome = apply_synced(&state, &ctx, sync, "/api/inventory/consume", payload)?;
        return Ok(ApiResponse::ok(json!({ "outcome": outcome })));
    }

    let balance = state.inventory.consume(
        body.vintage_id,
        &body.location,
        body.quantity,
        body.notes,
        &ctx.user_id,
    )?;
    Ok(ApiResponse::ok(json!({
        "vintage_id": body.vintage_id,
        "location": body.location,
        "quantity": balance.quantity,
        "reserved_quantity": balance.reserved_quantity,
        "available": balance.available(),
    })))
}

#[derive(Debug, Deserialize)]
struct MoveBody {
    vintage_id: i64,
    from_location: String,
    to_location: String,
    quantity: i64,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    sync: Option<SyncEnvelope>,
}

async fn post_move(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<MoveBody>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    if let Some(sync) = body.sync {
        let payload = json!({
            "vintage_id": body.vintage_id,
            "from_location": body.from_location,
            "to_location": body.to_location,
            "quantity": body.quantity,
            "notes": body.notes,
        });
        let outcome = apply_synced(&state, &ctx, sync, "/api/inventory/move", payload)?;
        return Ok(ApiResponse::ok(json!({ "outcome": outcome })));
    }

    let (from, to) = state.inventory.move_stock(
        body.vintage_id,
        &body.from_location,
        &body.to_location,
        body.quantity,
        body.notes,
        &ctx.user_id,
    )?;
    Ok(ApiResponse::ok(json!({
        "from": { "location": body.from_location, "quantity": from.quantity },
        "to": { "location": body.to_location, "quantity": to.quantity },
    })))
}

#[derive(Debug, Deserialize)]
struct ReserveBody {
    vintage_id: i64,
    location: String,
    quantity: i64,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    sync: Option<SyncEnvelope>,
}

async fn post_reserve(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<ReserveBody>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    if let Some(sync) = body.sync {
        let payload = json!({
            "vintage_id": body.vintage_id,
            "location": body.location,
            "quantity": body.quantity,
            "notes": body.notes,
        });
        let outcome = apply_synced(&state, &ctx, sync, "/api/inventory/reserve", payload)?;
        return Ok(ApiResponse::ok(json!({ "outcome": outcome })));
    }

    let balance = state.inventory.reserve(
        body.vintage_id,
        &body.location,
        body.quantity,
        body.notes,
        &ctx.user_id,
    )?;
    Ok(ApiResponse::ok(json!({
        "quantity": balance.quantity,
        "reserved_quantity": balance.reserved_quantity,
        "available": balance.available(),
    })))
}

async fn post_unreserve(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<ReserveBody>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    if let Some(sync) = body.sync {
        let payload = json!({
            "vintage_id": body.vintage_id,
            "location": body.location,
            "quantity": body.quantity,
            "notes": body.notes,
        });
        let outcome = apply_synced(&state, &ctx, sync, "/api/inventory/unreserve", payload)?;
        return Ok(ApiResponse::ok(json!({ "outcome": outcome })));
    }

    let balance = state.inventory.unreserve(
        body.vintage_id,
        &body.location,
        body.quantity,
        body.notes,
        &ctx.user_id,
    )?;
    Ok(ApiResponse::ok(json!({
        "quantity": balance.quantity,
        "reserved_quantity": balance.reserved_quantity,
        "available": balance.available(),
    })))
}

async fn post_intake(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<IntakeRequest>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    let receipt = state.inventory.intake(&body, &ctx.user_id)?;
    Ok(ApiResponse::ok(to_json(receipt)?))
}

#[derive(Debug, Deserialize)]
struct ReceiveBody {
    receipts: Vec<ReceiptLine>,
    #[serde(default)]
    notes: Option<String>,
}

async fn post_receive(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(order_id): Path<i64>,
    Json(body): Json<ReceiveBody>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    let report = state
        .inventory
        .receive(order_id, &body.receipts, body.notes, &ctx.user_id)?;
    Ok(ApiResponse::ok(to_json(report)?))
}

async fn get_intake_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(order_id): Path<i64>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    let report = state.inventory.get_intake_status(order_id)?;
    Ok(ApiResponse::ok(to_json(report)?))
}

async fn post_repair(State(state): State<AppState>, ctx: RequestContext) -> ApiResult<Value> {
    ctx.require_admin()?;
    let rows = state.inventory.repair_stock()?;
    Ok(ApiResponse::ok(json!({ "rebuilt_rows": rows })))
}

async fn post_pairing_recommend(
    State(state): State<AppState>,
    Json(body): Json<PairingRequest>,
) -> ApiResult<Value> {
    let result = state.pairing.recommend(body).await?;
    Ok(ApiResponse::ok(to_json(&*result)?))
}

async fn post_pairing_feedback(
    State(state): State<AppState>,
    Json(body): Json<PairingFeedback>,
) -> ApiResult<Value> {
    state.pairing.record_feedback(&body)?;
    Ok(ApiResponse::ok(json!({ "recorded": true })))
}

async fn get_experiment_summary(State(state): State<AppState>) -> ApiResult<Value> {
    let summary = state.pairing.experiment_summary();
    Ok(ApiResponse::ok(to_json(summary)?))
}

#[derive(Debug, Deserialize)]
struct SyncApplyBody {
    operations: Vec<ClientOperation>,
}

async fn post_sync_apply(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<SyncApplyBody>,
) -> ApiResult<Value> {
    if body.operations.is_empty() {
        return Err(CoreError::invalid("operations must not be empty").into());
    }
    let mut operations = body.operations;
    for operation in &mut operations {
        if operation.updated_by.trim().is_empty() {
            operation.updated_by = ctx.user_id.clone();
        }
    }
    let outcomes = state.reconciler.apply_batch(&operations);
    let applied = outcomes.iter().filter(|o| o.status == OpStatus::Applied).count();
    let duplicates = outcomes.iter().filter(|o| o.status == OpStatus::Duplicate).count();
    let rejected = outcomes.iter().filter(|o| o.status == OpStatus::Rejected).count();
    Ok(ApiResponse::ok(json!({
        "outcomes": outcomes,
        "applied": applied,
        "duplicates": duplicates,
        "rejected": rejected,
    })))
}

async fn get_vintage_analysis(
    State(state): State<AppState>,
    Path(wine_id): Path<i64>,
) -> ApiResult<Value> {
    let records = state.weather.analysis_for_wine(wine_id)?;
    Ok(ApiResponse::ok(json!({
        "wine_id": wine_id,
        "vintages": records,
    })))
}

#[derive(Debug, Deserialize)]
struct EnrichBody {
    /// Explicit (region, year) work items; defaults to every unscored vintage.
    #[serde(default)]
    items: Vec<(String, i32)>,
}

async fn post_vintage_enrich(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<EnrichBody>,
) -> ApiResult<Value> {
    ctx.require_crew()?;
    let items = if body.items.is_empty() {
        state.weather.missing_enrichment()?
    } else {
        body.items
    };
    let enriched = state.weather.enrich_batch(&items).await;
    Ok(ApiResponse::ok(json!({
        "requested": items.len(),
        "enriched": enriched,
    })))
}
