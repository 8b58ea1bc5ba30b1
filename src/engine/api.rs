use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::models::{
    BalanceRecord, CustomerScope, DeductError, DeductionItem, DeductionRequest, OveragePolicy,
    Rollover,
};
use crate::engine::service::{TrackError, TrackService};
use crate::error::{AppError, AppResult};

/// key: engine-api -> thin seam over the tracking service

#[derive(Debug, Deserialize)]
pub struct TrackBody {
    pub customer_id: Uuid,
    pub org_id: Uuid,
    pub env: String,
    pub items: Vec<DeductionItem>,
    #[serde(default = "default_policy")]
    pub policy: OveragePolicy,
    pub entity_id: Option<String>,
    pub idempotency_key: Option<String>,
}

fn default_policy() -> OveragePolicy {
    OveragePolicy::Cap
}

#[derive(Debug, Serialize)]
pub struct TrackResponse {
    pub balances: Vec<BalanceRecord>,
    pub rollovers: Vec<Rollover>,
    pub events_recorded: usize,
}

/// Requests arrive already validated and resolved to internal ids; this
/// handler only reshapes and dispatches.
pub async fn track(
    Extension(service): Extension<Arc<TrackService>>,
    Json(body): Json<TrackBody>,
) -> AppResult<Json<TrackResponse>> {
    if body.items.is_empty() {
        return Err(AppError::BadRequest("no deduction items".to_string()));
    }
    let request = DeductionRequest {
        customer_id: body.customer_id,
        org_id: body.org_id,
        env: body.env,
        items: body.items,
        policy: body.policy,
        entity_id: body.entity_id,
        idempotency_key: body.idempotency_key,
    };
    let result = service.track(&request).await.map_err(|err| match err {
        TrackError::Duplicate(key) => AppError::Duplicate(key),
        rejected @ TrackError::InsufficientBalance(_) => {
            AppError::InsufficientBalance(rejected.to_string())
        }
        TrackError::Infrastructure(message) => AppError::BadGateway(message),
    })?;
    Ok(Json(TrackResponse {
        events_recorded: result.events.len(),
        balances: result.balances,
        rollovers: result.rollovers,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub org_id: Uuid,
    pub env: String,
}

#[derive(Debug, Serialize)]
pub struct BalancesResponse {
    pub customer_id: Uuid,
    pub balances: Vec<BalanceRecord>,
    pub rollovers: Vec<Rollover>,
}

/// Readback of one resident customer's balances from the fast-path store.
pub async fn customer_balances(
    Extension(service): Extension<Arc<TrackService>>,
    Path(customer_id): Path<Uuid>,
    Query(query): Query<ScopeQuery>,
) -> AppResult<Json<BalancesResponse>> {
    let scope = CustomerScope {
        org_id: query.org_id,
        env: query.env,
        customer_id,
    };
    let snapshot = service.syncer().snapshot(&scope).await.map_err(|err| match err {
        DeductError::CustomerNotFound => AppError::NotFound,
        other => AppError::BadGateway(other.to_string()),
    })?;
    let mut balances: Vec<BalanceRecord> = snapshot.balances.into_values().collect();
    balances.sort_by_key(|record| record.id);
    let mut rollovers: Vec<Rollover> = snapshot.rollovers.into_values().collect();
    rollovers.sort_by_key(|rollover| rollover.id);
    Ok(Json(BalancesResponse {
        customer_id,
        balances,
        rollovers,
    }))
}
