//! Order placement and lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::{PlaceOrderRequest, PlacementOutcome};
use common::{TenantId, UserId};
use reservation::{LineItem, ReservationStore};
use serde::Deserialize;
use stock_ledger::{OrderRecord, ShippingAddress, StockLedger};

use super::reservations::UnavailableResponse;
use super::{AppState, parse_order_id};
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct PlaceOrderBody {
    pub user_id: String,
    pub items: Vec<LineItem>,
    pub idempotency_key: String,
    pub shipping_address: ShippingAddress,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

/// POST /tenants/{tenant_id}/orders: run a full checkout.
///
/// 201 with the order, 409 with the short lines, 503 while locks are busy.
#[tracing::instrument(skip(state, body))]
pub async fn place<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Path(tenant_id): Path<String>,
    Json(body): Json<PlaceOrderBody>,
) -> Result<Response, ApiError>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    if body.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }

    let request = PlaceOrderRequest {
        tenant_id: TenantId::new(tenant_id),
        user_id: UserId::new(body.user_id),
        items: body.items,
        idempotency_key: body.idempotency_key,
        shipping_address: body.shipping_address,
        coupon_code: body.coupon_code,
    };

    match state.placement.place_order(request).await? {
        PlacementOutcome::Placed(order) => Ok((StatusCode::CREATED, Json(*order)).into_response()),
        PlacementOutcome::Unavailable(items) => Ok(UnavailableResponse::conflict(items)),
        PlacementOutcome::Busy => Err(ApiError::Busy),
    }
}

/// GET /tenants/{tenant_id}/orders/{order_id}
#[tracing::instrument(skip(state))]
pub async fn get<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Path((tenant_id, order_id)): Path<(String, String)>,
) -> Result<Json<OrderRecord>, ApiError>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let order_id = parse_order_id(&order_id)?;
    let tenant_id = TenantId::new(tenant_id);
    let order = state
        .reservations
        .ledger()
        .get_order(&tenant_id, order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {order_id} not found")))?;
    Ok(Json(order))
}
