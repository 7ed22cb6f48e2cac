//! Reserve, inspect and release endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use common::{OrderId, ReservationId, TenantId};
use reservation::{
    LineItem, Reservation, ReservationError, ReservationStatus, ReservationStore, ReserveOutcome,
    UnavailableItem,
};
use serde::{Deserialize, Serialize};
use stock_ledger::StockLedger;

use super::{AppState, parse_reservation_id};
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct ReserveRequest {
    pub items: Vec<LineItem>,
    pub idempotency_key: String,
}

// -- Response types --

#[derive(Serialize)]
pub struct ReservedResponse {
    pub reservation_id: ReservationId,
    pub expires_at: DateTime<Utc>,
    pub reused: bool,
}

/// Body returned with 409 when stock is short; also used by order placement.
#[derive(Serialize)]
pub struct UnavailableResponse {
    pub error: &'static str,
    pub unavailable: Vec<UnavailableItem>,
}

impl UnavailableResponse {
    pub fn conflict(items: Vec<UnavailableItem>) -> Response {
        (
            StatusCode::CONFLICT,
            Json(UnavailableResponse {
                error: "insufficient stock",
                unavailable: items,
            }),
        )
            .into_response()
    }
}

/// A reservation as shown to its tenant; the idempotency key stays private.
#[derive(Serialize)]
pub struct ReservationView {
    pub reservation_id: ReservationId,
    pub tenant_id: TenantId,
    pub status: ReservationStatus,
    pub line_items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub order_id: Option<OrderId>,
}

impl From<Reservation> for ReservationView {
    fn from(reservation: Reservation) -> Self {
        Self {
            reservation_id: reservation.id,
            tenant_id: reservation.tenant_id,
            status: reservation.status,
            line_items: reservation.line_items,
            created_at: reservation.created_at,
            expires_at: reservation.expires_at,
            order_id: reservation.order_id,
        }
    }
}

#[derive(Serialize)]
pub struct ReleasedResponse {
    pub reservation_id: ReservationId,
    pub released: bool,
}

// -- Handlers --

/// POST /tenants/{tenant_id}/reservations: hold stock for a checkout.
///
/// Responds 201 for a new reservation, 200 when the idempotency key
/// matched a live one and 409 when any line is short.
#[tracing::instrument(skip(state, req))]
pub async fn create<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Path(tenant_id): Path<String>,
    Json(req): Json<ReserveRequest>,
) -> Result<Response, ApiError>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let tenant_id = TenantId::new(tenant_id);
    let outcome = state
        .reservations
        .reserve(&tenant_id, req.items, &req.idempotency_key)
        .await?;

    match outcome {
        ReserveOutcome::Reserved {
            reservation_id,
            expires_at,
            reused,
        } => {
            let status = if reused {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            let body = ReservedResponse {
                reservation_id,
                expires_at,
                reused,
            };
            Ok((status, Json(body)).into_response())
        }
        ReserveOutcome::Unavailable { items } => Ok(UnavailableResponse::conflict(items)),
    }
}

/// GET /tenants/{tenant_id}/reservations/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Path((tenant_id, id)): Path<(String, String)>,
) -> Result<Json<ReservationView>, ApiError>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let reservation = load_for_tenant(&state, &TenantId::new(tenant_id), &id).await?;
    Ok(Json(reservation.into()))
}

/// POST /tenants/{tenant_id}/reservations/{id}/release: abandon a checkout
/// and free its holds.
#[tracing::instrument(skip(state))]
pub async fn release<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Path((tenant_id, id)): Path<(String, String)>,
) -> Result<Json<ReleasedResponse>, ApiError>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let reservation = load_for_tenant(&state, &TenantId::new(tenant_id), &id).await?;
    state.reservations.release(reservation.id).await?;
    Ok(Json(ReleasedResponse {
        reservation_id: reservation.id,
        released: true,
    }))
}

/// Loads a reservation, answering 404 when it belongs to another tenant.
async fn load_for_tenant<S, L>(
    state: &AppState<S, L>,
    tenant_id: &TenantId,
    id: &str,
) -> Result<Reservation, ApiError>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let reservation_id = parse_reservation_id(id)?;
    let reservation = state.reservations.get(reservation_id).await?;
    if &reservation.tenant_id != tenant_id {
        tracing::warn!(%reservation_id, %tenant_id, "reservation requested by another tenant");
        return Err(ReservationError::NotFound(reservation_id).into());
    }
    Ok(reservation)
}
