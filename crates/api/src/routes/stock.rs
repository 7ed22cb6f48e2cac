//! Stock level endpoints: availability reads and manual stock-takes.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use checkout::ProductInfo;
use common::{Money, ProductId, TenantId};
use reservation::ReservationStore;
use serde::{Deserialize, Serialize};
use stock_ledger::StockLedger;

use super::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct SetStockRequest {
    pub quantity: u32,
    /// Catalog name; registered together with `price_cents`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price_cents: Option<i64>,
}

#[derive(Serialize)]
pub struct StockResponse {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub quantity_on_hand: u32,
    /// On hand minus live holds.
    pub available: u32,
}

async fn stock_view<S, L>(
    state: &AppState<S, L>,
    tenant_id: TenantId,
    product_id: ProductId,
) -> Result<StockResponse, ApiError>
where
    S: ReservationStore,
    L: StockLedger,
{
    let level = state
        .reservations
        .ledger()
        .stock_level(&tenant_id, &product_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("No stock recorded for {tenant_id}/{product_id}"))
        })?;
    let available = state.reservations.available(&tenant_id, &product_id).await?;

    Ok(StockResponse {
        tenant_id,
        product_id,
        quantity_on_hand: level.quantity_on_hand,
        available,
    })
}

/// GET /tenants/{tenant_id}/stock/{product_id}
#[tracing::instrument(skip(state))]
pub async fn get<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Path((tenant_id, product_id)): Path<(String, String)>,
) -> Result<Json<StockResponse>, ApiError>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let view = stock_view(&state, TenantId::new(tenant_id), ProductId::new(product_id)).await?;
    Ok(Json(view))
}

/// PUT /tenants/{tenant_id}/stock/{product_id}: set quantity-on-hand.
///
/// When `name` and `price_cents` are present the product is also
/// registered in the catalog so it can be ordered.
#[tracing::instrument(skip(state, req))]
pub async fn set<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Path((tenant_id, product_id)): Path<(String, String)>,
    Json(req): Json<SetStockRequest>,
) -> Result<Json<StockResponse>, ApiError>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let tenant_id = TenantId::new(tenant_id);
    let product_id = ProductId::new(product_id);

    let listing = match (req.name, req.price_cents) {
        (Some(name), Some(cents)) if cents >= 0 && !name.trim().is_empty() => {
            Some((name, Money::from_cents(cents)))
        }
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "name and a non-negative price_cents must be given together".to_string(),
            ));
        }
    };

    state
        .reservations
        .ledger()
        .set_quantity(&tenant_id, &product_id, req.quantity)
        .await?;

    if let Some((name, price)) = listing {
        state.catalog.upsert(
            &tenant_id,
            ProductInfo {
                id: product_id.clone(),
                name,
                price,
                current_stock: req.quantity,
            },
        );
    }

    tracing::info!(%tenant_id, %product_id, quantity = req.quantity, "stock level set");

    let view = stock_view(&state, tenant_id, product_id).await?;
    Ok(Json(view))
}
