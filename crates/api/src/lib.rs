//! HTTP API server for storefront inventory reservations.
//!
//! Exposes reservation, order placement and stock endpoints per tenant,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use checkout::{
    Dispatchers, InMemoryCartStore, InMemoryCatalog, InMemoryCouponValidator, InMemoryDispatcher,
    OrderPlacementService, PricingConfig,
};
use metrics_exporter_prometheus::PrometheusHandle;
use reservation::{ReservationConfig, ReservationManager, ReservationStore};
use stock_ledger::StockLedger;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, L>(state: Arc<AppState<S, L>>, metrics_handle: PrometheusHandle) -> Router
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::system::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::system::health))
        .route(
            "/tenants/{tenant_id}/reservations",
            post(routes::reservations::create::<S, L>),
        )
        .route(
            "/tenants/{tenant_id}/reservations/{id}",
            get(routes::reservations::get::<S, L>),
        )
        .route(
            "/tenants/{tenant_id}/reservations/{id}/release",
            post(routes::reservations::release::<S, L>),
        )
        .route(
            "/tenants/{tenant_id}/orders",
            post(routes::orders::place::<S, L>),
        )
        .route(
            "/tenants/{tenant_id}/orders/{order_id}",
            get(routes::orders::get::<S, L>),
        )
        .route(
            "/tenants/{tenant_id}/stock/{product_id}",
            get(routes::stock::get::<S, L>).put(routes::stock::set::<S, L>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the reservation manager and order placement service over the given
/// backends, with in-memory catalog, coupon, cart and dispatch collaborators.
pub fn create_state<S, L>(
    store: S,
    ledger: L,
    reservation_config: ReservationConfig,
    pricing: PricingConfig,
) -> Arc<AppState<S, L>>
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let reservations = Arc::new(ReservationManager::new(store, ledger, reservation_config));

    let catalog = InMemoryCatalog::new();
    let coupons = InMemoryCouponValidator::new();
    let carts = InMemoryCartStore::new();
    let dispatcher = InMemoryDispatcher::new();

    let placement = OrderPlacementService::new(
        reservations.clone(),
        catalog.clone(),
        coupons.clone(),
        carts.clone(),
        Dispatchers::new(dispatcher.clone(), dispatcher.clone(), dispatcher.clone()),
        pricing,
    );

    Arc::new(AppState {
        reservations,
        placement,
        catalog,
        coupons,
        carts,
        dispatcher,
    })
}
