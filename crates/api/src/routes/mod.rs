//! HTTP route handlers and the state they share.

pub mod orders;
pub mod reservations;
pub mod stock;
pub mod system;

use std::sync::Arc;

use checkout::{
    InMemoryCartStore, InMemoryCatalog, InMemoryCouponValidator, InMemoryDispatcher,
    OrderPlacementService,
};
use common::{OrderId, ReservationId};
use reservation::{ReservationManager, ReservationStore};
use stock_ledger::StockLedger;

use crate::error::ApiError;

/// The placement service as wired by this server: in-memory collaborators
/// in front of configurable reservation and ledger backends.
pub type PlacementService<S, L> = OrderPlacementService<
    S,
    L,
    InMemoryCatalog,
    InMemoryCouponValidator,
    InMemoryCartStore,
    InMemoryDispatcher,
>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: ReservationStore, L: StockLedger> {
    pub reservations: Arc<ReservationManager<S, L>>,
    pub placement: PlacementService<S, L>,
    /// Same catalog the placement service prices from.
    pub catalog: InMemoryCatalog,
    pub coupons: InMemoryCouponValidator,
    pub carts: InMemoryCartStore,
    pub dispatcher: InMemoryDispatcher,
}

pub(crate) fn parse_reservation_id(id: &str) -> Result<ReservationId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid reservation ID: {e}")))
}

pub(crate) fn parse_order_id(id: &str) -> Result<OrderId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid order ID: {e}")))
}
