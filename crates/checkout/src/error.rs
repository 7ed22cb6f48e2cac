//! Order placement error types.

use common::{ProductId, ReservationId};
use reservation::ReservationError;
use thiserror::Error;

/// Errors returned by external collaborators (catalog, coupons, cart, dispatch).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The collaborator could not be reached or refused the call.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Errors that end an order placement without an order.
///
/// Out-of-stock and lock contention are not errors; see
/// [`PlacementOutcome`](crate::PlacementOutcome).
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The shipping address is incomplete or malformed.
    #[error("Invalid shipping address: {0}")]
    InvalidAddress(String),

    /// The coupon does not apply to this order.
    #[error("Coupon {code} cannot be applied: {reason}")]
    InvalidCoupon { code: String, reason: String },

    /// A reserved product disappeared from the catalog before pricing.
    #[error("Product {0} is no longer available")]
    ProductUnavailable(ProductId),

    /// A concurrent submission with the same idempotency key placed the order.
    #[error("An order for reservation {0} was already placed")]
    AlreadyPlaced(ReservationId),

    /// The durable write failed; nothing was deducted and no order exists.
    #[error("Order could not be placed: {0}")]
    OrderNotPlaced(String),

    /// Reservation error, including malformed requests and stale reservations.
    #[error("Reservation error: {0}")]
    Reservation(#[from] ReservationError),
}

impl PlacementError {
    /// Returns true if the shopper can fix the request and try again.
    pub fn is_client_error(&self) -> bool {
        match self {
            PlacementError::InvalidAddress(_)
            | PlacementError::InvalidCoupon { .. }
            | PlacementError::ProductUnavailable(_)
            | PlacementError::AlreadyPlaced(_) => true,
            PlacementError::Reservation(e) => {
                matches!(e, ReservationError::InvalidRequest(_))
            }
            PlacementError::OrderNotPlaced(_) => false,
        }
    }
}

/// Convenience type alias for placement results.
pub type Result<T> = std::result::Result<T, PlacementError>;
