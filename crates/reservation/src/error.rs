//! Reservation error types.

use common::{ProductId, ReservationId, TenantId};
use stock_ledger::LedgerError;
use thiserror::Error;

use crate::state::ReservationStatus;

/// Errors that can occur during reservation operations.
///
/// Insufficient stock is not an error; see
/// [`ReserveOutcome::Unavailable`](crate::ReserveOutcome::Unavailable).
#[derive(Debug, Error)]
pub enum ReservationError {
    /// The request itself is malformed.
    #[error("Invalid reservation request: {0}")]
    InvalidRequest(String),

    /// The product lock could not be taken within the retry budget.
    #[error("Product {tenant_id}/{product_id} is busy after {attempts} lock attempts")]
    Contention {
        tenant_id: TenantId,
        product_id: ProductId,
        attempts: u32,
    },

    /// Another request with the same idempotency key is still reserving.
    #[error("A reservation for idempotency key '{idempotency_key}' is still in progress")]
    KeyInFlight { idempotency_key: String },

    /// The reservation does not exist or has already expired.
    #[error("Reservation not found: {0}")]
    NotFound(ReservationId),

    /// The reservation was already committed or released, or is being committed.
    #[error("Reservation {reservation_id} is already {status}")]
    AlreadyTerminal {
        reservation_id: ReservationId,
        status: ReservationStatus,
    },

    /// The durable ledger rejected or failed an operation.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The reservation store could not be reached.
    #[error("Reservation store error: {0}")]
    Store(#[from] redis::RedisError),

    /// A stored record could not be decoded.
    #[error("Corrupt reservation record: {0}")]
    Corrupt(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReservationError {
    /// Returns true if the caller may retry the same request after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReservationError::Contention { .. } | ReservationError::KeyInFlight { .. }
        )
    }

    /// Returns true for stale-reservation faults: the caller referenced a
    /// reservation that is gone or finished.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            ReservationError::NotFound(_) | ReservationError::AlreadyTerminal { .. }
        )
    }
}

/// Convenience type alias for reservation results.
pub type Result<T> = std::result::Result<T, ReservationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_errors_are_retryable() {
        let contention = ReservationError::Contention {
            tenant_id: TenantId::new("acme"),
            product_id: ProductId::new("SKU-001"),
            attempts: 51,
        };
        assert!(contention.is_retryable());
        assert!(!contention.is_stale());

        let stale = ReservationError::AlreadyTerminal {
            reservation_id: ReservationId::new(),
            status: ReservationStatus::Committed,
        };
        assert!(!stale.is_retryable());
        assert!(stale.is_stale());
        assert!(ReservationError::NotFound(ReservationId::new()).is_stale());

        let in_flight = ReservationError::KeyInFlight {
            idempotency_key: "checkout-1".to_string(),
        };
        assert!(in_flight.is_retryable());
        assert!(!in_flight.is_stale());
    }
}
