//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::PlacementError;
use reservation::ReservationError;
use stock_ledger::LedgerError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Product locks stayed busy; the client should retry shortly.
    Busy,
    /// Reservation manager error.
    Reservation(ReservationError),
    /// Order placement error.
    Placement(PlacementError),
    /// Stock ledger error.
    Ledger(LedgerError),
    /// Internal server error.
    Internal(String),
}

const BUSY_MESSAGE: &str = "inventory is busy, please retry";
const INTERNAL_MESSAGE: &str = "internal error";

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Busy => (StatusCode::SERVICE_UNAVAILABLE, BUSY_MESSAGE.to_string()),
            ApiError::Reservation(err) => reservation_error_to_response(err),
            ApiError::Placement(err) => placement_error_to_response(err),
            ApiError::Ledger(err) => ledger_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE.to_string())
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn reservation_error_to_response(err: ReservationError) -> (StatusCode, String) {
    match err {
        ReservationError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        ReservationError::Contention { .. } | ReservationError::KeyInFlight { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, BUSY_MESSAGE.to_string())
        }
        ReservationError::NotFound(reservation_id) => {
            tracing::error!(%reservation_id, "stale reservation: not found or expired");
            (
                StatusCode::NOT_FOUND,
                "reservation not found or expired".to_string(),
            )
        }
        ReservationError::AlreadyTerminal {
            reservation_id,
            status,
        } => {
            tracing::error!(%reservation_id, %status, "stale reservation: already finished");
            (
                StatusCode::CONFLICT,
                "reservation is no longer active".to_string(),
            )
        }
        ReservationError::Ledger(err) => ledger_error_to_response(err),
        other => {
            tracing::error!(error = %other, "reservation backend failure");
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE.to_string())
        }
    }
}

fn placement_error_to_response(err: PlacementError) -> (StatusCode, String) {
    match err {
        PlacementError::InvalidAddress(_) | PlacementError::InvalidCoupon { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        PlacementError::ProductUnavailable(_) | PlacementError::AlreadyPlaced(_) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        PlacementError::OrderNotPlaced(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "order could not be placed".to_string(),
        ),
        PlacementError::Reservation(err) => reservation_error_to_response(err),
    }
}

fn ledger_error_to_response(err: LedgerError) -> (StatusCode, String) {
    match err {
        LedgerError::InsufficientStock { .. } | LedgerError::DuplicateOrder { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        LedgerError::UnknownProduct { .. } => (StatusCode::NOT_FOUND, err.to_string()),
        other => {
            tracing::error!(error = %other, "stock ledger failure");
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE.to_string())
        }
    }
}

impl From<ReservationError> for ApiError {
    fn from(err: ReservationError) -> Self {
        ApiError::Reservation(err)
    }
}

impl From<PlacementError> for ApiError {
    fn from(err: PlacementError) -> Self {
        ApiError::Placement(err)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}
