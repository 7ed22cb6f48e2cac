use common::{OrderId, ProductId, ReservationId, TenantId};
use thiserror::Error;

/// Errors that can occur when interacting with the stock ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A decrement or adjustment would drive quantity-on-hand below zero.
    #[error(
        "Insufficient stock for {tenant_id}/{product_id}: requested {requested}, on hand {on_hand}"
    )]
    InsufficientStock {
        tenant_id: TenantId,
        product_id: ProductId,
        requested: u32,
        on_hand: u32,
    },

    /// No stock row exists for the product.
    #[error("No stock level recorded for {tenant_id}/{product_id}")]
    UnknownProduct {
        tenant_id: TenantId,
        product_id: ProductId,
    },

    /// An order already exists for the reservation, or the order ID is taken.
    #[error("Order {order_id} conflicts with an existing order for reservation {reservation_id}")]
    DuplicateOrder {
        order_id: OrderId,
        reservation_id: ReservationId,
    },

    /// The ledger could not complete the operation (connection loss, aborted commit).
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
