//! Shared identifiers and value types used across the inventory crates.

pub mod money;
pub mod types;

pub use money::Money;
pub use types::{OrderId, ProductId, ReservationId, TenantId, UserId};
