//! Inventory reservation for concurrent checkouts.
//!
//! A reservation soft-holds stock for a short time while an order is being
//! placed. Holds live in a fast, TTL-capable [`ReservationStore`]; the
//! authoritative quantity-on-hand lives in the durable
//! [`StockLedger`](stock_ledger::StockLedger).
//!
//! Lifecycle:
//! 1. [`ReservationManager::reserve`] checks availability per product under a
//!    short-lived product lock and writes holds.
//! 2. [`ReservationManager::commit`] deducts the held quantities inside the
//!    caller's ledger transaction; [`ReservationManager::finish_commit`]
//!    drops the holds once that transaction is durable.
//! 3. [`ReservationManager::release`] drops the holds on abort.
//! 4. [`ExpirySweeper`] expires holds nobody committed or released.

pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod state;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReservationConfig;
pub use error::{ReservationError, Result};
pub use manager::{PendingCommit, ReservationManager};
pub use model::{Hold, LineItem, ProductLock, Reservation, ReserveOutcome, UnavailableItem};
pub use state::ReservationStatus;
pub use store::{InMemoryReservationStore, RedisReservationStore, ReservationStore};
pub use sweeper::ExpirySweeper;
