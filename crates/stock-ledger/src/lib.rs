//! Durable stock ledger.
//!
//! The ledger holds the authoritative quantity-on-hand for every
//! (tenant, product) pair and the order records that consumed it. Stock is
//! only ever decremented inside a [`LedgerTransaction`] that also inserts the
//! order, so an observer never sees one without the other.

pub mod error;
pub mod ledger;
pub mod memory;
pub mod order;
pub mod postgres;

pub use error::{LedgerError, Result};
pub use ledger::{LedgerTransaction, StockLedger, StockLedgerExt, StockLevel};
pub use memory::{InMemoryLedgerTransaction, InMemoryStockLedger};
pub use order::{OrderLine, OrderRecord, ShippingAddress};
pub use postgres::{PostgresLedgerTransaction, PostgresStockLedger};
