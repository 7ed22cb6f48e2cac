use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId, TenantId};
use serde::{Deserialize, Serialize};

use crate::{OrderRecord, Result};

/// Authoritative quantity-on-hand for one product of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub quantity_on_hand: u32,
    pub updated_at: DateTime<Utc>,
}

/// A unit of durable work against the ledger.
///
/// Nothing staged in a transaction is visible to other readers until
/// [`commit`](LedgerTransaction::commit) succeeds. Dropping a transaction
/// without committing rolls it back.
#[async_trait]
pub trait LedgerTransaction: Send + Sized {
    /// Atomically decrements quantity-on-hand by `quantity`.
    ///
    /// Fails with `InsufficientStock` instead of going negative.
    /// Returns the remaining quantity as seen by this transaction.
    async fn decrement_stock(
        &mut self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<u32>;

    /// Inserts an order with its lines.
    ///
    /// Fails with `DuplicateOrder` if the order ID or its reservation is
    /// already used by another order.
    async fn insert_order(&mut self, order: &OrderRecord) -> Result<()>;

    /// Makes all staged changes durable and visible at once.
    async fn commit(self) -> Result<()>;

    /// Discards all staged changes.
    async fn rollback(self) -> Result<()>;
}

/// Durable, transactional store of stock levels and orders.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StockLedger: Send + Sync {
    type Transaction: LedgerTransaction + 'static;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Transaction>;

    /// Reads the committed stock level, or None if the product has none.
    async fn stock_level(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<Option<StockLevel>>;

    /// Sets quantity-on-hand to an absolute value (stock-take).
    async fn set_quantity(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<StockLevel>;

    /// Applies a signed manual adjustment.
    ///
    /// Fails with `InsufficientStock` if the result would be negative and with
    /// `UnknownProduct` if the product has no stock row.
    async fn adjust_quantity(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        delta: i64,
    ) -> Result<StockLevel>;

    /// Loads a committed order.
    async fn get_order(&self, tenant_id: &TenantId, order_id: OrderId)
    -> Result<Option<OrderRecord>>;

    /// Loads the order built from a reservation, if one was committed.
    async fn order_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<OrderRecord>>;
}

/// Extension trait providing convenience methods for ledgers.
#[async_trait]
pub trait StockLedgerExt: StockLedger {
    /// Committed quantity-on-hand, treating an unknown product as zero.
    async fn quantity_on_hand(&self, tenant_id: &TenantId, product_id: &ProductId) -> Result<u32> {
        Ok(self
            .stock_level(tenant_id, product_id)
            .await?
            .map(|level| level.quantity_on_hand)
            .unwrap_or(0))
    }
}

// Blanket implementation for all StockLedger implementations
impl<T: StockLedger + ?Sized> StockLedgerExt for T {}
