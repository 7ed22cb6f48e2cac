use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::{OrderId, ProductId, ReservationId, TenantId};
use tokio::sync::RwLock;

use crate::{
    LedgerError, OrderRecord, Result,
    ledger::{LedgerTransaction, StockLedger, StockLevel},
};

type StockKey = (TenantId, ProductId);

#[derive(Default)]
struct LedgerState {
    stock: HashMap<StockKey, StockLevel>,
    orders: HashMap<OrderId, OrderRecord>,
}

impl LedgerState {
    fn on_hand(&self, key: &StockKey) -> Option<u32> {
        self.stock.get(key).map(|level| level.quantity_on_hand)
    }

    fn check_order(&self, order: &OrderRecord) -> Result<()> {
        let conflict = self.orders.contains_key(&order.order_id)
            || self
                .orders
                .values()
                .any(|o| o.reservation_id == order.reservation_id);
        if conflict {
            return Err(LedgerError::DuplicateOrder {
                order_id: order.order_id,
                reservation_id: order.reservation_id,
            });
        }
        Ok(())
    }
}

/// In-memory stock ledger for testing and single-process runs.
///
/// Transactions stage their writes and apply them under one write lock on
/// commit, re-validating every decrement against the then-current stock, so
/// two transactions can never jointly oversell a product.
#[derive(Clone, Default)]
pub struct InMemoryStockLedger {
    state: Arc<RwLock<LedgerState>>,
    fail_on_commit: Arc<AtomicBool>,
}

impl InMemoryStockLedger {
    /// Creates a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures every subsequent commit to fail as if the database aborted it.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of committed orders.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Returns all committed orders for a tenant.
    pub async fn orders_for_tenant(&self, tenant_id: &TenantId) -> Vec<OrderRecord> {
        self.state
            .read()
            .await
            .orders
            .values()
            .filter(|o| &o.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

/// Staged writes of an [`InMemoryStockLedger`] transaction.
pub struct InMemoryLedgerTransaction {
    state: Arc<RwLock<LedgerState>>,
    fail_on_commit: Arc<AtomicBool>,
    decrements: Vec<(StockKey, u32)>,
    orders: Vec<OrderRecord>,
}

impl InMemoryLedgerTransaction {
    fn staged_decrement(&self, key: &StockKey) -> u32 {
        self.decrements
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, qty)| *qty)
            .sum()
    }
}

#[async_trait]
impl LedgerTransaction for InMemoryLedgerTransaction {
    async fn decrement_stock(
        &mut self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<u32> {
        let key = (tenant_id.clone(), product_id.clone());
        let on_hand = self
            .state
            .read()
            .await
            .on_hand(&key)
            .ok_or_else(|| LedgerError::UnknownProduct {
                tenant_id: tenant_id.clone(),
                product_id: product_id.clone(),
            })?;

        let visible = on_hand.saturating_sub(self.staged_decrement(&key));
        if visible < quantity {
            return Err(LedgerError::InsufficientStock {
                tenant_id: tenant_id.clone(),
                product_id: product_id.clone(),
                requested: quantity,
                on_hand: visible,
            });
        }

        self.decrements.push((key, quantity));
        Ok(visible - quantity)
    }

    async fn insert_order(&mut self, order: &OrderRecord) -> Result<()> {
        self.state.read().await.check_order(order)?;
        if self
            .orders
            .iter()
            .any(|o| o.order_id == order.order_id || o.reservation_id == order.reservation_id)
        {
            return Err(LedgerError::DuplicateOrder {
                order_id: order.order_id,
                reservation_id: order.reservation_id,
            });
        }
        self.orders.push(order.clone());
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        if self.fail_on_commit.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable(
                "transaction aborted before commit".to_string(),
            ));
        }

        let mut state = self.state.write().await;

        // Validate everything before applying anything.
        let mut totals: HashMap<&StockKey, u32> = HashMap::new();
        for (key, qty) in &self.decrements {
            *totals.entry(key).or_default() += qty;
        }
        for (key, requested) in &totals {
            let on_hand = state.on_hand(key).unwrap_or(0);
            if on_hand < *requested {
                return Err(LedgerError::InsufficientStock {
                    tenant_id: key.0.clone(),
                    product_id: key.1.clone(),
                    requested: *requested,
                    on_hand,
                });
            }
        }
        for order in &self.orders {
            state.check_order(order)?;
        }

        let now = Utc::now();
        for (key, requested) in totals {
            if let Some(level) = state.stock.get_mut(key) {
                level.quantity_on_hand -= requested;
                level.updated_at = now;
            }
        }
        for order in self.orders {
            state.orders.insert(order.order_id, order);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    type Transaction = InMemoryLedgerTransaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        Ok(InMemoryLedgerTransaction {
            state: self.state.clone(),
            fail_on_commit: self.fail_on_commit.clone(),
            decrements: Vec::new(),
            orders: Vec::new(),
        })
    }

    async fn stock_level(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<Option<StockLevel>> {
        let key = (tenant_id.clone(), product_id.clone());
        Ok(self.state.read().await.stock.get(&key).cloned())
    }

    async fn set_quantity(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<StockLevel> {
        let level = StockLevel {
            tenant_id: tenant_id.clone(),
            product_id: product_id.clone(),
            quantity_on_hand: quantity,
            updated_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .stock
            .insert((tenant_id.clone(), product_id.clone()), level.clone());
        Ok(level)
    }

    async fn adjust_quantity(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        delta: i64,
    ) -> Result<StockLevel> {
        let mut state = self.state.write().await;
        let level = state
            .stock
            .get_mut(&(tenant_id.clone(), product_id.clone()))
            .ok_or_else(|| LedgerError::UnknownProduct {
                tenant_id: tenant_id.clone(),
                product_id: product_id.clone(),
            })?;

        let adjusted = i64::from(level.quantity_on_hand) + delta;
        let new_quantity = u32::try_from(adjusted).map_err(|_| LedgerError::InsufficientStock {
            tenant_id: tenant_id.clone(),
            product_id: product_id.clone(),
            requested: u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX),
            on_hand: level.quantity_on_hand,
        })?;

        level.quantity_on_hand = new_quantity;
        level.updated_at = Utc::now();
        Ok(level.clone())
    }

    async fn get_order(
        &self,
        tenant_id: &TenantId,
        order_id: OrderId,
    ) -> Result<Option<OrderRecord>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .get(&order_id)
            .filter(|o| &o.tenant_id == tenant_id)
            .cloned())
    }

    async fn order_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<OrderRecord>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .find(|o| o.reservation_id == reservation_id)
            .cloned())
    }
}
