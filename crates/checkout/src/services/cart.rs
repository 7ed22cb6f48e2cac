//! Cart store trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{TenantId, UserId};
use reservation::LineItem;

use crate::error::ServiceError;

/// Trait for the shopper's active cart.
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Empties the shopper's cart. Called only after an order committed.
    async fn clear(&self, user_id: &UserId, tenant_id: &TenantId) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryCartState {
    carts: HashMap<(TenantId, UserId), Vec<LineItem>>,
    fail_on_clear: bool,
}

/// In-memory cart store for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCartStore {
    state: Arc<RwLock<InMemoryCartState>>,
}

impl InMemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, user_id: &UserId, tenant_id: &TenantId, item: LineItem) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .carts
            .entry((tenant_id.clone(), user_id.clone()))
            .or_default()
            .push(item);
    }

    /// Returns the items in a shopper's cart.
    pub fn items(&self, user_id: &UserId, tenant_id: &TenantId) -> Vec<LineItem> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .carts
            .get(&(tenant_id.clone(), user_id.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Configures the store to fail on clear calls.
    pub fn set_fail_on_clear(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_clear = fail;
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn clear(&self, user_id: &UserId, tenant_id: &TenantId) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.fail_on_clear {
            return Err(ServiceError::Unavailable("cart store is down".to_string()));
        }

        state.carts.remove(&(tenant_id.clone(), user_id.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clear_only_touches_one_cart() {
        let carts = InMemoryCartStore::new();
        let tenant = TenantId::new("acme");
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        carts.add_item(&alice, &tenant, LineItem::new("SKU-001", 1));
        carts.add_item(&bob, &tenant, LineItem::new("SKU-002", 2));

        carts.clear(&alice, &tenant).await.unwrap();

        assert!(carts.items(&alice, &tenant).is_empty());
        assert_eq!(carts.items(&bob, &tenant).len(), 1);
    }

    #[tokio::test]
    async fn test_fail_on_clear_keeps_items() {
        let carts = InMemoryCartStore::new();
        let tenant = TenantId::new("acme");
        let alice = UserId::new("alice");
        carts.add_item(&alice, &tenant, LineItem::new("SKU-001", 1));
        carts.set_fail_on_clear(true);

        assert!(carts.clear(&alice, &tenant).await.is_err());
        assert_eq!(carts.items(&alice, &tenant).len(), 1);
    }
}
