//! Catalog lookup trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{Money, ProductId, TenantId};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Authoritative product data used to price an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    /// Informational only; the stock ledger is authoritative.
    pub current_stock: u32,
}

/// Trait for product lookups.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Loads a product. Fails with `NotFound` if it does not exist.
    async fn get_product(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<ProductInfo, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryCatalogState {
    products: HashMap<(TenantId, ProductId), ProductInfo>,
    fail_on_lookup: bool,
}

/// In-memory catalog for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<RwLock<InMemoryCatalogState>>,
}

impl InMemoryCatalog {
    /// Creates a new empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a product.
    pub fn upsert(&self, tenant_id: &TenantId, product: ProductInfo) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .products
            .insert((tenant_id.clone(), product.id.clone()), product);
    }

    /// Removes a product, as if it was deleted by an admin.
    pub fn remove(&self, tenant_id: &TenantId, product_id: &ProductId) -> Option<ProductInfo> {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .products
            .remove(&(tenant_id.clone(), product_id.clone()))
    }

    /// Makes every lookup fail as if the catalog were down.
    pub fn set_fail_on_lookup(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_lookup = fail;
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_product(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<ProductInfo, ServiceError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        if state.fail_on_lookup {
            return Err(ServiceError::Unavailable("catalog is down".to_string()));
        }

        state
            .products
            .get(&(tenant_id.clone(), product_id.clone()))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("product {product_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> ProductInfo {
        ProductInfo {
            id: ProductId::new("SKU-001"),
            name: "Widget".to_string(),
            price: Money::from_cents(1250),
            current_stock: 10,
        }
    }

    #[tokio::test]
    async fn test_lookup_is_tenant_scoped() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert(&TenantId::new("acme"), widget());

        let found = catalog
            .get_product(&TenantId::new("acme"), &ProductId::new("SKU-001"))
            .await
            .unwrap();
        assert_eq!(found, widget());

        let other = catalog
            .get_product(&TenantId::new("globex"), &ProductId::new("SKU-001"))
            .await;
        assert!(matches!(other, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_removed_product_is_not_found() {
        let catalog = InMemoryCatalog::new();
        let tenant = TenantId::new("acme");
        catalog.upsert(&tenant, widget());
        catalog.remove(&tenant, &ProductId::new("SKU-001"));

        assert!(matches!(
            catalog.get_product(&tenant, &ProductId::new("SKU-001")).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_on_lookup() {
        let catalog = InMemoryCatalog::new();
        let tenant = TenantId::new("acme");
        catalog.upsert(&tenant, widget());
        catalog.set_fail_on_lookup(true);

        assert!(matches!(
            catalog.get_product(&tenant, &ProductId::new("SKU-001")).await,
            Err(ServiceError::Unavailable(_))
        ));
    }
}
