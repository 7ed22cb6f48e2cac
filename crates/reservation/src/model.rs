//! Reservation records, holds and locks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReservationError, Result};
use crate::state::ReservationStatus;

/// A requested (product, quantity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl LineItem {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }

    /// Validates a request and merges duplicate products.
    ///
    /// The result is sorted by ascending product ID, which is the global
    /// lock acquisition order.
    pub fn normalize(items: Vec<LineItem>) -> Result<Vec<LineItem>> {
        if items.is_empty() {
            return Err(ReservationError::InvalidRequest(
                "at least one line item is required".to_string(),
            ));
        }

        let mut merged: BTreeMap<ProductId, u32> = BTreeMap::new();
        for item in items {
            if item.quantity == 0 {
                return Err(ReservationError::InvalidRequest(format!(
                    "quantity for {} must be greater than 0",
                    item.product_id
                )));
            }
            let total = merged.entry(item.product_id.clone()).or_default();
            *total = total.checked_add(item.quantity).ok_or_else(|| {
                ReservationError::InvalidRequest(format!(
                    "quantity for {} is too large",
                    item.product_id
                ))
            })?;
        }

        Ok(merged
            .into_iter()
            .map(|(product_id, quantity)| LineItem {
                product_id,
                quantity,
            })
            .collect())
    }
}

/// A group of soft-holds created by one checkout attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub idempotency_key: String,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Sorted by product ID, one entry per product.
    pub line_items: Vec<LineItem>,
    /// Set once the reservation is committed.
    pub order_id: Option<OrderId>,
}

impl Reservation {
    /// Returns true while the reservation still holds stock.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Held && self.expires_at > now
    }

    /// Products covered by this reservation.
    pub fn product_ids(&self) -> Vec<ProductId> {
        self.line_items
            .iter()
            .map(|item| item.product_id.clone())
            .collect()
    }

    /// Held quantity for one product, zero if not covered.
    pub fn quantity_of(&self, product_id: &ProductId) -> u32 {
        self.line_items
            .iter()
            .filter(|item| &item.product_id == product_id)
            .map(|item| item.quantity)
            .sum()
    }
}

/// One reservation's claim on one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub reservation_id: ReservationId,
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
}

impl Hold {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Mutual-exclusion entry for one product's availability check.
///
/// The token identifies this acquisition so that only the owner can
/// release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductLock {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub token: Uuid,
}

impl ProductLock {
    pub fn new(tenant_id: TenantId, product_id: ProductId) -> Self {
        Self {
            tenant_id,
            product_id,
            token: Uuid::new_v4(),
        }
    }
}

/// A product that could not be held in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableItem {
    pub product_id: ProductId,
    pub requested: u32,
    /// Units that were available to sell at check time.
    pub available: u32,
}

/// Result of a reserve call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Every line is held.
    Reserved {
        reservation_id: ReservationId,
        expires_at: DateTime<Utc>,
        /// True if an existing hold for the same idempotency key was returned.
        reused: bool,
    },
    /// At least one line could not be held; nothing is held.
    Unavailable { items: Vec<UnavailableItem> },
}

impl ReserveOutcome {
    /// Returns the reservation ID if the reservation succeeded.
    pub fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            ReserveOutcome::Reserved { reservation_id, .. } => Some(*reservation_id),
            ReserveOutcome::Unavailable { .. } => None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, ReserveOutcome::Reserved { .. })
    }
}
