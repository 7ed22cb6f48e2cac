//! Durable order records written alongside stock deductions.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, ProductId, ReservationId, TenantId, UserId};
use serde::{Deserialize, Serialize};

/// One priced line of a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    /// Product name as read from the catalog at placement time.
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderLine {
    /// Returns `quantity * unit_price`.
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// Destination for a placed order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub recipient: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
}

/// An order as persisted in the ledger.
///
/// Created exactly once, in the same transaction as the stock deductions for
/// its lines, and never modified afterwards. Each reservation backs at most
/// one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub reservation_id: ReservationId,
    pub lines: Vec<OrderLine>,
    pub subtotal: Money,
    pub shipping: Money,
    pub discount: Money,
    pub total: Money,
    pub coupon_code: Option<String>,
    pub shipping_address: ShippingAddress,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Total number of units across all lines.
    pub fn unit_count(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.quantity)).sum()
    }
}
