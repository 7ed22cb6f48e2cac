//! Order totals.

use common::Money;
use serde::{Deserialize, Serialize};
use stock_ledger::OrderLine;

/// Shipping and currency settings for a storefront.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Charged when the subtotal is below the threshold.
    pub flat_shipping_fee: Money,
    /// Subtotal at or above which shipping is free.
    pub free_shipping_threshold: Money,
    pub currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            flat_shipping_fee: Money::from_cents(500),
            free_shipping_threshold: Money::from_cents(5000),
            currency: "USD".to_string(),
        }
    }
}

/// Price breakdown for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Money,
    pub shipping: Money,
    pub discount: Money,
    pub total: Money,
}

impl PricingConfig {
    /// Shipping fee for a subtotal.
    pub fn shipping_for(&self, subtotal: Money) -> Money {
        if subtotal >= self.free_shipping_threshold {
            Money::zero()
        } else {
            self.flat_shipping_fee
        }
    }

    /// Sums `lines` and applies shipping and `discount`.
    ///
    /// The discount is capped at the subtotal, so it never pays for shipping
    /// and the total is never negative. Shipping is decided on the
    /// undiscounted subtotal.
    pub fn totals(&self, lines: &[OrderLine], discount: Money) -> Totals {
        let subtotal: Money = lines.iter().map(OrderLine::line_total).sum();
        let shipping = self.shipping_for(subtotal);
        let discount = discount.max(Money::zero()).min(subtotal);
        Totals {
            subtotal,
            shipping,
            discount,
            total: subtotal - discount + shipping,
        }
    }
}
