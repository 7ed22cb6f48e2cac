//! Coupon validation trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, TenantId};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Outcome of validating a coupon against an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouponDecision {
    Valid { discount: Money },
    Invalid { reason: String },
}

/// Trait for coupon validation.
#[async_trait]
pub trait CouponValidator: Send + Sync {
    /// Checks a code against the coupon's own constraints for this subtotal.
    async fn validate(
        &self,
        tenant_id: &TenantId,
        code: &str,
        subtotal: Money,
    ) -> Result<CouponDecision, ServiceError>;

    /// Counts one use of a coupon after its order committed.
    async fn redeem(&self, _tenant_id: &TenantId, _code: &str) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// How a coupon reduces the subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CouponKind {
    /// Whole percent of the subtotal, at most 100.
    Percent(u8),
    Fixed(Money),
}

/// A coupon and its constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub kind: CouponKind,
    pub min_order_value: Money,
    pub usage_cap: Option<u32>,
    pub times_used: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Coupon {
    pub fn percent(code: impl Into<String>, percent: u8) -> Self {
        Self::new(code, CouponKind::Percent(percent.min(100)))
    }

    pub fn fixed(code: impl Into<String>, amount: Money) -> Self {
        Self::new(code, CouponKind::Fixed(amount))
    }

    fn new(code: impl Into<String>, kind: CouponKind) -> Self {
        Self {
            code: code.into(),
            kind,
            min_order_value: Money::zero(),
            usage_cap: None,
            times_used: 0,
            expires_at: None,
        }
    }

    pub fn with_min_order_value(mut self, min: Money) -> Self {
        self.min_order_value = min;
        self
    }

    pub fn with_usage_cap(mut self, cap: u32) -> Self {
        self.usage_cap = Some(cap);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Applies the coupon's constraints to an order subtotal.
    pub fn evaluate(&self, subtotal: Money, now: DateTime<Utc>) -> CouponDecision {
        if self.expires_at.is_some_and(|at| at <= now) {
            return CouponDecision::Invalid {
                reason: "coupon has expired".to_string(),
            };
        }
        if self.usage_cap.is_some_and(|cap| self.times_used >= cap) {
            return CouponDecision::Invalid {
                reason: "coupon usage limit reached".to_string(),
            };
        }
        if subtotal < self.min_order_value {
            return CouponDecision::Invalid {
                reason: format!("order must be at least {}", self.min_order_value),
            };
        }

        let discount = match self.kind {
            CouponKind::Percent(percent) => {
                Money::from_cents(subtotal.cents() * i64::from(percent.min(100)) / 100)
            }
            CouponKind::Fixed(amount) => amount,
        };
        CouponDecision::Valid { discount }
    }
}

#[derive(Debug, Default)]
struct InMemoryCouponState {
    coupons: HashMap<(TenantId, String), Coupon>,
}

/// In-memory coupon book. Codes are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCouponValidator {
    state: Arc<RwLock<InMemoryCouponState>>,
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

impl InMemoryCouponValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a coupon.
    pub fn insert(&self, tenant_id: &TenantId, coupon: Coupon) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .coupons
            .insert((tenant_id.clone(), normalize_code(&coupon.code)), coupon);
    }

    /// Returns how often a coupon has been redeemed.
    pub fn times_used(&self, tenant_id: &TenantId, code: &str) -> Option<u32> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .coupons
            .get(&(tenant_id.clone(), normalize_code(code)))
            .map(|c| c.times_used)
    }
}

#[async_trait]
impl CouponValidator for InMemoryCouponValidator {
    async fn validate(
        &self,
        tenant_id: &TenantId,
        code: &str,
        subtotal: Money,
    ) -> Result<CouponDecision, ServiceError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(
            match state.coupons.get(&(tenant_id.clone(), normalize_code(code))) {
                Some(coupon) => coupon.evaluate(subtotal, Utc::now()),
                None => CouponDecision::Invalid {
                    reason: "unknown coupon".to_string(),
                },
            },
        )
    }

    async fn redeem(&self, tenant_id: &TenantId, code: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let coupon = state
            .coupons
            .get_mut(&(tenant_id.clone(), normalize_code(code)))
            .ok_or_else(|| ServiceError::NotFound(format!("coupon {code}")))?;
        coupon.times_used += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    #[tokio::test]
    async fn test_percent_coupon() {
        let coupons = InMemoryCouponValidator::new();
        coupons.insert(&tenant(), Coupon::percent("SAVE10", 10));

        let decision = coupons
            .validate(&tenant(), "save10", Money::from_cents(4550))
            .await
            .unwrap();
        assert_eq!(
            decision,
            CouponDecision::Valid {
                discount: Money::from_cents(455)
            }
        );
    }

    #[tokio::test]
    async fn test_minimum_order_value() {
        let coupons = InMemoryCouponValidator::new();
        coupons.insert(
            &tenant(),
            Coupon::fixed("FIVE", Money::from_cents(500)).with_min_order_value(Money::from_cents(2000)),
        );

        let below = coupons
            .validate(&tenant(), "FIVE", Money::from_cents(1999))
            .await
            .unwrap();
        assert!(matches!(below, CouponDecision::Invalid { .. }));

        let at = coupons
            .validate(&tenant(), "FIVE", Money::from_cents(2000))
            .await
            .unwrap();
        assert_eq!(
            at,
            CouponDecision::Valid {
                discount: Money::from_cents(500)
            }
        );
    }

    #[tokio::test]
    async fn test_usage_cap_and_redeem() {
        let coupons = InMemoryCouponValidator::new();
        coupons.insert(&tenant(), Coupon::percent("ONCE", 50).with_usage_cap(1));

        coupons.redeem(&tenant(), "ONCE").await.unwrap();
        assert_eq!(coupons.times_used(&tenant(), "once"), Some(1));

        let decision = coupons
            .validate(&tenant(), "ONCE", Money::from_cents(1000))
            .await
            .unwrap();
        assert!(matches!(decision, CouponDecision::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_expired_and_unknown_coupons() {
        let coupons = InMemoryCouponValidator::new();
        coupons.insert(
            &tenant(),
            Coupon::percent("OLD", 20).with_expiry(Utc::now() - chrono::Duration::days(1)),
        );

        for code in ["OLD", "NOPE"] {
            let decision = coupons
                .validate(&tenant(), code, Money::from_cents(1000))
                .await
                .unwrap();
            assert!(matches!(decision, CouponDecision::Invalid { .. }), "{code}");
        }
    }
}
