//! Order placement orchestrator.

use std::sync::Arc;

use chrono::Utc;
use common::{Money, OrderId, ReservationId, TenantId, UserId};
use reservation::{
    LineItem, ReservationError, ReservationManager, ReservationStatus, ReservationStore,
    ReserveOutcome, UnavailableItem,
};
use serde::{Deserialize, Serialize};
use stock_ledger::{
    LedgerError, LedgerTransaction, OrderLine, OrderRecord, ShippingAddress, StockLedger,
};

use crate::address::validate_address;
use crate::error::{PlacementError, Result, ServiceError};
use crate::pricing::PricingConfig;
use crate::services::{
    CartStore, Catalog, CouponDecision, CouponValidator, Dispatcher, Dispatchers,
    SideEffectChannel,
};

/// A checkout request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub items: Vec<LineItem>,
    /// One per logical checkout attempt; retries reuse it.
    pub idempotency_key: String,
    pub shipping_address: ShippingAddress,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

/// Result of an order placement that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// The order is durable.
    Placed(Box<OrderRecord>),
    /// Not enough stock; nothing is held.
    Unavailable(Vec<UnavailableItem>),
    /// A product lock stayed busy; the shopper should try again shortly.
    Busy,
}

impl PlacementOutcome {
    fn label(&self) -> &'static str {
        match self {
            PlacementOutcome::Placed(_) => "placed",
            PlacementOutcome::Unavailable(_) => "unavailable",
            PlacementOutcome::Busy => "busy",
        }
    }
}

/// Maps a durable-write failure. A second order for the same reservation
/// means a concurrent duplicate submission already won.
fn ledger_failure(reservation_id: ReservationId, error: LedgerError) -> PlacementError {
    match error {
        LedgerError::DuplicateOrder { .. } => PlacementError::AlreadyPlaced(reservation_id),
        other => {
            tracing::error!(%reservation_id, error = %other, "order write failed");
            PlacementError::OrderNotPlaced(other.to_string())
        }
    }
}

/// Places orders: reserve, price, commit, then notify.
///
/// Generic over the reservation store (`S`), stock ledger (`L`), catalog
/// (`C`), coupon validator (`V`), cart store (`K`) and dispatcher (`D`).
pub struct OrderPlacementService<S, L, C, V, K, D>
where
    S: ReservationStore,
    L: StockLedger,
    C: Catalog,
    V: CouponValidator,
    K: CartStore,
    D: Dispatcher,
{
    reservations: Arc<ReservationManager<S, L>>,
    catalog: C,
    coupons: V,
    carts: K,
    dispatchers: Dispatchers<D>,
    pricing: PricingConfig,
}

impl<S, L, C, V, K, D> OrderPlacementService<S, L, C, V, K, D>
where
    S: ReservationStore,
    L: StockLedger,
    C: Catalog,
    V: CouponValidator,
    K: CartStore,
    D: Dispatcher,
{
    /// Creates a new order placement service.
    pub fn new(
        reservations: Arc<ReservationManager<S, L>>,
        catalog: C,
        coupons: V,
        carts: K,
        dispatchers: Dispatchers<D>,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            reservations,
            catalog,
            coupons,
            carts,
            dispatchers,
            pricing,
        }
    }

    pub fn reservations(&self) -> &Arc<ReservationManager<S, L>> {
        &self.reservations
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    /// Runs one checkout.
    ///
    /// Stock shortfalls and lock contention are returned as outcomes. Every
    /// error leaves no order behind and the reservation released; side-effect
    /// failures after the commit are logged and do not change the outcome.
    #[tracing::instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, user_id = %request.user_id)
    )]
    pub async fn place_order(&self, request: PlaceOrderRequest) -> Result<PlacementOutcome> {
        let started = std::time::Instant::now();

        let result = self.run(request).await;

        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "failed",
        };
        metrics::counter!("order_placements_total", "outcome" => outcome).increment(1);
        metrics::histogram!("order_placement_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn run(&self, request: PlaceOrderRequest) -> Result<PlacementOutcome> {
        // 1. Soft-hold the stock
        let reserved = self
            .reservations
            .reserve(
                &request.tenant_id,
                request.items.clone(),
                &request.idempotency_key,
            )
            .await;

        let reservation_id = match reserved {
            Ok(ReserveOutcome::Reserved { reservation_id, .. }) => reservation_id,
            Ok(ReserveOutcome::Unavailable { items }) => {
                tracing::warn!(unavailable = items.len(), "checkout rejected: insufficient stock");
                return Ok(PlacementOutcome::Unavailable(items));
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "checkout rejected: product busy");
                return Ok(PlacementOutcome::Busy);
            }
            Err(e) => return Err(e.into()),
        };

        // 2-4. Price and commit; anything short of a durable commit releases
        let order = match self.price_and_commit(reservation_id, &request).await {
            Ok(order) => order,
            Err(e @ PlacementError::AlreadyPlaced(_)) => {
                // The reservation belongs to the order that won
                tracing::warn!(%reservation_id, "duplicate checkout submission");
                return Err(e);
            }
            Err(e) => {
                self.release_after_failure(reservation_id, &e).await;
                return Err(e);
            }
        };

        // 5. Best-effort side effects
        self.run_side_effects(&order).await;

        tracing::info!(
            order_id = %order.order_id,
            %reservation_id,
            total = %order.total,
            "order placed"
        );
        Ok(PlacementOutcome::Placed(Box::new(order)))
    }

    /// Builds the order from authoritative prices and commits it with the
    /// stock deduction in one ledger transaction.
    async fn price_and_commit(
        &self,
        reservation_id: ReservationId,
        request: &PlaceOrderRequest,
    ) -> Result<OrderRecord> {
        validate_address(&request.shipping_address)?;

        // Lines come from the reservation, which already merged duplicates
        let reservation = self.reservations.get(reservation_id).await?;

        let mut tx = self
            .reservations
            .ledger()
            .begin()
            .await
            .map_err(|e| ledger_failure(reservation_id, e))?;

        let staged = self
            .stage_order(&mut tx, &reservation.line_items, reservation_id, request)
            .await;

        let (order, pending) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "ledger rollback failed");
                }
                return Err(e);
            }
        };

        if let Err(e) = tx.commit().await {
            // Held again, so the failure path can release it
            if let Err(abort_err) = self.reservations.abort_commit(pending).await {
                tracing::warn!(error = %abort_err, "failed to unpin reservation after ledger failure");
            }
            return Err(ledger_failure(reservation_id, e));
        }

        // The order is durable from here on; never release after this point
        if let Err(e) = self.reservations.finish_commit(pending).await {
            tracing::error!(
                order_id = %order.order_id,
                error = %e,
                "order committed but reservation bookkeeping failed"
            );
        }

        Ok(order)
    }

    async fn stage_order(
        &self,
        tx: &mut L::Transaction,
        items: &[LineItem],
        reservation_id: ReservationId,
        request: &PlaceOrderRequest,
    ) -> Result<(OrderRecord, reservation::PendingCommit)> {
        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            let product = self
                .catalog
                .get_product(&request.tenant_id, &item.product_id)
                .await
                .map_err(|e| match e {
                    ServiceError::NotFound(_) => {
                        PlacementError::ProductUnavailable(item.product_id.clone())
                    }
                    ServiceError::Unavailable(reason) => PlacementError::OrderNotPlaced(reason),
                })?;
            lines.push(OrderLine {
                product_id: item.product_id.clone(),
                product_name: product.name,
                quantity: item.quantity,
                unit_price: product.price,
            });
        }

        let subtotal: Money = lines.iter().map(OrderLine::line_total).sum();
        let discount = match &request.coupon_code {
            Some(code) => self.coupon_discount(&request.tenant_id, code, subtotal).await?,
            None => Money::zero(),
        };
        let totals = self.pricing.totals(&lines, discount);

        let order = OrderRecord {
            order_id: OrderId::new(),
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            reservation_id,
            lines,
            subtotal: totals.subtotal,
            shipping: totals.shipping,
            discount: totals.discount,
            total: totals.total,
            coupon_code: request.coupon_code.clone(),
            shipping_address: request.shipping_address.clone(),
            created_at: Utc::now(),
        };

        tx.insert_order(&order)
            .await
            .map_err(|e| ledger_failure(reservation_id, e))?;

        let pending = self
            .reservations
            .commit(tx, reservation_id, order.order_id)
            .await
            .map_err(|e| match e {
                ReservationError::Ledger(ledger) => ledger_failure(reservation_id, ledger),
                ReservationError::AlreadyTerminal {
                    status: ReservationStatus::Committed | ReservationStatus::Committing,
                    ..
                } => PlacementError::AlreadyPlaced(reservation_id),
                other => PlacementError::Reservation(other),
            })?;

        Ok((order, pending))
    }

    async fn coupon_discount(&self, tenant_id: &TenantId, code: &str, subtotal: Money) -> Result<Money> {
        let decision = self
            .coupons
            .validate(tenant_id, code, subtotal)
            .await
            .map_err(|e| PlacementError::InvalidCoupon {
                code: code.to_string(),
                reason: e.to_string(),
            })?;

        match decision {
            CouponDecision::Valid { discount } => Ok(discount),
            CouponDecision::Invalid { reason } => Err(PlacementError::InvalidCoupon {
                code: code.to_string(),
                reason,
            }),
        }
    }

    async fn release_after_failure(&self, reservation_id: ReservationId, cause: &PlacementError) {
        if cause.is_client_error() {
            tracing::warn!(%reservation_id, error = %cause, "checkout aborted");
        } else {
            tracing::error!(%reservation_id, error = %cause, "checkout failed");
        }

        if let Err(e) = self.reservations.release(reservation_id).await {
            // The sweep releases it at expiry
            tracing::error!(%reservation_id, error = %e, "failed to release reservation");
        }
    }

    async fn run_side_effects(&self, order: &OrderRecord) {
        if let Err(e) = self.carts.clear(&order.user_id, &order.tenant_id).await {
            metrics::counter!("side_effect_failures_total", "channel" => "cart").increment(1);
            tracing::warn!(order_id = %order.order_id, error = %e, "failed to clear cart");
        }

        if let Some(code) = &order.coupon_code
            && let Err(e) = self.coupons.redeem(&order.tenant_id, code).await
        {
            metrics::counter!("side_effect_failures_total", "channel" => "coupon").increment(1);
            tracing::warn!(order_id = %order.order_id, error = %e, "failed to record coupon use");
        }

        let payload = serde_json::json!({
            "order_id": order.order_id,
            "tenant_id": order.tenant_id,
            "user_id": order.user_id,
            "reservation_id": order.reservation_id,
            "total_cents": order.total.cents(),
            "currency": self.pricing.currency,
            "units": order.unit_count(),
        });

        for (channel, event) in [
            (SideEffectChannel::Notification, "order.confirmation"),
            (SideEffectChannel::Webhook, "order.created"),
            (SideEffectChannel::Audit, "order.placed"),
        ] {
            if let Err(e) = self
                .dispatchers
                .channel(channel)
                .enqueue(event, payload.clone())
                .await
            {
                metrics::counter!("side_effect_failures_total", "channel" => channel.as_str())
                    .increment(1);
                tracing::warn!(
                    order_id = %order.order_id,
                    %channel,
                    error = %e,
                    "side effect dispatch failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use common::ProductId;
    use reservation::{InMemoryReservationStore, ReservationConfig};
    use stock_ledger::{InMemoryStockLedger, StockLedgerExt};

    use super::*;
    use crate::services::{
        Coupon, InMemoryCartStore, InMemoryCatalog, InMemoryCouponValidator, InMemoryDispatcher,
        ProductInfo,
    };

    type TestService = OrderPlacementService<
        InMemoryReservationStore,
        InMemoryStockLedger,
        InMemoryCatalog,
        InMemoryCouponValidator,
        InMemoryCartStore,
        InMemoryDispatcher,
    >;

    struct Harness {
        service: TestService,
        catalog: InMemoryCatalog,
        coupons: InMemoryCouponValidator,
        carts: InMemoryCartStore,
        audit: InMemoryDispatcher,
    }

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    fn address() -> ShippingAddress {
        ShippingAddress {
            recipient: "Grace Hopper".to_string(),
            line1: "1 Navy Way".to_string(),
            line2: None,
            city: "Arlington".to_string(),
            postal_code: "22202".to_string(),
            country: "US".to_string(),
        }
    }

    fn request(items: Vec<LineItem>) -> PlaceOrderRequest {
        PlaceOrderRequest {
            tenant_id: tenant(),
            user_id: UserId::new("grace"),
            items,
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            shipping_address: address(),
            coupon_code: None,
        }
    }

    async fn harness() -> Harness {
        let ledger = InMemoryStockLedger::new();
        ledger
            .set_quantity(&tenant(), &ProductId::new("SKU-A"), 5)
            .await
            .unwrap();
        let catalog = InMemoryCatalog::new();
        catalog.upsert(
            &tenant(),
            ProductInfo {
                id: ProductId::new("SKU-A"),
                name: "Anvil".to_string(),
                price: Money::from_cents(1500),
                current_stock: 5,
            },
        );
        let coupons = InMemoryCouponValidator::new();
        let carts = InMemoryCartStore::new();
        let audit = InMemoryDispatcher::new();
        let manager = Arc::new(ReservationManager::new(
            InMemoryReservationStore::new(),
            ledger,
            ReservationConfig::default(),
        ));
        let service = OrderPlacementService::new(
            manager,
            catalog.clone(),
            coupons.clone(),
            carts.clone(),
            Dispatchers::new(InMemoryDispatcher::new(), InMemoryDispatcher::new(), audit.clone()),
            PricingConfig::default(),
        );
        Harness {
            service,
            catalog,
            coupons,
            carts,
            audit,
        }
    }

    async fn on_hand(service: &TestService) -> u32 {
        service
            .reservations()
            .ledger()
            .quantity_on_hand(&tenant(), &ProductId::new("SKU-A"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_places_order_with_catalog_prices() {
        let h = harness().await;
        h.carts
            .add_item(&UserId::new("grace"), &tenant(), LineItem::new("SKU-A", 2));

        let outcome = h
            .service
            .place_order(request(vec![LineItem::new("SKU-A", 2)]))
            .await
            .unwrap();

        let PlacementOutcome::Placed(order) = outcome else {
            panic!("expected placed order");
        };
        assert_eq!(order.lines[0].product_name, "Anvil");
        assert_eq!(order.subtotal, Money::from_cents(3000));
        assert_eq!(order.shipping, Money::from_cents(500));
        assert_eq!(order.total, Money::from_cents(3500));
        assert_eq!(on_hand(&h.service).await, 3);

        let reservation = h.service.reservations().get(order.reservation_id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Committed);
        assert_eq!(reservation.order_id, Some(order.order_id));

        assert!(h.carts.items(&UserId::new("grace"), &tenant()).is_empty());
        assert_eq!(h.audit.event_count(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_stock_is_an_outcome() {
        let h = harness().await;

        let outcome = h
            .service
            .place_order(request(vec![LineItem::new("SKU-A", 6)]))
            .await
            .unwrap();

        match outcome {
            PlacementOutcome::Unavailable(items) => assert_eq!(items[0].available, 5),
            other => panic!("expected unavailable, got {other:?}"),
        }
        assert_eq!(h.audit.event_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_address_releases_reservation() {
        let h = harness().await;
        let mut bad = request(vec![LineItem::new("SKU-A", 5)]);
        bad.shipping_address.postal_code = String::new();

        let err = h.service.place_order(bad).await.unwrap_err();

        assert!(matches!(err, PlacementError::InvalidAddress(_)));
        assert_eq!(
            h.service
                .reservations()
                .available(&tenant(), &ProductId::new("SKU-A"))
                .await
                .unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn test_vanished_product_releases_reservation() {
        let h = harness().await;
        h.catalog.remove(&tenant(), &ProductId::new("SKU-A"));

        let err = h
            .service
            .place_order(request(vec![LineItem::new("SKU-A", 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, PlacementError::ProductUnavailable(ref p) if p.as_str() == "SKU-A"));
        assert_eq!(on_hand(&h.service).await, 5);
        assert_eq!(
            h.service
                .reservations()
                .available(&tenant(), &ProductId::new("SKU-A"))
                .await
                .unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn test_coupon_discount_and_redemption() {
        let h = harness().await;
        h.coupons.insert(&tenant(), Coupon::percent("TENOFF", 10));
        let mut req = request(vec![LineItem::new("SKU-A", 4)]);
        req.coupon_code = Some("TENOFF".to_string());

        let PlacementOutcome::Placed(order) = h.service.place_order(req).await.unwrap() else {
            panic!("expected placed order");
        };

        // 4 x $15.00 = $60.00, free shipping, 10% off
        assert_eq!(order.shipping, Money::zero());
        assert_eq!(order.discount, Money::from_cents(600));
        assert_eq!(order.total, Money::from_cents(5400));
        assert_eq!(h.coupons.times_used(&tenant(), "TENOFF"), Some(1));
    }

    #[tokio::test]
    async fn test_invalid_coupon_releases_reservation() {
        let h = harness().await;
        let mut req = request(vec![LineItem::new("SKU-A", 1)]);
        req.coupon_code = Some("BOGUS".to_string());

        let err = h.service.place_order(req).await.unwrap_err();

        assert!(matches!(err, PlacementError::InvalidCoupon { .. }));
        assert!(err.is_client_error());
        assert_eq!(on_hand(&h.service).await, 5);
        assert_eq!(h.service.reservations().store().hold_count().await, 0);
    }

    #[tokio::test]
    async fn test_side_effect_failures_do_not_undo_order() {
        let h = harness().await;
        h.carts.set_fail_on_clear(true);
        h.audit.set_fail_on_enqueue(true);

        let outcome = h
            .service
            .place_order(request(vec![LineItem::new("SKU-A", 1)]))
            .await
            .unwrap();

        assert!(matches!(outcome, PlacementOutcome::Placed(_)));
        assert_eq!(on_hand(&h.service).await, 4);
    }

    #[tokio::test]
    async fn test_failed_commit_places_nothing() {
        let h = harness().await;
        h.service.reservations().ledger().set_fail_on_commit(true);

        let err = h
            .service
            .place_order(request(vec![LineItem::new("SKU-A", 2)]))
            .await
            .unwrap_err();

        assert!(matches!(err, PlacementError::OrderNotPlaced(_)));
        assert_eq!(h.service.reservations().ledger().order_count().await, 0);
        assert_eq!(on_hand(&h.service).await, 5);
        assert_eq!(
            h.service
                .reservations()
                .available(&tenant(), &ProductId::new("SKU-A"))
                .await
                .unwrap(),
            5
        );
        assert_eq!(h.audit.event_count(), 0);
    }
}
