use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId, TenantId};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::Result;
use crate::config::{ReservationConfig, to_delta};
use crate::model::{Hold, ProductLock, Reservation};
use crate::state::ReservationStatus;
use crate::store::ReservationStore;

type ProductKey = (TenantId, ProductId);

#[derive(Default)]
struct StoreState {
    locks: HashMap<ProductKey, (Uuid, DateTime<Utc>)>,
    holds: HashMap<ProductKey, HashMap<ReservationId, Hold>>,
    reservations: HashMap<ReservationId, Reservation>,
    idempotency: HashMap<(TenantId, String), (ReservationId, DateTime<Utc>)>,
}

/// In-memory reservation store for testing and single-process runs.
///
/// Clones share state, so one store can back several managers the way a
/// shared Redis instance backs several workers. Nothing expires on its own:
/// [`purge_expired_holds`](ReservationStore::purge_expired_holds) does the
/// work Redis key TTLs do.
#[derive(Clone)]
pub struct InMemoryReservationStore {
    state: Arc<RwLock<StoreState>>,
    record_retention: Duration,
}

impl Default for InMemoryReservationStore {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            record_retention: ReservationConfig::default().record_retention,
        }
    }
}

impl InMemoryReservationStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long finished reservation records are kept.
    pub fn with_record_retention(mut self, retention: Duration) -> Self {
        self.record_retention = retention;
        self
    }

    /// Returns the number of reservation records, finished or not.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    /// Returns the number of idempotency bindings, lapsed or not.
    pub async fn binding_count(&self) -> usize {
        self.state.read().await.idempotency.len()
    }

    /// Returns the number of hold entries across all products, live or not.
    pub async fn hold_count(&self) -> usize {
        self.state
            .read()
            .await
            .holds
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Returns true if some worker currently owns the product lock.
    pub async fn is_locked(&self, tenant_id: &TenantId, product_id: &ProductId) -> bool {
        self.state
            .read()
            .await
            .locks
            .contains_key(&(tenant_id.clone(), product_id.clone()))
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn try_acquire_lock(
        &self,
        lock: &ProductLock,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let key = (lock.tenant_id.clone(), lock.product_id.clone());

        if let Some((_, expires_at)) = state.locks.get(&key)
            && *expires_at > now
        {
            return Ok(false);
        }

        state.locks.insert(key, (lock.token, now + to_delta(ttl)));
        Ok(true)
    }

    async fn release_lock(&self, lock: &ProductLock) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (lock.tenant_id.clone(), lock.product_id.clone());
        if state
            .locks
            .get(&key)
            .is_some_and(|(token, _)| *token == lock.token)
        {
            state.locks.remove(&key);
        }
        Ok(())
    }

    async fn held_quantity(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        exclude: Option<ReservationId>,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let state = self.state.read().await;
        let held = state
            .holds
            .get(&(tenant_id.clone(), product_id.clone()))
            .map(|holds| {
                holds
                    .values()
                    .filter(|h| exclude != Some(h.reservation_id) && h.is_live(now))
                    .fold(0u32, |acc, h| acc.saturating_add(h.quantity))
            })
            .unwrap_or(0);
        Ok(held)
    }

    async fn put_hold(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        hold: Hold,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .holds
            .entry((tenant_id.clone(), product_id.clone()))
            .or_default()
            .insert(hold.reservation_id, hold);
        Ok(())
    }

    async fn delete_holds(
        &self,
        tenant_id: &TenantId,
        reservation_id: ReservationId,
        product_ids: &[ProductId],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        for product_id in product_ids {
            let key = (tenant_id.clone(), product_id.clone());
            let emptied = match state.holds.get_mut(&key) {
                Some(holds) => {
                    holds.remove(&reservation_id);
                    holds.is_empty()
                }
                None => false,
            };
            if emptied {
                state.holds.remove(&key);
            }
        }
        Ok(())
    }

    async fn purge_expired_holds(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut purged = 0;
        for holds in state.holds.values_mut() {
            let before = holds.len();
            holds.retain(|_, h| h.is_live(now));
            purged += before - holds.len();
        }
        state.holds.retain(|_, holds| !holds.is_empty());

        state.locks.retain(|_, (_, expires_at)| *expires_at > now);
        state.idempotency.retain(|_, (_, expires_at)| *expires_at > now);
        let retention = to_delta(self.record_retention);
        state
            .reservations
            .retain(|_, r| !r.status.is_terminal() || r.expires_at + retention > now);

        Ok(purged)
    }

    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.state
            .write()
            .await
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn get_reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self
            .state
            .read()
            .await
            .reservations
            .get(&reservation_id)
            .cloned())
    }

    async fn transition(
        &self,
        reservation_id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
        order_id: Option<OrderId>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.reservations.get_mut(&reservation_id) {
            Some(reservation) if reservation.status == from => {
                reservation.status = to;
                if order_id.is_some() {
                    reservation.order_id = order_id;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationId>> {
        let state = self.state.read().await;
        let mut expired: Vec<_> = state
            .reservations
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    ReservationStatus::Held | ReservationStatus::Committing
                ) && r.expires_at <= now
            })
            .map(|r| (r.expires_at, r.id))
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn claim_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        reservation_id: ReservationId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ReservationId>> {
        let mut state = self.state.write().await;
        let key = (tenant_id.clone(), key.to_string());
        if let Some((existing, expires_at)) = state.idempotency.get(&key)
            && *expires_at > now
        {
            return Ok(Some(*existing));
        }
        state
            .idempotency
            .insert(key, (reservation_id, now + to_delta(ttl)));
        Ok(None)
    }

    async fn replace_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        current: ReservationId,
        reservation_id: ReservationId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.idempotency.get_mut(&(tenant_id.clone(), key.to_string())) {
            Some(binding) if binding.0 == current && binding.1 > now => {
                *binding = (reservation_id, now + to_delta(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unbind_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        reservation_id: ReservationId,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (tenant_id.clone(), key.to_string());
        if state
            .idempotency
            .get(&key)
            .is_some_and(|(bound, _)| *bound == reservation_id)
        {
            state.idempotency.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LineItem;

    fn tenant() -> TenantId {
        TenantId::new("acme")
    }

    fn sku() -> ProductId {
        ProductId::new("SKU-001")
    }

    fn hold(quantity: u32, expires_at: DateTime<Utc>) -> Hold {
        Hold {
            reservation_id: ReservationId::new(),
            quantity,
            expires_at,
        }
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let first = ProductLock::new(tenant(), sku());
        let second = ProductLock::new(tenant(), sku());

        assert!(store.try_acquire_lock(&first, Duration::from_secs(5), now).await.unwrap());
        assert!(!store.try_acquire_lock(&second, Duration::from_secs(5), now).await.unwrap());

        // A non-owner cannot release it
        store.release_lock(&second).await.unwrap();
        assert!(store.is_locked(&tenant(), &sku()).await);

        store.release_lock(&first).await.unwrap();
        assert!(store.try_acquire_lock(&second, Duration::from_secs(5), now).await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_lock_lapses_after_ttl() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let crashed = ProductLock::new(tenant(), sku());
        let next = ProductLock::new(tenant(), sku());

        store.try_acquire_lock(&crashed, Duration::from_secs(5), now).await.unwrap();
        let later = now + chrono::Duration::seconds(6);
        assert!(store.try_acquire_lock(&next, Duration::from_secs(5), later).await.unwrap());

        // The crashed holder's late release must not free the successor's lock
        store.release_lock(&crashed).await.unwrap();
        assert!(store.is_locked(&tenant(), &sku()).await);
    }

    #[tokio::test]
    async fn held_quantity_skips_excluded_and_expired() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let live = hold(3, now + chrono::Duration::minutes(5));
        let mine = hold(4, now + chrono::Duration::minutes(5));
        let stale = hold(10, now - chrono::Duration::seconds(1));

        for h in [live, mine, stale] {
            store.put_hold(&tenant(), &sku(), h).await.unwrap();
        }

        let held = store
            .held_quantity(&tenant(), &sku(), Some(mine.reservation_id), now)
            .await
            .unwrap();
        assert_eq!(held, 3);

        assert_eq!(store.purge_expired_holds(now).await.unwrap(), 1);
        assert_eq!(store.hold_count().await, 2);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let reservation = Reservation {
            id: ReservationId::new(),
            tenant_id: tenant(),
            idempotency_key: "k".to_string(),
            status: ReservationStatus::Held,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(10),
            line_items: vec![LineItem::new("SKU-001", 1)],
            order_id: None,
        };
        store.insert_reservation(&reservation).await.unwrap();

        let order_id = OrderId::new();
        assert!(
            store
                .transition(
                    reservation.id,
                    ReservationStatus::Held,
                    ReservationStatus::Committing,
                    Some(order_id)
                )
                .await
                .unwrap()
        );
        assert!(
            !store
                .transition(
                    reservation.id,
                    ReservationStatus::Held,
                    ReservationStatus::Released,
                    None
                )
                .await
                .unwrap()
        );

        let stored = store.get_reservation(reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Committing);
        assert_eq!(stored.order_id, Some(order_id));
    }

    #[tokio::test]
    async fn idempotency_claim_keeps_first_binding() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let first = ReservationId::new();
        let second = ReservationId::new();
        let ttl = Duration::from_secs(600);

        assert_eq!(
            store
                .claim_idempotency_key(&tenant(), "k", first, ttl, now)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            store
                .claim_idempotency_key(&tenant(), "k", second, ttl, now)
                .await
                .unwrap(),
            Some(first)
        );
        assert_eq!(
            store
                .claim_idempotency_key(&TenantId::new("other"), "k", second, ttl, now)
                .await
                .unwrap(),
            None
        );

        // Only the current holder of the key can be replaced or unbound
        assert!(
            !store
                .replace_idempotency_key(&tenant(), "k", second, second, ttl, now)
                .await
                .unwrap()
        );
        assert!(
            store
                .replace_idempotency_key(&tenant(), "k", first, second, ttl, now)
                .await
                .unwrap()
        );
        store.unbind_idempotency_key(&tenant(), "k", first).await.unwrap();
        assert_eq!(
            store
                .claim_idempotency_key(&tenant(), "k", first, ttl, now)
                .await
                .unwrap(),
            Some(second)
        );

        store.unbind_idempotency_key(&tenant(), "k", second).await.unwrap();
        assert_eq!(
            store
                .claim_idempotency_key(&tenant(), "k", first, ttl, now)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn lapsed_binding_can_be_claimed_again() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(600);
        let first = ReservationId::new();
        let second = ReservationId::new();

        store
            .claim_idempotency_key(&tenant(), "k", first, ttl, now)
            .await
            .unwrap();
        let later = now + chrono::Duration::seconds(601);
        assert_eq!(
            store
                .claim_idempotency_key(&tenant(), "k", second, ttl, later)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn purge_drops_finished_records_and_lapsed_bindings() {
        let store = InMemoryReservationStore::new().with_record_retention(Duration::from_secs(3600));
        let now = Utc::now();
        let ttl = Duration::from_secs(600);
        let record = |status| Reservation {
            id: ReservationId::new(),
            tenant_id: tenant(),
            idempotency_key: "k".to_string(),
            status,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(10),
            line_items: vec![LineItem::new("SKU-001", 1)],
            order_id: None,
        };
        let released = record(ReservationStatus::Released);
        let held = record(ReservationStatus::Held);
        let committing = record(ReservationStatus::Committing);
        for r in [&released, &held, &committing] {
            store.insert_reservation(r).await.unwrap();
        }
        store
            .claim_idempotency_key(&tenant(), "k", released.id, ttl, now)
            .await
            .unwrap();
        let lock = ProductLock::new(tenant(), sku());
        store
            .try_acquire_lock(&lock, Duration::from_secs(5), now)
            .await
            .unwrap();

        // Within retention nothing but the lapsed lock goes
        store
            .purge_expired_holds(now + chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(store.reservation_count().await, 3);
        assert_eq!(store.binding_count().await, 0);
        assert!(!store.is_locked(&tenant(), &sku()).await);

        store
            .purge_expired_holds(now + chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(store.reservation_count().await, 2);
        assert!(store.get_reservation(released.id).await.unwrap().is_none());
        assert!(store.get_reservation(held.id).await.unwrap().is_some());
        assert!(store.get_reservation(committing.id).await.unwrap().is_some());
    }
}
