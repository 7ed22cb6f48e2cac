//! Fast, TTL-capable storage for locks, holds and reservation records.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId, TenantId};

use crate::Result;
use crate::model::{Hold, ProductLock, Reservation};
use crate::state::ReservationStatus;

pub use self::memory::InMemoryReservationStore;
pub use self::redis::RedisReservationStore;

/// Storage for the short-lived side of a reservation.
///
/// Every method is a single atomic step against the store; the
/// [`ReservationManager`](crate::ReservationManager) composes them into the
/// lock-and-check protocol. Time is passed in rather than read, so
/// implementations agree with the manager's clock.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Takes the lock if nobody holds it (or the holder's TTL lapsed).
    ///
    /// Returns false without waiting if the lock is taken.
    async fn try_acquire_lock(
        &self,
        lock: &ProductLock,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Releases the lock if it is still owned by `lock.token`.
    async fn release_lock(&self, lock: &ProductLock) -> Result<()>;

    /// Sums live holds on a product, ignoring the holds of `exclude`.
    async fn held_quantity(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        exclude: Option<ReservationId>,
        now: DateTime<Utc>,
    ) -> Result<u32>;

    /// Writes or replaces a reservation's hold on a product.
    async fn put_hold(&self, tenant_id: &TenantId, product_id: &ProductId, hold: Hold)
    -> Result<()>;

    /// Deletes a reservation's holds on the given products.
    async fn delete_holds(
        &self,
        tenant_id: &TenantId,
        reservation_id: ReservationId,
        product_ids: &[ProductId],
    ) -> Result<()>;

    /// Drops holds whose own TTL lapsed. Returns how many were removed.
    ///
    /// Stores without native key expiry also drop lapsed locks, lapsed
    /// idempotency bindings and finished records past their retention here.
    async fn purge_expired_holds(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Stores a new reservation record.
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()>;

    /// Loads a reservation record.
    async fn get_reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>>;

    /// Moves a reservation from `from` to `to` if it is currently in `from`.
    ///
    /// Returns false if the record is missing or in another state.
    async fn transition(
        &self,
        reservation_id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
        order_id: Option<OrderId>,
    ) -> Result<bool>;

    /// IDs of `Held` or `Committing` reservations with `expires_at <= now`,
    /// oldest first.
    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationId>>;

    /// Binds `key` to `reservation_id` for `ttl` unless a live binding exists.
    ///
    /// Returns the existing binding if there was one.
    async fn claim_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        reservation_id: ReservationId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ReservationId>>;

    /// Rebinds `key` from `current` to `reservation_id`.
    ///
    /// Returns false if the key is no longer bound to `current`.
    async fn replace_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        current: ReservationId,
        reservation_id: ReservationId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drops the binding of `key` if it still points at `reservation_id`.
    async fn unbind_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        reservation_id: ReservationId,
    ) -> Result<()>;
}
