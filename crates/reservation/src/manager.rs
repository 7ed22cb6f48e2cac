//! The reservation manager: reserve, commit and release.

use std::sync::Arc;

use common::{OrderId, ProductId, ReservationId, TenantId};
use stock_ledger::{LedgerTransaction, OrderRecord, StockLedger, StockLedgerExt};

use crate::clock::{Clock, SystemClock};
use crate::config::{ReservationConfig, to_delta};
use crate::error::{ReservationError, Result};
use crate::model::{Hold, LineItem, ProductLock, Reservation, ReserveOutcome, UnavailableItem};
use crate::state::ReservationStatus;
use crate::store::ReservationStore;

/// Upper bound on reservations expired per sweep call.
const SWEEP_BATCH: usize = 500;

/// A commit whose ledger changes are staged but not yet durable.
///
/// Returned by [`ReservationManager::commit`]; hand it to
/// [`ReservationManager::finish_commit`] once the transaction has committed,
/// or to [`ReservationManager::abort_commit`] if it rolled back. Until then
/// the reservation is `Committing` and cannot be released or expired.
#[derive(Debug)]
#[must_use = "finish_commit or abort_commit must run once the ledger transaction settles"]
pub struct PendingCommit {
    reservation: Reservation,
    order_id: OrderId,
}

impl PendingCommit {
    pub fn reservation_id(&self) -> ReservationId {
        self.reservation.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// The reservation as it was when the commit was staged.
    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }
}

/// Coordinates soft-holds in the reservation store with the durable ledger.
///
/// The manager keeps no state of its own; any number of managers (across
/// tasks or processes) may share one store and one ledger.
pub struct ReservationManager<S, L>
where
    S: ReservationStore,
    L: StockLedger,
{
    store: S,
    ledger: L,
    config: ReservationConfig,
    clock: Arc<dyn Clock>,
}

impl<S, L> ReservationManager<S, L>
where
    S: ReservationStore,
    L: StockLedger,
{
    /// Creates a new manager on the system clock.
    pub fn new(store: S, ledger: L, config: ReservationConfig) -> Self {
        Self {
            store,
            ledger,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for TTLs and expiry checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ReservationConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Soft-holds every line item, or nothing.
    ///
    /// Lines are merged per product and checked in ascending product order,
    /// each under its own product lock. Insufficient stock is reported as
    /// [`ReserveOutcome::Unavailable`] with the quantity that was available;
    /// in that case every hold written by this call is removed again.
    ///
    /// The idempotency key is claimed before any lock is taken. A repeated
    /// call with the key of a reservation that is still held (or being
    /// committed) returns that reservation without writing new holds; a call
    /// racing one that is still reserving waits for it.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an empty request, a zero quantity or an empty
    /// key; `Contention` if a product lock stayed busy for the whole retry
    /// budget; `KeyInFlight` if a concurrent call with the same key did not
    /// finish within that budget. None of them leave holds behind.
    #[tracing::instrument(skip(self, line_items), fields(tenant_id = %tenant_id))]
    pub async fn reserve(
        &self,
        tenant_id: &TenantId,
        line_items: Vec<LineItem>,
        idempotency_key: &str,
    ) -> Result<ReserveOutcome> {
        if idempotency_key.trim().is_empty() {
            return Err(ReservationError::InvalidRequest(
                "idempotency key must not be empty".to_string(),
            ));
        }
        let line_items = LineItem::normalize(line_items)?;

        let now = self.clock.now();
        let reservation = Reservation {
            id: ReservationId::new(),
            tenant_id: tenant_id.clone(),
            idempotency_key: idempotency_key.to_string(),
            status: ReservationStatus::Held,
            created_at: now,
            expires_at: now + to_delta(self.config.reservation_ttl),
            line_items,
            order_id: None,
        };

        if let Some(existing) = self.claim_key(&reservation).await? {
            metrics::counter!("reservations_total", "outcome" => "reused").increment(1);
            tracing::info!(reservation_id = %existing.id, "returning existing reservation for idempotency key");
            return Ok(ReserveOutcome::Reserved {
                reservation_id: existing.id,
                expires_at: existing.expires_at,
                reused: true,
            });
        }

        let mut held: Vec<ProductId> = Vec::with_capacity(reservation.line_items.len());
        let mut unavailable = Vec::new();

        for item in &reservation.line_items {
            let lock = match self.acquire_lock(tenant_id, &item.product_id).await {
                Ok(lock) => lock,
                Err(e) => {
                    self.abandon_attempt(&reservation, &held).await;
                    if matches!(e, ReservationError::Contention { .. }) {
                        metrics::counter!("reservations_total", "outcome" => "contention")
                            .increment(1);
                    }
                    return Err(e);
                }
            };

            let checked = self.hold_under_lock(&reservation, item).await;
            self.unlock(&lock).await;

            match checked {
                Ok(None) => held.push(item.product_id.clone()),
                Ok(Some(short)) => unavailable.push(short),
                Err(e) => {
                    self.abandon_attempt(&reservation, &held).await;
                    return Err(e);
                }
            }
        }

        if !unavailable.is_empty() {
            self.abandon_attempt(&reservation, &held).await;
            metrics::counter!("reservations_total", "outcome" => "unavailable").increment(1);
            tracing::warn!(unavailable = ?unavailable, "insufficient stock for reservation");
            return Ok(ReserveOutcome::Unavailable { items: unavailable });
        }

        if let Err(e) = self.store.insert_reservation(&reservation).await {
            self.abandon_attempt(&reservation, &held).await;
            return Err(e);
        }

        metrics::counter!("reservations_total", "outcome" => "reserved").increment(1);
        tracing::info!(
            reservation_id = %reservation.id,
            expires_at = %reservation.expires_at,
            "reservation held"
        );

        Ok(ReserveOutcome::Reserved {
            reservation_id: reservation.id,
            expires_at: reservation.expires_at,
            reused: false,
        })
    }

    /// Deducts a held reservation from the ledger inside `tx`.
    ///
    /// Must run in the same transaction that inserts the order. The
    /// reservation moves to `Committing`, which keeps its holds in place and
    /// makes concurrent releases fail, until
    /// [`finish_commit`](Self::finish_commit) or
    /// [`abort_commit`](Self::abort_commit) settles it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the reservation does not exist or has expired,
    /// `AlreadyTerminal` if it was committed, released or is already being
    /// committed, and `Ledger` if a decrement fails (the caller must then
    /// roll back; the reservation is held again).
    #[tracing::instrument(skip(self, tx))]
    pub async fn commit(
        &self,
        tx: &mut L::Transaction,
        reservation_id: ReservationId,
        order_id: OrderId,
    ) -> Result<PendingCommit> {
        let mut reservation = self.load_committable(reservation_id).await?;

        let pinned = self
            .store
            .transition(
                reservation_id,
                ReservationStatus::Held,
                ReservationStatus::Committing,
                None,
            )
            .await?;
        if !pinned {
            return Err(self.lost_commit_race(reservation_id).await);
        }
        reservation.status = ReservationStatus::Committing;

        for item in &reservation.line_items {
            let remaining = match tx
                .decrement_stock(&reservation.tenant_id, &item.product_id, item.quantity)
                .await
            {
                Ok(remaining) => remaining,
                Err(e) => {
                    if let Err(restore_err) = self.restore_held(reservation_id).await {
                        tracing::warn!(error = %restore_err, "failed to unpin reservation after ledger error");
                    }
                    return Err(e.into());
                }
            };
            tracing::debug!(
                product_id = %item.product_id,
                quantity = item.quantity,
                remaining,
                "stock decrement staged"
            );
        }

        Ok(PendingCommit {
            reservation,
            order_id,
        })
    }

    /// Marks a staged commit as committed and drops its holds.
    ///
    /// Call only after the ledger transaction passed to
    /// [`commit`](Self::commit) committed successfully.
    #[tracing::instrument(skip(self, pending), fields(reservation_id = %pending.reservation.id, order_id = %pending.order_id))]
    pub async fn finish_commit(&self, pending: PendingCommit) -> Result<()> {
        let PendingCommit {
            reservation,
            order_id,
        } = pending;

        let marked = self
            .store
            .transition(
                reservation.id,
                ReservationStatus::Committing,
                ReservationStatus::Committed,
                Some(order_id),
            )
            .await?;

        if !marked {
            // The sweep gives up on commits stalled past the grace period;
            // the ledger already carries the deduction, so the commit stands.
            let recovered = self
                .store
                .transition(
                    reservation.id,
                    ReservationStatus::Expired,
                    ReservationStatus::Committed,
                    Some(order_id),
                )
                .await?;
            if !recovered {
                let current = self.store.get_reservation(reservation.id).await?;
                tracing::error!(
                    status = ?current.as_ref().map(|r| r.status),
                    "reservation changed state while its commit was in flight"
                );
                return Err(match current {
                    Some(r) => ReservationError::AlreadyTerminal {
                        reservation_id: r.id,
                        status: r.status,
                    },
                    None => ReservationError::NotFound(reservation.id),
                });
            }
            tracing::warn!("reservation expired during commit; marked committed");
        }

        self.store
            .delete_holds(
                &reservation.tenant_id,
                reservation.id,
                &reservation.product_ids(),
            )
            .await?;

        metrics::counter!("reservations_committed_total").increment(1);
        tracing::info!("reservation committed");
        Ok(())
    }

    /// Returns a staged commit's reservation to `Held`.
    ///
    /// Call after the ledger transaction passed to [`commit`](Self::commit)
    /// rolled back or failed to commit. The reservation can then be
    /// committed again or released.
    #[tracing::instrument(skip(self, pending), fields(reservation_id = %pending.reservation.id, order_id = %pending.order_id))]
    pub async fn abort_commit(&self, pending: PendingCommit) -> Result<()> {
        if self.restore_held(pending.reservation.id).await? {
            tracing::debug!("commit aborted; reservation held again");
        } else {
            tracing::warn!("commit aborted after the reservation left committing");
        }
        Ok(())
    }

    /// Commits a reservation together with its order in one ledger transaction.
    ///
    /// Uses `order.reservation_id` and `order.order_id`. If any step fails
    /// the transaction is rolled back and the reservation stays held.
    pub async fn commit_with_order(&self, order: &OrderRecord) -> Result<()> {
        let mut tx = self.ledger.begin().await?;

        let pending = match self
            .commit(&mut tx, order.reservation_id, order.order_id)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                return Err(e);
            }
        };

        if let Err(e) = tx.insert_order(order).await {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            self.abort_quietly(pending).await;
            return Err(e.into());
        }

        if let Err(e) = tx.commit().await {
            self.abort_quietly(pending).await;
            return Err(e.into());
        }
        self.finish_commit(pending).await
    }

    /// Drops a reservation's holds and marks it released.
    ///
    /// Releasing an already released or expired reservation succeeds.
    ///
    /// # Errors
    ///
    /// `NotFound` if the reservation does not exist, `AlreadyTerminal` if it
    /// was committed or a commit is in flight. Neither touches its holds.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, reservation_id: ReservationId) -> Result<()> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or(ReservationError::NotFound(reservation_id))?;

        let released = reservation.status == ReservationStatus::Held
            && self
                .store
                .transition(
                    reservation_id,
                    ReservationStatus::Held,
                    ReservationStatus::Released,
                    None,
                )
                .await?;

        if !released {
            let current = self
                .store
                .get_reservation(reservation_id)
                .await?
                .map(|r| r.status)
                .unwrap_or(reservation.status);
            if matches!(
                current,
                ReservationStatus::Committed | ReservationStatus::Committing
            ) {
                tracing::error!(status = %current, "release requested for a committed reservation");
                return Err(ReservationError::AlreadyTerminal {
                    reservation_id,
                    status: current,
                });
            }
        }

        // Repeated for already-finished reservations so a crash between the
        // transition and this call cannot strand holds.
        self.store
            .delete_holds(
                &reservation.tenant_id,
                reservation_id,
                &reservation.product_ids(),
            )
            .await?;

        if released {
            metrics::counter!("reservations_released_total").increment(1);
            tracing::info!("reservation released");
        } else {
            tracing::debug!("reservation already finished; release is a no-op");
        }
        Ok(())
    }

    /// Expires held reservations past their TTL and drops their holds.
    ///
    /// Commits still in flight one TTL after expiry are settled against the
    /// ledger: committed if their order exists, expired otherwise. Returns
    /// the number of reservations expired.
    #[tracing::instrument(skip(self))]
    pub async fn expire_stale(&self) -> Result<usize> {
        let now = self.clock.now();
        let candidates = self.store.expired_reservations(now, SWEEP_BATCH).await?;
        let mut expired = 0;

        for reservation_id in candidates {
            match self.expire_one(reservation_id, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%reservation_id, error = %e, "failed to expire reservation");
                }
            }
        }

        let purged = self.store.purge_expired_holds(now).await?;
        if expired > 0 || purged > 0 {
            tracing::info!(expired, purged, "expired stale reservations");
        }
        Ok(expired)
    }

    /// Units available to sell: quantity-on-hand minus live holds.
    pub async fn available(&self, tenant_id: &TenantId, product_id: &ProductId) -> Result<u32> {
        let on_hand = self.ledger.quantity_on_hand(tenant_id, product_id).await?;
        let held = self
            .store
            .held_quantity(tenant_id, product_id, None, self.clock.now())
            .await?;
        Ok(on_hand.saturating_sub(held))
    }

    /// Loads a reservation.
    pub async fn get(&self, reservation_id: ReservationId) -> Result<Reservation> {
        self.store
            .get_reservation(reservation_id)
            .await?
            .ok_or(ReservationError::NotFound(reservation_id))
    }

    /// Claims the idempotency key for `reservation` before any stock is touched.
    ///
    /// Returns the reservation already bound to the key if it is still held
    /// or being committed. A binding whose reservation is not stored yet
    /// belongs to a concurrent call that is still reserving; it is polled on
    /// the lock retry schedule.
    async fn claim_key(&self, reservation: &Reservation) -> Result<Option<Reservation>> {
        let ttl = self.config.reservation_ttl;
        let attempts = self.config.lock_max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let now = self.clock.now();
            let Some(bound) = self
                .store
                .claim_idempotency_key(
                    &reservation.tenant_id,
                    &reservation.idempotency_key,
                    reservation.id,
                    ttl,
                    now,
                )
                .await?
            else {
                return Ok(None);
            };

            match self.store.get_reservation(bound).await? {
                Some(existing)
                    if existing.is_live(now)
                        || existing.status == ReservationStatus::Committing =>
                {
                    return Ok(Some(existing));
                }
                Some(_) => {
                    // Finished reservation; the key may start a new one
                    if self
                        .store
                        .replace_idempotency_key(
                            &reservation.tenant_id,
                            &reservation.idempotency_key,
                            bound,
                            reservation.id,
                            ttl,
                            now,
                        )
                        .await?
                    {
                        return Ok(None);
                    }
                }
                None => {
                    tracing::debug!(%bound, attempt, "idempotency key taken by a reserve in progress");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.lock_retry_delay).await;
            }
        }

        metrics::counter!("reservations_total", "outcome" => "key_in_flight").increment(1);
        tracing::warn!(attempts, "idempotency key stayed in flight");
        Err(ReservationError::KeyInFlight {
            idempotency_key: reservation.idempotency_key.clone(),
        })
    }

    async fn acquire_lock(&self, tenant_id: &TenantId, product_id: &ProductId) -> Result<ProductLock> {
        let lock = ProductLock::new(tenant_id.clone(), product_id.clone());
        let attempts = self.config.lock_max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            if self
                .store
                .try_acquire_lock(&lock, self.config.lock_ttl, self.clock.now())
                .await?
            {
                return Ok(lock);
            }
            if attempt < attempts {
                metrics::counter!("reservation_lock_retries_total").increment(1);
                tokio::time::sleep(self.config.lock_retry_delay).await;
            }
        }

        metrics::counter!("reservation_lock_timeouts_total").increment(1);
        tracing::warn!(
            %product_id,
            attempts,
            waited_ms = self.config.max_lock_wait().as_millis(),
            "product lock stayed busy"
        );
        Err(ReservationError::Contention {
            tenant_id: tenant_id.clone(),
            product_id: product_id.clone(),
            attempts,
        })
    }

    async fn unlock(&self, lock: &ProductLock) {
        if let Err(e) = self.store.release_lock(lock).await {
            // The lock TTL frees it eventually
            tracing::warn!(product_id = %lock.product_id, error = %e, "failed to release product lock");
        }
    }

    /// Checks availability for one line and writes its hold.
    ///
    /// Must be called with the product lock held. Returns the shortfall if
    /// the line cannot be held.
    async fn hold_under_lock(
        &self,
        reservation: &Reservation,
        item: &LineItem,
    ) -> Result<Option<UnavailableItem>> {
        let on_hand = self
            .ledger
            .quantity_on_hand(&reservation.tenant_id, &item.product_id)
            .await?;
        let held_by_others = self
            .store
            .held_quantity(
                &reservation.tenant_id,
                &item.product_id,
                Some(reservation.id),
                self.clock.now(),
            )
            .await?;
        let available = on_hand.saturating_sub(held_by_others);

        if available < item.quantity {
            return Ok(Some(UnavailableItem {
                product_id: item.product_id.clone(),
                requested: item.quantity,
                available,
            }));
        }

        self.store
            .put_hold(
                &reservation.tenant_id,
                &item.product_id,
                Hold {
                    reservation_id: reservation.id,
                    quantity: item.quantity,
                    expires_at: reservation.expires_at,
                },
            )
            .await?;
        Ok(None)
    }

    /// Best-effort cleanup after a reserve call that failed: drops its holds
    /// and frees its idempotency key for a retry.
    async fn abandon_attempt(&self, reservation: &Reservation, product_ids: &[ProductId]) {
        if !product_ids.is_empty()
            && let Err(e) = self
                .store
                .delete_holds(&reservation.tenant_id, reservation.id, product_ids)
                .await
        {
            // The holds still lapse at expires_at
            tracing::warn!(reservation_id = %reservation.id, error = %e, "failed to discard holds");
        }
        if let Err(e) = self
            .store
            .unbind_idempotency_key(
                &reservation.tenant_id,
                &reservation.idempotency_key,
                reservation.id,
            )
            .await
        {
            // The binding lapses with its TTL
            tracing::warn!(reservation_id = %reservation.id, error = %e, "failed to free idempotency key");
        }
    }

    async fn restore_held(&self, reservation_id: ReservationId) -> Result<bool> {
        self.store
            .transition(
                reservation_id,
                ReservationStatus::Committing,
                ReservationStatus::Held,
                None,
            )
            .await
    }

    async fn abort_quietly(&self, pending: PendingCommit) {
        if let Err(e) = self.abort_commit(pending).await {
            tracing::warn!(error = %e, "failed to unpin reservation after rollback");
        }
    }

    /// Explains why a `Held -> Committing` compare-and-set missed.
    async fn lost_commit_race(&self, reservation_id: ReservationId) -> ReservationError {
        match self.load_committable(reservation_id).await {
            Err(e) => e,
            // Pinned by a concurrent commit that has since been aborted
            Ok(_) => ReservationError::AlreadyTerminal {
                reservation_id,
                status: ReservationStatus::Committing,
            },
        }
    }

    async fn load_committable(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or(ReservationError::NotFound(reservation_id))?;

        match reservation.status {
            ReservationStatus::Held if reservation.expires_at > self.clock.now() => Ok(reservation),
            ReservationStatus::Held | ReservationStatus::Expired => {
                tracing::error!(
                    %reservation_id,
                    expires_at = %reservation.expires_at,
                    "commit requested for an expired reservation"
                );
                Err(ReservationError::NotFound(reservation_id))
            }
            status @ (ReservationStatus::Committing
            | ReservationStatus::Committed
            | ReservationStatus::Released) => {
                tracing::error!(%reservation_id, %status, "commit requested for a reservation that is not held");
                Err(ReservationError::AlreadyTerminal {
                    reservation_id,
                    status,
                })
            }
        }
    }

    async fn expire_one(
        &self,
        reservation_id: ReservationId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let Some(reservation) = self.store.get_reservation(reservation_id).await? else {
            // Lets the store drop index entries whose record is gone
            self.store
                .transition(
                    reservation_id,
                    ReservationStatus::Held,
                    ReservationStatus::Expired,
                    None,
                )
                .await?;
            return Ok(false);
        };

        match reservation.status {
            ReservationStatus::Held if !reservation.is_live(now) => {}
            ReservationStatus::Committing
                if reservation.expires_at + to_delta(self.config.reservation_ttl) <= now =>
            {
                return self.settle_stalled_commit(&reservation).await;
            }
            _ => return Ok(false),
        }

        let expired = self
            .store
            .transition(
                reservation_id,
                ReservationStatus::Held,
                ReservationStatus::Expired,
                None,
            )
            .await?;
        if !expired {
            return Ok(false);
        }

        self.store
            .delete_holds(
                &reservation.tenant_id,
                reservation_id,
                &reservation.product_ids(),
            )
            .await?;

        metrics::counter!("reservations_expired_total").increment(1);
        tracing::info!(%reservation_id, tenant_id = %reservation.tenant_id, "reservation expired");
        Ok(true)
    }

    /// Resolves a commit whose caller never reported back, using the ledger
    /// as the record of truth. Returns true if the reservation was expired.
    async fn settle_stalled_commit(&self, reservation: &Reservation) -> Result<bool> {
        let order = self.ledger.order_for_reservation(reservation.id).await?;
        let (to, order_id) = match &order {
            Some(order) => (ReservationStatus::Committed, Some(order.order_id)),
            None => (ReservationStatus::Expired, None),
        };

        let settled = self
            .store
            .transition(reservation.id, ReservationStatus::Committing, to, order_id)
            .await?;
        if !settled {
            return Ok(false);
        }

        self.store
            .delete_holds(
                &reservation.tenant_id,
                reservation.id,
                &reservation.product_ids(),
            )
            .await?;

        if order.is_some() {
            metrics::counter!("reservations_committed_total").increment(1);
            tracing::warn!(reservation_id = %reservation.id, "stalled commit found in the ledger; marked committed");
            Ok(false)
        } else {
            metrics::counter!("reservations_expired_total").increment(1);
            tracing::warn!(reservation_id = %reservation.id, "stalled commit never reached the ledger; reservation expired");
            Ok(true)
        }
    }
}
