//! Redis reservation store integration tests
//!
//! These tests use a shared Redis container and need Docker.
//! Run with:
//!
//! ```bash
//! cargo test -p reservation --test redis_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{OrderId, ProductId, ReservationId, TenantId};
use reservation::{
    Hold, LineItem, ProductLock, RedisReservationStore, Reservation, ReservationConfig,
    ReservationManager, ReservationStatus, ReservationStore, ReserveOutcome,
};
use serial_test::serial;
use stock_ledger::{InMemoryStockLedger, StockLedger};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::{REDIS_PORT, Redis};
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Redis>,
    url: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Redis::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(REDIS_PORT).await.unwrap();

            Arc::new(ContainerInfo {
                container,
                url: format!("redis://{}:{}", host, port),
            })
        })
        .await
        .clone()
}

/// Each test gets its own key prefix instead of flushing the database
async fn get_test_store() -> (RedisReservationStore, ReservationConfig) {
    let info = get_container_info().await;
    let config =
        ReservationConfig::default().with_key_prefix(format!("test-{}", uuid::Uuid::new_v4()));
    let store = RedisReservationStore::connect(&info.url, &config)
        .await
        .unwrap();
    (store, config)
}

fn tenant() -> TenantId {
    TenantId::new("acme")
}

fn sku() -> ProductId {
    ProductId::new("SKU-001")
}

fn held_reservation(ttl: chrono::Duration) -> Reservation {
    let now = Utc::now();
    Reservation {
        id: ReservationId::new(),
        tenant_id: tenant(),
        idempotency_key: "checkout-1".to_string(),
        status: ReservationStatus::Held,
        created_at: now,
        expires_at: now + ttl,
        line_items: vec![LineItem::new("SKU-001", 2)],
        order_id: None,
    }
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn test_lock_is_exclusive_and_owner_checked() {
    let (store, _) = get_test_store().await;
    store.ping().await.unwrap();

    let first = ProductLock::new(tenant(), sku());
    let second = ProductLock::new(tenant(), sku());
    let ttl = Duration::from_secs(5);

    assert!(store.try_acquire_lock(&first, ttl, Utc::now()).await.unwrap());
    assert!(!store.try_acquire_lock(&second, ttl, Utc::now()).await.unwrap());

    store.release_lock(&second).await.unwrap();
    assert!(!store.try_acquire_lock(&second, ttl, Utc::now()).await.unwrap());

    store.release_lock(&first).await.unwrap();
    assert!(store.try_acquire_lock(&second, ttl, Utc::now()).await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn test_lock_lapses_after_ttl() {
    let (store, _) = get_test_store().await;
    let crashed = ProductLock::new(tenant(), sku());
    let next = ProductLock::new(tenant(), sku());

    store
        .try_acquire_lock(&crashed, Duration::from_millis(100), Utc::now())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        store
            .try_acquire_lock(&next, Duration::from_secs(5), Utc::now())
            .await
            .unwrap()
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn test_holds_sum_live_entries() {
    let (store, _) = get_test_store().await;
    let now = Utc::now();
    let live = Hold {
        reservation_id: ReservationId::new(),
        quantity: 3,
        expires_at: now + chrono::Duration::minutes(5),
    };
    let other = Hold {
        reservation_id: ReservationId::new(),
        quantity: 2,
        expires_at: now + chrono::Duration::minutes(5),
    };
    let stale = Hold {
        reservation_id: ReservationId::new(),
        quantity: 7,
        expires_at: now - chrono::Duration::seconds(1),
    };
    for hold in [live, other, stale] {
        store.put_hold(&tenant(), &sku(), hold).await.unwrap();
    }

    assert_eq!(
        store.held_quantity(&tenant(), &sku(), None, now).await.unwrap(),
        5
    );
    assert_eq!(
        store
            .held_quantity(&tenant(), &sku(), Some(live.reservation_id), now)
            .await
            .unwrap(),
        2
    );

    assert_eq!(store.purge_expired_holds(now).await.unwrap(), 1);

    store
        .delete_holds(&tenant(), live.reservation_id, &[sku()])
        .await
        .unwrap();
    assert_eq!(
        store.held_quantity(&tenant(), &sku(), None, now).await.unwrap(),
        2
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn test_reservation_record_transitions() {
    let (store, _) = get_test_store().await;
    let reservation = held_reservation(chrono::Duration::minutes(10));
    store.insert_reservation(&reservation).await.unwrap();

    let loaded = store.get_reservation(reservation.id).await.unwrap().unwrap();
    assert_eq!(loaded, reservation);

    let order_id = OrderId::new();
    assert!(
        store
            .transition(
                reservation.id,
                ReservationStatus::Held,
                ReservationStatus::Committing,
                None,
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
                None,
            )
            .await
            .unwrap()
    );
    assert!(
        store
            .transition(
                reservation.id,
                ReservationStatus::Committing,
                ReservationStatus::Committed,
                Some(order_id),
            )
            .await
            .unwrap()
    );

    let committed = store.get_reservation(reservation.id).await.unwrap().unwrap();
    assert_eq!(committed.status, ReservationStatus::Committed);
    assert_eq!(committed.order_id, Some(order_id));
    assert!(
        store
            .get_reservation(ReservationId::new())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn test_expired_index_lists_only_held_past_ttl() {
    let (store, _) = get_test_store().await;
    let expired = held_reservation(chrono::Duration::milliseconds(-1));
    let live = held_reservation(chrono::Duration::minutes(10));
    store.insert_reservation(&expired).await.unwrap();
    store.insert_reservation(&live).await.unwrap();

    let due = store.expired_reservations(Utc::now(), 100).await.unwrap();
    assert_eq!(due, vec![expired.id]);

    // A commit in flight keeps its index entry until it settles
    for (from, to) in [
        (ReservationStatus::Held, ReservationStatus::Committing),
        (ReservationStatus::Committing, ReservationStatus::Expired),
    ] {
        assert_eq!(
            store.expired_reservations(Utc::now(), 100).await.unwrap(),
            vec![expired.id]
        );
        assert!(store.transition(expired.id, from, to, None).await.unwrap());
    }
    assert!(
        store
            .expired_reservations(Utc::now(), 100)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn test_idempotency_claim() {
    let (store, _) = get_test_store().await;
    let now = Utc::now();
    let first = ReservationId::new();
    let second = ReservationId::new();
    let ttl = Duration::from_secs(60);

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

    assert!(
        !store
            .replace_idempotency_key(&tenant(), "k", second, first, ttl, now)
            .await
            .unwrap()
    );
    assert!(
        store
            .replace_idempotency_key(&tenant(), "k", first, second, ttl, now)
            .await
            .unwrap()
    );

    // A stale owner cannot free the key
    store
        .unbind_idempotency_key(&tenant(), "k", first)
        .await
        .unwrap();
    assert_eq!(
        store
            .claim_idempotency_key(&tenant(), "k", first, ttl, now)
            .await
            .unwrap(),
        Some(second)
    );

    store
        .unbind_idempotency_key(&tenant(), "k", second)
        .await
        .unwrap();
    assert_eq!(
        store
            .claim_idempotency_key(&tenant(), "k", first, ttl, now)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn test_corrupt_hold_is_skipped_when_summing() {
    let (store, config) = get_test_store().await;
    let now = Utc::now();
    let live = Hold {
        reservation_id: ReservationId::new(),
        quantity: 3,
        expires_at: now + chrono::Duration::minutes(5),
    };
    store.put_hold(&tenant(), &sku(), live).await.unwrap();

    let info = get_container_info().await;
    let mut conn = redis::Client::open(info.url.as_str())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    let holds_key = format!("{}:holds:{}:{}", config.key_prefix, tenant(), sku());
    let _: () = redis::cmd("HSET")
        .arg(&holds_key)
        .arg(ReservationId::new().to_string())
        .arg("not-a-hold")
        .query_async(&mut conn)
        .await
        .unwrap();

    assert_eq!(
        store.held_quantity(&tenant(), &sku(), None, now).await.unwrap(),
        3
    );
    assert_eq!(store.purge_expired_holds(now).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "requires docker"]
#[serial]
async fn test_manager_never_oversells_over_redis() {
    let (store, config) = get_test_store().await;
    let ledger = InMemoryStockLedger::new();
    ledger.set_quantity(&tenant(), &sku(), 5).await.unwrap();
    let manager = Arc::new(ReservationManager::new(
        store,
        ledger,
        config.with_lock_retry(Duration::from_millis(5), 2_000),
    ));

    let mut handles = Vec::new();
    for i in 0..20 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager
                .reserve(
                    &tenant(),
                    vec![LineItem::new("SKU-001", 1)],
                    &format!("checkout-{i}"),
                )
                .await
                .unwrap()
        }));
    }

    let mut reserved = Vec::new();
    for handle in handles {
        if let ReserveOutcome::Reserved { reservation_id, .. } = handle.await.unwrap() {
            reserved.push(reservation_id);
        }
    }
    assert_eq!(reserved.len(), 5);
    assert_eq!(manager.available(&tenant(), &sku()).await.unwrap(), 0);

    for reservation_id in reserved {
        manager.release(reservation_id).await.unwrap();
    }
    assert_eq!(manager.available(&tenant(), &sku()).await.unwrap(), 5);
}
