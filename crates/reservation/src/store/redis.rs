//! Redis-backed reservation store.
//!
//! Key layout, all under the configured prefix:
//! - `{prefix}:lock:{tenant}:{product}` string holding the lock token, `PX` lock TTL
//! - `{prefix}:holds:{tenant}:{product}` hash of reservation ID to `qty:expires_ms`
//! - `{prefix}:reservation:{id}` hash with `record` (JSON), `status` and `order_id`
//! - `{prefix}:reservations:held` sorted set of held or committing reservation IDs by expiry
//! - `{prefix}:idem:{tenant}:{key}` string holding a reservation ID

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::{OrderId, ProductId, ReservationId, TenantId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info, warn};

use crate::config::ReservationConfig;
use crate::error::{ReservationError, Result};
use crate::model::{Hold, ProductLock, Reservation};
use crate::state::ReservationStatus;
use crate::store::ReservationStore;

// Deletes KEYS[1] only while it still holds ARGV[1]; frees locks and idempotency bindings
const COMPARE_DELETE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

// KEYS[1] holds hash, ARGV: reservation id, encoded hold, key ttl in ms
const PUT_HOLD_SCRIPT: &str = r"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
local want = tonumber(ARGV[3])
if redis.call('PTTL', KEYS[1]) < want then
    redis.call('PEXPIRE', KEYS[1], want)
end
return 1
";

// KEYS: record hash, held index. ARGV: from, to, order id or '', reservation id, retention ms
const TRANSITION_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
    redis.call('ZREM', KEYS[2], ARGV[4])
    return 0
end
if current ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2])
if ARGV[3] ~= '' then
    redis.call('HSET', KEYS[1], 'order_id', ARGV[3])
end
if ARGV[2] ~= 'held' and ARGV[2] ~= 'committing' then
    redis.call('ZREM', KEYS[2], ARGV[4])
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
end
return 1
";

const CLAIM_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current then
    return current
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return false
";

// ARGV: current binding, new binding, ttl in ms
const REPLACE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
";

/// Reservation store backed by a shared Redis instance.
///
/// Every multi-step update runs as a Lua script or `MULTI` pipeline, so
/// concurrent workers on separate connections observe each step atomically.
#[derive(Clone)]
pub struct RedisReservationStore {
    conn: ConnectionManager,
    key_prefix: String,
    record_retention: Duration,
    compare_delete: Script,
    put_hold: Script,
    transition: Script,
    claim: Script,
    replace: Script,
}

impl RedisReservationStore {
    /// Connects to Redis at `url` using the prefix and retention from `config`.
    pub async fn connect(url: &str, config: &ReservationConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(prefix = %config.key_prefix, "Connected to Redis reservation store");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            record_retention: config.record_retention,
            compare_delete: Script::new(COMPARE_DELETE_SCRIPT),
            put_hold: Script::new(PUT_HOLD_SCRIPT),
            transition: Script::new(TRANSITION_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            replace: Script::new(REPLACE_SCRIPT),
        })
    }

    /// Round-trips a `PING`; used by readiness checks.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn lock_key(&self, tenant_id: &TenantId, product_id: &ProductId) -> String {
        format!("{}:lock:{}:{}", self.key_prefix, tenant_id, product_id)
    }

    fn holds_key(&self, tenant_id: &TenantId, product_id: &ProductId) -> String {
        format!("{}:holds:{}:{}", self.key_prefix, tenant_id, product_id)
    }

    fn reservation_key(&self, reservation_id: ReservationId) -> String {
        format!("{}:reservation:{}", self.key_prefix, reservation_id)
    }

    fn held_index_key(&self) -> String {
        format!("{}:reservations:held", self.key_prefix)
    }

    fn idempotency_key(&self, tenant_id: &TenantId, key: &str) -> String {
        format!("{}:idem:{}:{}", self.key_prefix, tenant_id, key)
    }

    fn retention_ms(&self) -> u64 {
        duration_ms(self.record_retention).max(1)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn encode_hold(hold: &Hold) -> String {
    format!("{}:{}", hold.quantity, hold.expires_at.timestamp_millis())
}

fn decode_hold(reservation_id: &str, value: &str) -> Result<Hold> {
    let corrupt = || ReservationError::Corrupt(format!("hold {reservation_id}={value}"));
    let (quantity, expires_ms) = value.split_once(':').ok_or_else(corrupt)?;
    let quantity = quantity.parse::<u32>().map_err(|_| corrupt())?;
    let expires_ms = expires_ms.parse::<i64>().map_err(|_| corrupt())?;
    let expires_at = Utc
        .timestamp_millis_opt(expires_ms)
        .single()
        .ok_or_else(corrupt)?;
    let reservation_id = reservation_id.parse().map_err(|_| corrupt())?;
    Ok(Hold {
        reservation_id,
        quantity,
        expires_at,
    })
}

/// Sums the live holds in a product's hold hash, skipping `exclude`.
///
/// Undecodable entries are logged and left for the purge to drop.
fn sum_live_holds(
    key: &str,
    entries: &HashMap<String, String>,
    exclude: Option<ReservationId>,
    now: DateTime<Utc>,
) -> u32 {
    let mut held = 0u32;
    for (reservation_id, value) in entries {
        match decode_hold(reservation_id, value) {
            Ok(hold) if exclude != Some(hold.reservation_id) && hold.is_live(now) => {
                held = held.saturating_add(hold.quantity);
            }
            Ok(_) => {}
            Err(e) => warn!(key = %key, error = %e, "Skipping undecodable hold"),
        }
    }
    held
}

fn parse_binding(id: &str) -> Result<ReservationId> {
    id.parse()
        .map_err(|_| ReservationError::Corrupt(format!("idempotency binding {id}")))
}

/// Milliseconds from `now` until `until`, at least one.
fn remaining_ms(until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (until - now).num_milliseconds().max(1)
}

#[async_trait]
impl ReservationStore for RedisReservationStore {
    async fn try_acquire_lock(
        &self,
        lock: &ProductLock,
        ttl: Duration,
        _now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(&lock.tenant_id, &lock.product_id))
            .arg(lock.token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(duration_ms(ttl).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_lock(&self, lock: &ProductLock) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_delete
            .key(self.lock_key(&lock.tenant_id, &lock.product_id))
            .arg(lock.token.to_string())
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            debug!(
                tenant_id = %lock.tenant_id,
                product_id = %lock.product_id,
                "Lock already lapsed or taken over"
            );
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
        let mut conn = self.conn.clone();
        let key = self.holds_key(tenant_id, product_id);
        let entries: HashMap<String, String> = conn.hgetall(&key).await?;
        Ok(sum_live_holds(&key, &entries, exclude, now))
    }

    async fn put_hold(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        hold: Hold,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl_ms = remaining_ms(hold.expires_at, Utc::now());
        let _: i64 = self
            .put_hold
            .key(self.holds_key(tenant_id, product_id))
            .arg(hold.reservation_id.to_string())
            .arg(encode_hold(&hold))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_holds(
        &self,
        tenant_id: &TenantId,
        reservation_id: ReservationId,
        product_ids: &[ProductId],
    ) -> Result<()> {
        if product_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for product_id in product_ids {
            pipe.cmd("HDEL")
                .arg(self.holds_key(tenant_id, product_id))
                .arg(reservation_id.to_string())
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn purge_expired_holds(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:holds:*", self.key_prefix);
        let mut cursor = 0u64;
        let mut purged = 0usize;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let entries: HashMap<String, String> = conn.hgetall(&key).await?;
                let mut stale = Vec::new();
                for (reservation_id, value) in &entries {
                    match decode_hold(reservation_id, value) {
                        Ok(hold) if hold.is_live(now) => {}
                        Ok(_) => stale.push(reservation_id.clone()),
                        Err(e) => {
                            warn!(key = %key, error = %e, "Dropping undecodable hold");
                            stale.push(reservation_id.clone());
                        }
                    }
                }
                if !stale.is_empty() {
                    let removed: usize = conn.hdel(&key, &stale).await?;
                    purged += removed;
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(purged)
    }

    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.reservation_key(reservation.id);
        let record = serde_json::to_string(reservation)?;
        let ttl_ms = remaining_ms(reservation.expires_at, reservation.created_at)
            .saturating_add(i64::try_from(self.retention_ms()).unwrap_or(i64::MAX));

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("record")
            .arg(record)
            .arg("status")
            .arg(reservation.status.as_str())
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(ttl_ms)
            .ignore()
            .cmd("ZADD")
            .arg(self.held_index_key())
            .arg(reservation.expires_at.timestamp_millis())
            .arg(reservation.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(self.reservation_key(reservation_id)).await?;

        let Some(record) = fields.get("record") else {
            return Ok(None);
        };
        let mut reservation: Reservation = serde_json::from_str(record)?;

        if let Some(status) = fields.get("status") {
            reservation.status = status.parse().map_err(ReservationError::Corrupt)?;
        }
        if let Some(order_id) = fields.get("order_id") {
            let order_id: OrderId = order_id
                .parse()
                .map_err(|_| ReservationError::Corrupt(format!("order_id {order_id}")))?;
            reservation.order_id = Some(order_id);
        }
        Ok(Some(reservation))
    }

    async fn transition(
        &self,
        reservation_id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
        order_id: Option<OrderId>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let order_id = order_id.map(|id| id.to_string()).unwrap_or_default();
        let applied: i64 = self
            .transition
            .key(self.reservation_key(reservation_id))
            .key(self.held_index_key())
            .arg(from.as_str())
            .arg(to.as_str())
            .arg(order_id)
            .arg(reservation_id.to_string())
            .arg(self.retention_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.held_index_key())
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        ids.iter()
            .map(|id| {
                id.parse()
                    .map_err(|_| ReservationError::Corrupt(format!("held index entry {id}")))
            })
            .collect()
    }

    async fn claim_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        reservation_id: ReservationId,
        ttl: Duration,
        _now: DateTime<Utc>,
    ) -> Result<Option<ReservationId>> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = self
            .claim
            .key(self.idempotency_key(tenant_id, key))
            .arg(reservation_id.to_string())
            .arg(duration_ms(ttl).max(1))
            .invoke_async(&mut conn)
            .await?;
        existing.as_deref().map(parse_binding).transpose()
    }

    async fn replace_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        current: ReservationId,
        reservation_id: ReservationId,
        ttl: Duration,
        _now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let replaced: i64 = self
            .replace
            .key(self.idempotency_key(tenant_id, key))
            .arg(current.to_string())
            .arg(reservation_id.to_string())
            .arg(duration_ms(ttl).max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(replaced == 1)
    }

    async fn unbind_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
        reservation_id: ReservationId,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .compare_delete
            .key(self.idempotency_key(tenant_id, key))
            .arg(reservation_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_encoding_round_trips_to_the_millisecond() {
        let expires_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let hold = Hold {
            reservation_id: ReservationId::new(),
            quantity: 3,
            expires_at,
        };

        let decoded = decode_hold(&hold.reservation_id.to_string(), &encode_hold(&hold)).unwrap();
        assert_eq!(decoded, hold);
    }

    #[test]
    fn malformed_hold_is_corrupt() {
        let id = ReservationId::new().to_string();
        assert!(matches!(
            decode_hold(&id, "three"),
            Err(ReservationError::Corrupt(_))
        ));
        assert!(matches!(
            decode_hold("not-a-uuid", "1:0"),
            Err(ReservationError::Corrupt(_))
        ));
    }

    #[test]
    fn corrupt_hold_does_not_hide_the_others() {
        let now = Utc::now();
        let live = Hold {
            reservation_id: ReservationId::new(),
            quantity: 2,
            expires_at: now + chrono::Duration::minutes(5),
        };
        let excluded = Hold {
            reservation_id: ReservationId::new(),
            quantity: 7,
            expires_at: now + chrono::Duration::minutes(5),
        };
        let entries: HashMap<String, String> = [
            (live.reservation_id.to_string(), encode_hold(&live)),
            (excluded.reservation_id.to_string(), encode_hold(&excluded)),
            (ReservationId::new().to_string(), "garbage".to_string()),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            sum_live_holds("inv:holds:acme:SKU-A", &entries, Some(excluded.reservation_id), now),
            2
        );
    }
}
