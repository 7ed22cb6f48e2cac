//! Reservation tunables.

use std::time::Duration;

/// Converts a std duration into a chrono delta, saturating at one year.
pub(crate) fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Tunables for reservation holds, product locks and the expiry sweep.
#[derive(Debug, Clone)]
pub struct ReservationConfig {
    /// Lifetime of a reservation and its holds.
    pub reservation_ttl: Duration,
    /// Lifetime of a product lock; bounds how long a crashed holder blocks others.
    pub lock_ttl: Duration,
    /// Pause between lock attempts.
    pub lock_retry_delay: Duration,
    /// Retries after the first failed attempt before giving up.
    pub lock_max_retries: u32,
    /// How often the expiry sweep runs.
    pub sweep_interval: Duration,
    /// How long finished reservation records stay readable.
    pub record_retention: Duration,
    /// Namespace for keys in a shared store.
    pub key_prefix: String,
}

impl ReservationConfig {
    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_lock_retry(mut self, delay: Duration, max_retries: u32) -> Self {
        self.lock_retry_delay = delay;
        self.lock_max_retries = max_retries;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Worst-case time a reserve call spends waiting on one product lock.
    ///
    /// Saturates at `Duration::MAX` for absurd retry settings.
    pub fn max_lock_wait(&self) -> Duration {
        self.lock_retry_delay.saturating_mul(self.lock_max_retries)
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(10 * 60),
            lock_ttl: Duration::from_secs(5),
            lock_retry_delay: Duration::from_millis(100),
            lock_max_retries: 50,
            sweep_interval: Duration::from_secs(60),
            record_retention: Duration::from_secs(24 * 60 * 60),
            key_prefix: "inv".to_string(),
        }
    }
}
