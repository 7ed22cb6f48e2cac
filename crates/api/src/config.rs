//! Application configuration loaded from environment variables.

use std::time::Duration;

use checkout::PricingConfig;
use common::Money;
use reservation::ReservationConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL stock ledger; in-memory when unset
/// - `REDIS_URL`: Redis reservation store; in-memory when unset
/// - `RESERVATION_TTL_SECS`, `LOCK_TTL_MS`, `LOCK_RETRY_DELAY_MS`,
///   `LOCK_MAX_RETRIES`, `SWEEP_INTERVAL_SECS`: reservation tunables
/// - `SHIPPING_FEE_CENTS`, `FREE_SHIPPING_THRESHOLD_CENTS`: pricing
///
/// Malformed values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub reservation: ReservationConfig,
    pub pricing: PricingConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base = defaults.reservation;
        let reservation = base
            .clone()
            .with_reservation_ttl(
                parsed("RESERVATION_TTL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(base.reservation_ttl),
            )
            .with_lock_ttl(
                parsed("LOCK_TTL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(base.lock_ttl),
            )
            .with_lock_retry(
                parsed("LOCK_RETRY_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(base.lock_retry_delay),
                parsed("LOCK_MAX_RETRIES")
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(base.lock_max_retries),
            )
            .with_sweep_interval(
                parsed("SWEEP_INTERVAL_SECS")
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(base.sweep_interval),
            );

        let cents = |key: &str, fallback: Money| {
            lookup(key)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|c| *c >= 0)
                .map(Money::from_cents)
                .unwrap_or(fallback)
        };
        let pricing = PricingConfig {
            flat_shipping_fee: cents("SHIPPING_FEE_CENTS", defaults.pricing.flat_shipping_fee),
            free_shipping_threshold: cents(
                "FREE_SHIPPING_THRESHOLD_CENTS",
                defaults.pricing.free_shipping_threshold,
            ),
            ..defaults.pricing
        };

        Self {
            host: non_empty("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: non_empty("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            reservation,
            pricing,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            redis_url: None,
            reservation: ReservationConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}
