//! API server entry point.

use api::config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use reservation::{
    ExpirySweeper, InMemoryReservationStore, RedisReservationStore, ReservationStore,
};
use sqlx::postgres::PgPoolOptions;
use stock_ledger::{InMemoryStockLedger, PostgresStockLedger, StockLedger};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the durable ledger
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let ledger = PostgresStockLedger::new(pool);
            ledger
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL stock ledger");
            with_store(config, ledger, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stock ledger");
            with_store(config, InMemoryStockLedger::new(), metrics_handle).await;
        }
    }
}

/// Picks the reservation store, then serves.
async fn with_store<L>(config: Config, ledger: L, metrics_handle: PrometheusHandle)
where
    L: StockLedger + 'static,
{
    match config.redis_url.clone() {
        Some(url) => {
            let store = RedisReservationStore::connect(&url, &config.reservation)
                .await
                .expect("failed to connect to Redis");
            store.ping().await.expect("Redis did not answer PING");
            serve(config, store, ledger, metrics_handle).await;
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory reservation store");
            let store = InMemoryReservationStore::new()
                .with_record_retention(config.reservation.record_retention);
            serve(config, store, ledger, metrics_handle).await;
        }
    }
}

async fn serve<S, L>(config: Config, store: S, ledger: L, metrics_handle: PrometheusHandle)
where
    S: ReservationStore + 'static,
    L: StockLedger + 'static,
{
    let state = api::create_state(
        store,
        ledger,
        config.reservation.clone(),
        config.pricing.clone(),
    );

    // 4. Start the expiry sweeper
    let sweeper = ExpirySweeper::new(state.reservations.clone()).spawn();

    // 5. Build the application and start the server
    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    sweeper.abort();
    tracing::info!("server shut down gracefully");
}
