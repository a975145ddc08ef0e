//! Token bridge relayer - mirrors burns between an EVM bridge and a Solana
//! bridge program as exactly-once mints.
//!
//! Each direction runs a listener feeding an ordered queue and a relay worker
//! draining it; all durable state lives in Postgres.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod events;
mod metrics;
mod relay;
mod state;

use chain::evm::EvmAdapter;
use chain::solana::SolanaAdapter;
use chain::{ChainAdapter, ChainListener, EventSubscription};
use config::Settings;
use metrics::MetricsServer;
use relay::{AddressBook, RelayEngine, TokenMappings};
use state::{ActionLog, CursorStore, Leadership, PgStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting token bridge relayer v{}", env!("CARGO_PKG_VERSION"));

    let settings = match std::env::var("RELAYER_ENV") {
        Ok(env_name) => Settings::load_env(&env_name)?,
        Err(_) => Settings::load()?,
    };
    info!(
        "Loaded configuration with {} token mappings and {} linked accounts",
        settings.tokens.len(),
        settings.accounts.len()
    );

    // Durable state
    let store = Arc::new(PgStore::new(&settings.database).await?);
    info!("Database connection established");

    store.run_migrations().await?;
    info!("Database migrations complete");

    let lock = store
        .acquire_leadership(&settings.relayer.instance_id)
        .await
        .context("Cannot become the active relayer")?;

    let actions: Arc<dyn ActionLog> = store.clone();
    let cursors: Arc<dyn CursorStore> = store.clone();

    // Chains
    let evm: Arc<dyn ChainAdapter> = Arc::new(EvmAdapter::new(&settings.evm)?);
    let solana: Arc<dyn ChainAdapter> = Arc::new(SolanaAdapter::new(&settings.solana)?);
    info!("Chain adapters initialized");

    let mappings = Arc::new(TokenMappings::from_config(&settings.tokens)?);
    let accounts = Arc::new(AddressBook::from_config(&settings.accounts)?);
    info!("Registered {} token mappings", mappings.len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // One listener and one worker per direction
    for (source, destination) in [(evm.clone(), solana.clone()), (solana.clone(), evm.clone())] {
        let chain = source.chain();
        // Unfinished actions are resumed by the worker itself before it
        // drains the queue
        let engine = RelayEngine::new(
            source.clone(),
            destination,
            actions.clone(),
            cursors.clone(),
            mappings.clone(),
            accounts.clone(),
            settings.relayer.retry_policy(),
            shutdown_rx.clone(),
        );

        let from = cursors
            .resume_position(chain, settings.start_position(chain))
            .await?;
        let subscription = EventSubscription::new(source, from)
            .with_batch_size(settings.relayer.batch_size)
            .with_poll_interval(Duration::from_millis(settings.relayer.poll_interval_ms));

        let (queue_tx, queue_rx) = mpsc::channel(settings.relayer.queue_capacity);
        let listener = ChainListener::new(subscription, queue_tx);

        handles.push(tokio::spawn(engine.run(queue_rx)));
        handles.push(tokio::spawn(listener.listen(shutdown_rx.clone())));
    }

    // Housekeeping: archive settled actions past the retention window
    handles.push(tokio::spawn({
        let actions = actions.clone();
        let retention = chrono::Duration::hours(settings.relayer.retention_hours as i64);
        let interval = Duration::from_secs(settings.relayer.housekeeping_interval_secs);
        let shutdown = shutdown_rx.clone();
        async move {
            while relay::submitter::pause(&shutdown, interval).await {
                match actions.archive_completed(Utc::now() - retention).await {
                    Ok(0) => {}
                    Ok(n) => info!("Archived {} completed actions", n),
                    Err(e) => warn!("Archiving completed actions failed: {}", e),
                }
            }
        }
    }));

    // Health check loop, which also keeps the leadership connection alive
    let health_handle = tokio::spawn(health_loop(
        vec![evm.clone(), solana.clone()],
        actions.clone(),
        lock,
        Duration::from_secs(settings.relayer.health_check_interval_secs),
        shutdown_tx.clone(),
    ));

    // Ops surfaces
    if settings.api.enabled {
        let state = api::AppState {
            actions: actions.clone(),
            cursors: cursors.clone(),
            chains: vec![evm.clone(), solana.clone()],
        };
        let config = settings.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        });
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }

    if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    info!("Token bridge relayer is running");

    let mut stopped = shutdown_rx.clone();
    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received, stopping..."),
        _ = stopped.changed() => warn!("Leadership lost, stopping..."),
    }
    // Workers stop at their next durable state
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Task ended abnormally: {}", e);
        }
    }

    match health_handle.await {
        Ok(Some(lock)) => lock.release().await?,
        Ok(None) => {
            return Err(anyhow!(
                "Leadership lock lost; stopped so that another instance can take over"
            ))
        }
        Err(e) => warn!("Health task ended abnormally: {}", e),
    }

    info!("Token bridge relayer stopped");
    Ok(())
}

/// Periodic health checks. Returns the lock when stopped by shutdown, or
/// `None` after the lock was lost, in which case shutdown has been signalled.
async fn health_loop<L: Leadership>(
    chains: Vec<Arc<dyn ChainAdapter>>,
    actions: Arc<dyn ActionLog>,
    mut lock: L,
    interval: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
) -> Option<L> {
    let shutdown = shutdown_tx.subscribe();
    while relay::submitter::pause(&shutdown, interval).await {
        for chain in &chains {
            let healthy = chain.health_check().await;
            metrics::record_chain_health(chain.chain(), healthy);
            if !healthy {
                warn!("Chain {} health check failed", chain.chain());
                metrics::record_health_check_failure(chain.chain().as_str());
            }
        }

        if let Err(e) = actions.health_check().await {
            warn!("Database health check failed: {}", e);
            metrics::record_health_check_failure("database");
        }

        if let Err(e) = lock.ping().await {
            error!("Leadership lock lost, stopping all workers: {}", e);
            metrics::record_health_check_failure("leadership");
            let _ = shutdown_tx.send(true);
            return None;
        }
    }
    Some(lock)
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tokenbridge_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("RELAYER_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::error::{RelayerError, RelayerResult};
    use crate::events::ChainId;
    use crate::state::memory::MemoryStore;
    use async_trait::async_trait;

    struct FlakyLock {
        healthy_pings: u32,
    }

    #[async_trait]
    impl Leadership for FlakyLock {
        async fn ping(&mut self) -> RelayerResult<()> {
            if self.healthy_pings == 0 {
                return Err(RelayerError::Internal("connection reset".to_string()));
            }
            self.healthy_pings -= 1;
            Ok(())
        }
    }

    fn chains() -> Vec<Arc<dyn ChainAdapter>> {
        vec![Arc::new(MockChain::new(ChainId::Evm))]
    }

    #[tokio::test]
    async fn lost_leadership_stops_every_worker() {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let lock = FlakyLock { healthy_pings: 2 };

        let returned = tokio::time::timeout(
            Duration::from_secs(5),
            health_loop(
                chains(),
                Arc::new(MemoryStore::new()),
                lock,
                Duration::from_millis(2),
                Arc::new(shutdown_tx),
            ),
        )
        .await
        .expect("health loop should stop on its own");

        assert!(returned.is_none());
        assert!(*shutdown_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn shutdown_hands_the_lock_back_for_release() {
        let (shutdown_tx, _rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let handle = tokio::spawn(health_loop(
            chains(),
            Arc::new(MemoryStore::new()),
            FlakyLock { healthy_pings: u32::MAX },
            Duration::from_millis(2),
            shutdown_tx.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        let returned = handle.await.unwrap();
        assert!(returned.is_some());
    }
}
