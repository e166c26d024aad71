//! Daemon assembly
//!
//! `BrokerApp` and `LookupApp` wire config, listeners, protocol engines and
//! the HTTP admin surface together, and own the graceful shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::api;
use crate::broker::lookup_peer::{self, PeerIdentity};
use crate::broker::{self, Broker};
use crate::core::cli;
use crate::core::config::{BrokerConfig, LookupConfig};
use crate::core::constants::{APP_NAME, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::lookup::{self, LookupContext, RegistrationDb};

/// The running message daemon.
pub struct BrokerApp {
    pub broker: Arc<Broker>,
    pub shutdown: ShutdownService,
    pub tcp_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

impl BrokerApp {
    /// Entry point of `emberqd`.
    pub async fn run() -> Result<()> {
        let cli = cli::parse_broker();
        let config = BrokerConfig::load(&cli);
        init_logging(config.verbose);

        tracing::info!(version = env!("CARGO_PKG_VERSION"), "emberqd starting");
        let app = Self::start(config).await?;
        app.shutdown.install_signal_handlers();
        app.shutdown.wait().await;
        app.shutdown.shutdown().await;
        Ok(())
    }

    /// Bind listeners and launch every broker task.
    pub async fn start(config: BrokerConfig) -> Result<Self> {
        let shutdown = ShutdownService::new();

        let tcp_listener = TcpListener::bind(&config.tcp_address)
            .await
            .with_context(|| format!("failed to bind TCP address {}", config.tcp_address))?;
        let http_listener = TcpListener::bind(&config.http_address)
            .await
            .with_context(|| format!("failed to bind HTTP address {}", config.http_address))?;
        let tcp_addr = tcp_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let broker = Broker::new(config, shutdown.clone());

        let handle = tokio::spawn(broker::tcp::serve(
            Arc::clone(&broker),
            tcp_listener,
            shutdown.subscribe(),
        ));
        shutdown.register("broker-tcp", handle).await;

        let router = api::broker::routes(Arc::clone(&broker));
        let wait = shutdown.wait();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, router)
                .with_graceful_shutdown(wait)
                .await
            {
                tracing::error!(error = %e, "HTTP server error");
            }
        });
        shutdown.register("broker-http", handle).await;
        tracing::info!(address = %http_addr, "HTTP: listening");

        if !broker.config.lookupd_tcp_addresses.is_empty() {
            let identity = PeerIdentity {
                address: broadcast_address(&broker.config),
                tcp_port: tcp_addr.port(),
                http_port: http_addr.port(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            tracing::info!(
                lookupds = ?broker.config.lookupd_tcp_addresses,
                address = %identity.address,
                "Announcing to lookup daemons"
            );
            lookup_peer::spawn_peers(&broker, identity);
        }

        Ok(Self {
            broker,
            shutdown,
            tcp_addr,
            http_addr,
        })
    }
}

/// The running lookup daemon.
pub struct LookupApp {
    pub ctx: Arc<LookupContext>,
    pub shutdown: ShutdownService,
    pub tcp_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

impl LookupApp {
    /// Entry point of `emberq-lookupd`.
    pub async fn run() -> Result<()> {
        let cli = cli::parse_lookup();
        let config = LookupConfig::load(&cli);
        init_logging(config.verbose);

        tracing::info!(version = env!("CARGO_PKG_VERSION"), "emberq-lookupd starting");
        let app = Self::start(config).await?;
        app.shutdown.install_signal_handlers();
        app.shutdown.wait().await;
        app.shutdown.shutdown().await;
        Ok(())
    }

    /// Bind listeners and launch every lookup task.
    pub async fn start(config: LookupConfig) -> Result<Self> {
        let shutdown = ShutdownService::new();

        let tcp_listener = TcpListener::bind(&config.tcp_address)
            .await
            .with_context(|| format!("failed to bind TCP address {}", config.tcp_address))?;
        let http_listener = TcpListener::bind(&config.http_address)
            .await
            .with_context(|| format!("failed to bind HTTP address {}", config.http_address))?;
        let tcp_addr = tcp_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let ctx = Arc::new(LookupContext {
            db: RegistrationDb::new(config.inactive_producer_timeout),
            address: local_address(),
            tcp_port: tcp_addr.port(),
            http_port: http_addr.port(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });

        let handle = tokio::spawn(lookup::tcp::serve(
            Arc::clone(&ctx),
            tcp_listener,
            shutdown.subscribe(),
        ));
        shutdown.register("lookup-tcp", handle).await;

        let router = api::lookup::routes(Arc::clone(&ctx));
        let wait = shutdown.wait();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, router)
                .with_graceful_shutdown(wait)
                .await
            {
                tracing::error!(error = %e, "HTTP server error");
            }
        });
        shutdown.register("lookup-http", handle).await;
        tracing::info!(address = %http_addr, "HTTP: listening");

        Ok(Self {
            ctx,
            shutdown,
            tcp_addr,
            http_addr,
        })
    }
}

/// Address this broker advertises to lookup daemons.
fn broadcast_address(config: &BrokerConfig) -> String {
    if let Some(address) = &config.broadcast_address {
        return address.clone();
    }
    local_address()
}

fn local_address() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let default_filter = format!("{level},{APP_NAME}={level}");

    let filter = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or(default_filter);

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true)
        .compact()
        .with_env_filter(filter)
        .init();
}
