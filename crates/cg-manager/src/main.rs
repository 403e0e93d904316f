//! clustergate manager daemon
//!
//! Accepts agent tunnels and proxies cluster API traffic through them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cg_core::config::{self, DiscoveryMode, ManagerConfig};
use cg_core::{CredentialStore, ServiceDiscovery};
use cg_manager::transport::{client_tls_config, root_store};
use cg_manager::{
    build_router, DnsDiscovery, FileCredentialStore, ManagerState, MemoryCredentialStore,
    PeerManager, StaticDiscovery, TunnelPeerLinker,
};
use cg_tunnel::SessionConfig;

#[derive(Parser)]
#[command(name = "cg-manager")]
#[command(about = "clustergate manager daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Shared token for links between replicas (overrides config)
    #[arg(long, env = "CG_PEER_TOKEN", hide_env_values = true)]
    peer_token: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("clustergate manager starting...");

    let mut config = load_manager_config(args.config.as_ref())?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(token) = args.peer_token {
        config.peer.token = token;
    }
    config.validate().context("Invalid configuration")?;

    let store: Arc<dyn CredentialStore> = match &config.store.path {
        Some(path) => Arc::new(
            FileCredentialStore::open(path)
                .await
                .with_context(|| format!("Failed to open credential store {:?}", path))?,
        ),
        None => {
            tracing::warn!("No store path configured, credentials are kept in memory only");
            Arc::new(MemoryCredentialStore::new())
        }
    };

    let cancel = CancellationToken::new();
    let self_address = config.self_address();
    let state = ManagerState::new(config.clone(), store);

    let peers = if config.peer.token.is_empty() {
        tracing::warn!("No peer token configured, running as a lone replica");
        None
    } else {
        let discovery = build_discovery(&config, &cancel);
        let tls = match &config.peer.ca_file {
            Some(path) if config.peer.use_tls => {
                let pem = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read peer CA {:?}", path))?;
                Some(client_tls_config(root_store(Some(pem.as_str()))?)?)
            }
            _ => None,
        };
        let linker = TunnelPeerLinker::new(
            Arc::clone(&state.table),
            self_address.as_str(),
            config.peer.token.as_str(),
            config.register_path.as_str(),
            tls,
        )
        .with_backoff(config.backoff.clone())
        .with_session_config(SessionConfig::from(&config.heartbeat));

        let manager = Arc::new(PeerManager::new(
            self_address.as_str(),
            discovery,
            Arc::new(linker),
        ));
        manager.start().await;
        Some(manager)
    };

    let state = Arc::new(match &peers {
        Some(manager) => state.with_peer_manager(Arc::clone(manager)),
        None => state,
    });

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!(
        bind = %config.bind_address,
        self_address = %self_address,
        register_path = %config.register_path,
        "Listening"
    );

    let shutdown = cancel.clone();
    axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    if let Some(manager) = peers {
        manager.stop().await;
    }
    tracing::info!("clustergate manager shutdown complete");
    Ok(())
}

fn load_manager_config(path: Option<&PathBuf>) -> Result<ManagerConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            ManagerConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(ManagerConfig::default())
    }
}

fn build_discovery(config: &ManagerConfig, cancel: &CancellationToken) -> Arc<dyn ServiceDiscovery> {
    match (&config.discovery.mode, &config.discovery.dns_name) {
        (DiscoveryMode::Dns, Some(dns_name)) => {
            let discovery = Arc::new(DnsDiscovery::new(
                dns_name.as_str(),
                config.discovery.refresh_interval,
            ));
            tokio::spawn(Arc::clone(&discovery).run(cancel.clone()));
            discovery
        }
        _ => Arc::new(StaticDiscovery::new(config.discovery.members.clone())),
    }
}
