//! Warden HTTP server binary.
//!
//! Loads (or seeds) the TOML config, opens the configured credential store
//! and serves the API, over HTTPS when `[http.tls]` is enabled, until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_api::AppState;
use warden_api::config::ApiConfig;
use warden_core::auth::jwt::TokenService;
use warden_core::config::{AuthSettings, TlsConfig, WardenConfig};
use warden_core::gate::AccessGate;
use warden_core::store::sweep::sweep_refresh_tokens;
use warden_core::store::{self, CredentialStore};

/// How long in-flight TLS connections get to finish after shutdown.
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// CLI arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "warden_server", about = "Warden HTTP server", version)]
struct Args {
    /// Config file. Written with defaults and a new secret if missing.
    #[arg(long, env = "WARDEN_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Override `[http].address`.
    #[arg(long)]
    address: Option<String>,

    /// Override `[http].port`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (mut config, created) = WardenConfig::load_or_init(&args.config)?;

    let default_filter = if config.debug {
        "info,warden_api=debug,warden_core=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if created {
        info!(path = %args.config.display(), "wrote default config with a new signing secret");
    }
    if let Some(address) = args.address {
        config.http.address = address;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }

    let backend = config.storage.backend()?;
    info!(config = %args.config.display(), ?backend, "starting warden_server");

    let repo = store::open(&config.storage).await?;
    let credentials = CredentialStore::new(repo, config.storage.operation_timeout());
    let shutdown = CancellationToken::new();
    tokio::spawn(sweep_refresh_tokens(
        credentials.clone(),
        config.storage.refresh_sweep_interval(),
        shutdown.clone(),
    ));

    let settings = Arc::new(AuthSettings::from_config(&config.protections)?);
    let gate = AccessGate::new(TokenService::new(settings, credentials));

    let api_config = ApiConfig::from_http(&config.http);
    let app = warden_api::router(AppState::new(gate, api_config.clone()));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for Ctrl-C: {e}");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    if config.http.tls.enabled {
        serve_tls(app, &api_config, &config.http.tls, shutdown).await?;
    } else {
        serve_plain(app, &api_config, shutdown).await?;
    }

    info!("server stopped");
    Ok(())
}

async fn serve_plain(
    app: Router,
    api_config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(&api_config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "REST API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

/// Load the PEM certificate chain and private key named in `[http.tls]`.
async fn load_tls(tls: &TlsConfig) -> std::io::Result<RustlsConfig> {
    RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file).await
}

async fn serve_tls(
    app: Router,
    api_config: &ApiConfig,
    tls: &TlsConfig,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let rustls = load_tls(tls).await?;
    let addr = api_config.socket_addr()?;

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
        }
    });

    info!(addr = %addr, cert = %tls.cert_file, "REST API listening with TLS");
    axum_server::bind_rustls(addr, rustls)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}
