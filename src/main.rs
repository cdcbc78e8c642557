use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use interloper::{
    AuthorityChain, CertificateStore, Config, ConnectionEngine, HostCertificateCache,
    ProxyServer, UpstreamTlsConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting {} v{}", interloper::NAME, interloper::VERSION);

    let config = Config::from_env()?;

    let store = CertificateStore::open(&config.keystore_path, &config.keystore_password)
        .with_context(|| {
            format!(
                "Failed to open certificate store {}",
                config.keystore_path.display()
            )
        })?;

    let authority = AuthorityChain::load(&store, &config.signer_aliases)
        .context("Failed to load authority chain")?;
    info!(
        chain_length = authority.len(),
        signer = %authority.signer().common_name().unwrap_or_default(),
        root = %authority.root().common_name().unwrap_or_default(),
        "Issuing leaf certificates from signer"
    );

    let upstream_tls = UpstreamTlsConfig::new().context("Failed to build upstream TLS config")?;
    let engine = Arc::new(ConnectionEngine::new(
        Arc::new(HostCertificateCache::new(authority)),
        upstream_tls,
        config.engine_config(),
    ));

    let server = ProxyServer::bind(&config.listen_addr(), Arc::clone(&engine)).await?;
    server.run_until(shutdown_signal()).await?;

    let stats = engine.cache().stats();
    info!(
        hosts = stats.hosts,
        hits = stats.hits,
        misses = stats.misses,
        issued = stats.issued,
        "Proxy stopped"
    );

    Ok(())
}

async fn shutdown_signal() {
    // Handle SIGINT (Ctrl+C)
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
