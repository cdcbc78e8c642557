use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::info;

use interloper::{bootstrap_chain, CertificateStore, ChainLink};

/// Create a root certificate and a chain of signing certificates below it
///
/// Each LINK is `alias,commonName`. The first link becomes a self-signed
/// root, every later link is signed by the one before it. The last link is
/// the signer the proxy issues host certificates with.
#[derive(Parser)]
#[command(name = "build-root-chain")]
#[command(about = "Bootstrap the proxy's authority chain in a certificate store", long_about = None)]
struct Cli {
    /// Certificate store file; created when missing
    #[arg(short, long)]
    store: PathBuf,

    /// Store password
    #[arg(short, long)]
    password: String,

    /// Write the root certificate as PEM here, for client trust stores
    #[arg(long)]
    export_root: Option<PathBuf>,

    /// `alias,commonName` pairs, root first
    #[arg(required = true, value_name = "LINK")]
    links: Vec<ChainLink>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let password = SecretString::new(cli.password);

    let mut store = if cli.store.exists() {
        info!(store = %cli.store.display(), "Opening existing certificate store");
        CertificateStore::open(&cli.store, &password)
            .with_context(|| format!("Failed to open {}", cli.store.display()))?
    } else {
        info!(store = %cli.store.display(), "Creating certificate store");
        CertificateStore::new(&password)
    };

    let chain = bootstrap_chain(&mut store, &cli.links).context("Failed to build chain")?;

    store
        .save(&cli.store)
        .with_context(|| format!("Failed to save {}", cli.store.display()))?;

    info!(
        store = %cli.store.display(),
        chain_length = chain.len(),
        "Authority chain written"
    );

    if let Some(path) = cli.export_root {
        std::fs::write(&path, chain.root().certificate_pem())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Root certificate exported");
    }

    let aliases: Vec<&str> = cli.links.iter().map(|link| link.alias.as_str()).collect();
    println!("SIGNER_ALIASES={}", aliases.join(","));

    Ok(())
}
