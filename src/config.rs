use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::mitm::EngineConfig;

#[derive(Debug)]
pub struct Config {
    // Listener
    pub host: String,
    pub port: u16,

    // Certificate store holding the authority chain
    pub keystore_path: PathBuf,
    pub keystore_password: SecretString,
    /// Store aliases, root first, signer last
    pub signer_aliases: Vec<String>,

    // Connection engine
    pub io_timeout_seconds: u64,
    pub transfer_buffer_size: usize,
    pub max_header_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let host = env::var("PROXY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PROXY_PORT")
            .unwrap_or_else(|_| "3128".to_string())
            .parse()
            .context("Invalid PROXY_PORT")?;

        let keystore_path = env::var("KEYSTORE_PATH")
            .map(PathBuf::from)
            .context("KEYSTORE_PATH must be set")?;

        let keystore_password = env::var("KEYSTORE_PASSWORD")
            .map(SecretString::new)
            .context("KEYSTORE_PASSWORD must be set")?;

        let signer_aliases = env::var("SIGNER_ALIASES")
            .context("SIGNER_ALIASES must be set")
            .map(|raw| parse_aliases(&raw))?;

        let io_timeout_seconds = env::var("IO_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Invalid IO_TIMEOUT_SECONDS")?;

        let transfer_buffer_size = env::var("TRANSFER_BUFFER_SIZE")
            .unwrap_or_else(|_| "10240".to_string())
            .parse()
            .context("Invalid TRANSFER_BUFFER_SIZE")?;

        let max_header_bytes = env::var("MAX_HEADER_BYTES")
            .unwrap_or_else(|_| "65536".to_string())
            .parse()
            .context("Invalid MAX_HEADER_BYTES")?;

        let config = Config {
            host,
            port,
            keystore_path,
            keystore_password,
            signer_aliases,
            io_timeout_seconds,
            transfer_buffer_size,
            max_header_bytes,
        };
        config.validate()?;

        tracing::debug!(
            listen = %config.listen_addr(),
            keystore = %config.keystore_path.display(),
            chain_length = config.signer_aliases.len(),
            "Configuration loaded from environment"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("PROXY_PORT must be between 1 and 65535"));
        }

        if self.keystore_password.expose_secret().is_empty() {
            return Err(anyhow::anyhow!("KEYSTORE_PASSWORD cannot be empty"));
        }

        if self.signer_aliases.is_empty() {
            return Err(anyhow::anyhow!(
                "SIGNER_ALIASES must name at least one store alias (root first)"
            ));
        }

        if let Some(position) = self.signer_aliases.iter().position(|a| a.is_empty()) {
            return Err(anyhow::anyhow!(
                "SIGNER_ALIASES entry {} is empty",
                position + 1
            ));
        }

        if self.io_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("IO_TIMEOUT_SECONDS must be greater than 0"));
        }

        if self.transfer_buffer_size == 0 {
            return Err(anyhow::anyhow!("TRANSFER_BUFFER_SIZE must be greater than 0"));
        }

        if self.max_header_bytes == 0 {
            return Err(anyhow::anyhow!("MAX_HEADER_BYTES must be greater than 0"));
        }

        Ok(())
    }

    /// `host:port` string for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            io_timeout: Duration::from_secs(self.io_timeout_seconds),
            transfer_buffer_size: self.transfer_buffer_size,
            max_header_bytes: self.max_header_bytes,
        }
    }
}

/// Comma-separated alias list; surrounding whitespace is dropped
fn parse_aliases(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',').map(|alias| alias.trim().to_string()).collect()
}
