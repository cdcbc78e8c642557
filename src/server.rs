//! Listener and accept loop
//!
//! One tokio task per accepted connection. A failing connection is logged
//! and dropped; the loop keeps accepting.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::mitm::ConnectionEngine;

pub struct ProxyServer {
    listener: TcpListener,
    engine: Arc<ConnectionEngine>,
}

impl ProxyServer {
    pub async fn bind(addr: &str, engine: Arc<ConnectionEngine>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind listener on {}", addr))?;

        Ok(Self { listener, engine })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Listener has no local address")
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Connections already handed to a task keep running to completion.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!(listen = %addr, "Proxy listening");
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!(peer = %peer_addr, "Accepted connection");

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            match engine.handle(stream).await {
                Ok(()) => debug!(peer = %peer_addr, "Connection closed"),
                Err(e) => warn!(
                    peer = %peer_addr,
                    error = %e,
                    kind = ?e.kind(),
                    "Connection failed"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::{
        bootstrap_chain, CertificateStore, ChainLink, EngineConfig, HostCertificateCache,
        UpstreamTlsConfig,
    };
    use secrecy::SecretString;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn engine() -> Arc<ConnectionEngine> {
        let mut store = CertificateStore::new(&SecretString::new("pw".to_string()));
        let links = vec!["root,Server Test Root".parse::<ChainLink>().unwrap()];
        let chain = bootstrap_chain(&mut store, &links).unwrap();
        Arc::new(ConnectionEngine::new(
            Arc::new(HostCertificateCache::new(chain)),
            UpstreamTlsConfig::new().unwrap(),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_stop_accept_loop() {
        let server = ProxyServer::bind("127.0.0.1:0", engine()).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"garbage\r\n\r\n").await.unwrap();
            let mut rest = Vec::new();
            // The engine closes the connection without a reply
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        }

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_has_context() {
        let err = match ProxyServer::bind("127.0.0.1:not-a-port", engine()).await {
            Ok(_) => panic!("bind should fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("Failed to bind listener"));
    }
}
