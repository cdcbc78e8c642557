//! MITM Interceptor - connection engine
//!
//! Drives one accepted client connection from its first request to close:
//! 1. Read a request header from the client
//! 2. On `CONNECT`, answer 200, upgrade the client to TLS with a minted
//!    identity, open TLS to the real host and keep going inside the tunnel
//! 3. Otherwise relay the request (header, then body) upstream, then the
//!    response back, and loop while the response asks for keep-alive
//!
//! Everything inside a connection is strictly sequential: a request is
//! fully sent before its response is read.

use crate::mitm::{
    cert_cache::HostCertificateCache,
    chunked::ChunkedDecoder,
    error::{MitmError, Result},
    http_parser::{latin1_bytes, HeaderFields, HeaderMessage, HeaderProcessor, MessageKind},
    stream::{BoxedStream, PrefixedStream},
    tls_config::{self, UpstreamTlsConfig},
};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};
use url::Url;

/// Reply sent to every accepted `CONNECT`
pub const CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

/// Port used for absolute URLs that name none
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Runtime knobs for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on every read, write, connect and handshake
    pub io_timeout: Duration,
    /// Size of the per-connection transfer buffer
    pub transfer_buffer_size: usize,
    /// Bound on one header section
    pub max_header_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(10),
            transfer_buffer_size: 10 * 1024,
            max_header_bytes: crate::mitm::http_parser::DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

/// Shared, immutable engine state; one per proxy
pub struct ConnectionEngine {
    cache: Arc<HostCertificateCache>,
    upstream_tls: UpstreamTlsConfig,
    config: EngineConfig,
}

impl ConnectionEngine {
    pub fn new(
        cache: Arc<HostCertificateCache>,
        upstream_tls: UpstreamTlsConfig,
        config: EngineConfig,
    ) -> Self {
        Self {
            cache,
            upstream_tls,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<HostCertificateCache> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Serve one client connection until it closes or fails
    ///
    /// Both transports are shut down before returning, on success or error.
    pub async fn handle<S>(&self, client: S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = Session::new(self, Box::new(client));
        let result = session.run().await;
        session.close().await;
        result
    }
}

/// Parse a `CONNECT` target: `host:port`, `[v6]:port`
///
/// Splits on the last colon. Brackets around an IPv6 literal are removed.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let (host, port_str) = authority.rsplit_once(':').ok_or_else(|| {
        MitmError::protocol(format!("CONNECT target '{}' is not host:port", authority))
    })?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        return Err(MitmError::protocol(format!(
            "CONNECT target '{}' has an empty host",
            authority
        )));
    }

    let port: u16 = port_str.parse().map_err(|_| {
        MitmError::protocol(format!(
            "invalid port '{}': must be a number between 1 and 65535",
            port_str
        ))
    })?;

    if port == 0 {
        return Err(MitmError::protocol("invalid port: must be between 1 and 65535"));
    }

    Ok((host.to_string(), port))
}

/// Host, port and origin-form resource of an absolute request URL
pub fn parse_absolute_url(resource: &str) -> Result<(String, u16, String)> {
    let url = Url::parse(resource)
        .map_err(|e| MitmError::protocol(format!("invalid request URL '{}': {}", resource, e)))?;

    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(addr)) => addr.to_string(),
        Some(url::Host::Ipv6(addr)) => addr.to_string(),
        None => {
            return Err(MitmError::protocol(format!(
                "request URL '{}' has no host",
                resource
            )))
        }
    };

    let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok((host, port, path))
}

/// Serialize a header section for forwarding
///
/// A `Proxy-Connection` field is also emitted as `Connection`, just before it.
pub fn encode_header(start_line: &str, fields: &HeaderFields) -> Vec<u8> {
    let mut out = Vec::with_capacity(start_line.len() + fields.len() * 32 + 4);

    out.extend(latin1_bytes(start_line));
    out.extend_from_slice(b"\r\n");

    for (name, value) in fields.iter() {
        if name.eq_ignore_ascii_case("Proxy-Connection") {
            out.extend_from_slice(b"Connection: ");
            out.extend(latin1_bytes(value));
            out.extend_from_slice(b"\r\n");
        }
        out.extend(latin1_bytes(name));
        out.extend_from_slice(b": ");
        out.extend(latin1_bytes(value));
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    out
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    pub fn for_request(request: &HeaderMessage) -> Self {
        if let Some(length) = request.content_length {
            Self::ContentLength(length)
        } else if request.chunked {
            Self::Chunked
        } else {
            Self::Empty
        }
    }

    pub fn for_response(response: &HeaderMessage, request_method: &str) -> Self {
        let forbids_body = response
            .status_line()
            .is_some_and(|status| status.forbids_body());

        if forbids_body || request_method.eq_ignore_ascii_case("HEAD") {
            Self::Empty
        } else if let Some(length) = response.content_length {
            Self::ContentLength(length)
        } else if response.chunked {
            Self::Chunked
        } else {
            Self::UntilClose
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Upstream,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Self::Client => Self::Upstream,
            Self::Upstream => Self::Client,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Plain,
    Tunnel { host: String },
}

/// Per-connection state
struct Session<'a> {
    engine: &'a ConnectionEngine,
    client: Option<BoxedStream>,
    upstream: Option<BoxedStream>,
    phase: Phase,
    buffer: Vec<u8>,
    /// Bytes read past the end of the last message, per side
    client_carry: BytesMut,
    upstream_carry: BytesMut,
}

impl<'a> Session<'a> {
    fn new(engine: &'a ConnectionEngine, client: BoxedStream) -> Self {
        Self {
            engine,
            client: Some(client),
            upstream: None,
            phase: Phase::Plain,
            buffer: vec![0u8; engine.config.transfer_buffer_size.max(1)],
            client_carry: BytesMut::new(),
            upstream_carry: BytesMut::new(),
        }
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let Some(request) = self.read_header(Side::Client).await? else {
                debug!("Client closed the connection");
                return Ok(());
            };

            let Some(line) = request.request_line().cloned() else {
                return Err(MitmError::protocol("expected a request line"));
            };

            if line.is_connect() {
                self.establish_tunnel(&line.resource, request.body_prefix.clone())
                    .await?;
                continue;
            }

            let opens_upstream = self.phase == Phase::Plain && self.upstream.is_none();
            let resource = if opens_upstream {
                let (host, port, path) = parse_absolute_url(&line.resource)?;
                let stream = connect_tcp(self.engine.config.io_timeout, &host, port).await?;
                self.upstream = Some(Box::new(stream));
                debug!(target_host = %host, target_port = port, "Plain upstream connected");
                path
            } else {
                line.resource.clone()
            };

            debug!(
                method = %line.method,
                resource = %resource,
                phase = ?self.phase,
                "Relaying request"
            );

            let header = encode_header(
                &format!("{} {} HTTP/1.1", line.method, resource),
                &request.fields,
            );
            self.write_bytes(Side::Upstream, &header).await?;
            self.relay_body(
                Side::Client,
                BodyFraming::for_request(&request),
                request.body_prefix.clone(),
            )
            .await?;

            let response = self
                .read_header(Side::Upstream)
                .await?
                .ok_or(MitmError::UnexpectedEof { peer: "upstream" })?;
            let Some(status) = response.status_line() else {
                return Err(MitmError::protocol("expected a status line"));
            };

            debug!(
                status = status.status_code,
                keep_alive = response.keep_alive,
                "Relaying response"
            );

            let header = encode_header(
                &format!("{} {} {}", status.protocol, status.status_code, status.reason),
                &response.fields,
            );
            self.write_bytes(Side::Client, &header).await?;

            let framing = BodyFraming::for_response(&response, &line.method);
            self.relay_body(Side::Upstream, framing, response.body_prefix.clone())
                .await?;

            if !response.keep_alive || framing == BodyFraming::UntilClose {
                debug!("Response ends the connection");
                return Ok(());
            }
        }
    }

    /// Answer a `CONNECT`, then swap both transports for TLS
    async fn establish_tunnel(&mut self, authority: &str, early_bytes: Bytes) -> Result<()> {
        if let Phase::Tunnel { host } = &self.phase {
            return Err(MitmError::protocol(format!(
                "CONNECT inside the tunnel to {}",
                host
            )));
        }

        let (host, port) = parse_authority(authority)?;

        self.write_bytes(Side::Client, CONNECT_RESPONSE).await?;

        let identity = self.engine.cache.get_identity(&host).await?;

        let plain = self
            .client
            .take()
            .ok_or(MitmError::UnexpectedEof { peer: "client" })?;
        let plain: BoxedStream = if early_bytes.is_empty() {
            plain
        } else {
            Box::new(PrefixedStream::new(early_bytes, plain))
        };

        let timeout = self.engine.config.io_timeout;
        let acceptor = TlsAcceptor::from(identity.server_config());
        let client_tls = deadline(timeout, "client TLS handshake", acceptor.accept(plain))
            .await?
            .map_err(|e| MitmError::tls_handshake(&host, e))?;
        self.client = Some(Box::new(client_tls));

        // Anything left from a plain-HTTP exchange belongs to the old upstream
        if let Some(mut old) = self.upstream.take() {
            let _ = tokio::time::timeout(timeout, old.shutdown()).await;
        }
        self.upstream_carry.clear();

        let tcp = connect_tcp(timeout, &host, port).await?;
        let connector = TlsConnector::from(self.engine.upstream_tls.client_config());
        let server_name = tls_config::server_name(&host)?;
        let upstream_tls = deadline(
            timeout,
            "upstream TLS handshake",
            connector.connect(server_name, tcp),
        )
        .await?
        .map_err(|e| MitmError::tls_handshake(&host, e))?;
        self.upstream = Some(Box::new(upstream_tls));

        info!(target_host = %host, target_port = port, "Tunnel established");
        self.phase = Phase::Tunnel { host };
        Ok(())
    }

    /// Read one header section from `side`
    ///
    /// `Ok(None)` means the client closed cleanly before sending anything.
    async fn read_header(&mut self, side: Side) -> Result<Option<HeaderMessage>> {
        let kind = match side {
            Side::Client => MessageKind::Request,
            Side::Upstream => MessageKind::Response,
        };
        let mut processor = HeaderProcessor::with_limit(kind, self.engine.config.max_header_bytes);

        let carried = self.carry_mut(side).split();
        let mut received_any = !carried.is_empty();
        if received_any && processor.feed(&carried)? {
            return Ok(processor.into_message());
        }

        loop {
            let n = self.read_into_buffer(side, usize::MAX).await?;
            if n == 0 {
                if side == Side::Client && !received_any {
                    return Ok(None);
                }
                return Err(MitmError::UnexpectedEof { peer: side.label() });
            }
            received_any = true;

            if processor.feed(&self.buffer[..n])? {
                return Ok(processor.into_message());
            }
        }
    }

    /// Forward a body from `from` to the other side
    async fn relay_body(&mut self, from: Side, framing: BodyFraming, prefix: Bytes) -> Result<()> {
        let to = from.other();

        match framing {
            BodyFraming::Empty => {
                self.carry_mut(from).extend_from_slice(&prefix);
            }

            BodyFraming::ContentLength(length) => {
                let from_prefix = usize::try_from(length)
                    .unwrap_or(usize::MAX)
                    .min(prefix.len());
                self.write_bytes(to, &prefix[..from_prefix]).await?;
                self.carry_mut(from).extend_from_slice(&prefix[from_prefix..]);

                let mut remaining = length - from_prefix as u64;
                while remaining > 0 {
                    let want = usize::try_from(remaining).unwrap_or(usize::MAX);
                    let n = self.read_into_buffer(from, want).await?;
                    if n == 0 {
                        return Err(MitmError::UnexpectedEof { peer: from.label() });
                    }
                    self.forward(to, 0..n).await?;
                    remaining -= n as u64;
                }
            }

            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new();

                if !prefix.is_empty() {
                    if let Some(end) = decoder.feed(&prefix)? {
                        self.write_bytes(to, &prefix[..end]).await?;
                        self.carry_mut(from).extend_from_slice(&prefix[end..]);
                        return Ok(());
                    }
                    self.write_bytes(to, &prefix).await?;
                }

                loop {
                    let n = self.read_into_buffer(from, usize::MAX).await?;
                    if n == 0 {
                        return Err(MitmError::UnexpectedEof { peer: from.label() });
                    }
                    match decoder.feed(&self.buffer[..n])? {
                        Some(end) => {
                            self.forward(to, 0..end).await?;
                            self.carry_from_buffer(from, end..n);
                            return Ok(());
                        }
                        None => self.forward(to, 0..n).await?,
                    }
                }
            }

            BodyFraming::UntilClose => {
                self.write_bytes(to, &prefix).await?;
                loop {
                    let n = self.read_into_buffer(from, usize::MAX).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.forward(to, 0..n).await?;
                }
            }
        }

        Ok(())
    }

    /// Read at most `limit` bytes from `side` into the transfer buffer
    async fn read_into_buffer(&mut self, side: Side, limit: usize) -> Result<usize> {
        let timeout = self.engine.config.io_timeout;
        let Self {
            client,
            upstream,
            buffer,
            ..
        } = self;

        let stream = match side {
            Side::Client => client.as_mut(),
            Side::Upstream => upstream.as_mut(),
        }
        .ok_or(MitmError::UnexpectedEof { peer: side.label() })?;

        let limit = limit.min(buffer.len());
        match tokio::time::timeout(timeout, stream.read(&mut buffer[..limit])).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(MitmError::Timeout {
                operation: "read",
                timeout,
            }),
        }
    }

    /// Write `range` of the transfer buffer to `side`
    async fn forward(&mut self, side: Side, range: Range<usize>) -> Result<()> {
        let timeout = self.engine.config.io_timeout;
        let Self {
            client,
            upstream,
            buffer,
            ..
        } = self;

        let stream = match side {
            Side::Client => client.as_mut(),
            Side::Upstream => upstream.as_mut(),
        }
        .ok_or(MitmError::UnexpectedEof { peer: side.label() })?;

        write_timed(stream, &buffer[range], timeout).await
    }

    async fn write_bytes(&mut self, side: Side, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let timeout = self.engine.config.io_timeout;
        let stream = match side {
            Side::Client => self.client.as_mut(),
            Side::Upstream => self.upstream.as_mut(),
        }
        .ok_or(MitmError::UnexpectedEof { peer: side.label() })?;

        write_timed(stream, data, timeout).await
    }

    fn carry_mut(&mut self, side: Side) -> &mut BytesMut {
        match side {
            Side::Client => &mut self.client_carry,
            Side::Upstream => &mut self.upstream_carry,
        }
    }

    fn carry_from_buffer(&mut self, side: Side, range: Range<usize>) {
        let Self {
            buffer,
            client_carry,
            upstream_carry,
            ..
        } = self;

        match side {
            Side::Client => client_carry.extend_from_slice(&buffer[range]),
            Side::Upstream => upstream_carry.extend_from_slice(&buffer[range]),
        }
    }

    /// Best-effort shutdown of both transports
    async fn close(&mut self) {
        let timeout = self.engine.config.io_timeout;
        for mut stream in [self.client.take(), self.upstream.take()].into_iter().flatten() {
            let _ = tokio::time::timeout(timeout, stream.shutdown()).await;
        }
    }
}

async fn deadline<F: Future>(
    timeout: Duration,
    operation: &'static str,
    fut: F,
) -> Result<F::Output> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| MitmError::Timeout { operation, timeout })
}

async fn connect_tcp(timeout: Duration, host: &str, port: u16) -> Result<TcpStream> {
    deadline(timeout, "upstream connect", TcpStream::connect((host, port)))
        .await?
        .map_err(|e| MitmError::upstream(format!("{}:{}", host, port), e))
}

async fn write_timed(stream: &mut BoxedStream, data: &[u8], timeout: Duration) -> Result<()> {
    let write = async {
        stream.write_all(data).await?;
        stream.flush().await
    };

    match tokio::time::timeout(timeout, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(MitmError::Timeout {
            operation: "write",
            timeout,
        }),
    }
}
