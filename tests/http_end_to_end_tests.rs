// HTTP end-to-end tests
// Plain (non-CONNECT) requests through a running proxy to a scripted origin

use interloper::mitm::certificate_authority::self_sign;
use interloper::{
    AuthorityChain, ConnectionEngine, EngineConfig, HostCertificateCache, ProxyServer,
    UpstreamTlsConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One request the origin expects, and the reply it sends in pieces
struct Exchange {
    expect: Vec<u8>,
    reply: Vec<&'static [u8]>,
}

impl Exchange {
    fn new(expect: impl Into<Vec<u8>>, reply: &[&'static [u8]]) -> Self {
        Self {
            expect: expect.into(),
            reply: reply.to_vec(),
        }
    }
}

/// Origin that accepts one connection and plays `script` in order
///
/// Resolves to the bytes it received; a mismatch fails the test.
async fn scripted_origin(script: Vec<Exchange>) -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();

        for exchange in script {
            let mut request = vec![0u8; exchange.expect.len()];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(
                String::from_utf8_lossy(&request),
                String::from_utf8_lossy(&exchange.expect)
            );
            received.extend_from_slice(&request);

            for piece in exchange.reply {
                socket.write_all(piece).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        received
    });

    (addr, handle)
}

async fn start_proxy() -> (SocketAddr, oneshot::Sender<()>) {
    let root = self_sign("Plain Test Root").unwrap();
    let engine = Arc::new(ConnectionEngine::new(
        Arc::new(HostCertificateCache::new(
            AuthorityChain::new(vec![root]).unwrap(),
        )),
        UpstreamTlsConfig::new().unwrap(),
        EngineConfig {
            io_timeout: Duration::from_secs(5),
            transfer_buffer_size: 16,
            ..EngineConfig::default()
        },
    ));

    let server = ProxyServer::bind("127.0.0.1:0", engine).await.unwrap();
    let addr = server.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));

    (addr, stop)
}

async fn read_exact_string(socket: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    socket.read_exact(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn test_keep_alive_rewrites_only_first_request() {
    let first_reply: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok";
    let second_reply: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone";

    let (origin, handle) = scripted_origin(vec![
        Exchange::new(
            "GET /a?x=1 HTTP/1.1\r\nHost: origin\r\nConnection: keep-alive\r\nProxy-Connection: keep-alive\r\n\r\n",
            &[first_reply],
        ),
        Exchange::new("GET /b HTTP/1.1\r\nHost: origin\r\n\r\n", &[second_reply]),
    ])
    .await;
    let (proxy, _stop) = start_proxy().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let first = format!(
        "GET http://127.0.0.1:{}/a?x=1 HTTP/1.1\r\nHost: origin\r\nProxy-Connection: keep-alive\r\n\r\n",
        origin.port()
    );
    client.write_all(first.as_bytes()).await.unwrap();
    assert_eq!(
        read_exact_string(&mut client, first_reply.len()).await,
        String::from_utf8_lossy(first_reply)
    );

    client
        .write_all(b"GET /b HTTP/1.1\r\nHost: origin\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(
        read_exact_string(&mut client, second_reply.len()).await,
        String::from_utf8_lossy(second_reply)
    );

    // No keep-alive on the second response, so the proxy hangs up
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    handle.await.unwrap();
}

#[tokio::test]
async fn test_chunked_response_relayed_byte_exact() {
    let pieces: &[&'static [u8]] = &[
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n",
        b"Connection: keep-alive\r\n\r\n4\r",
        b"\nWiki\r\n5;note=",
        b"x\r\npedia\r\nE\r\n in\r\n\r\nchunks.",
        b"\r\n0\r\nX-Sum: 23\r\n",
        b"\r\n",
    ];
    let expected: Vec<u8> = pieces.concat();
    let after: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";

    let (origin, handle) = scripted_origin(vec![
        Exchange::new("GET /wiki HTTP/1.1\r\nHost: o\r\n\r\n", pieces),
        Exchange::new("GET /next HTTP/1.1\r\nHost: o\r\n\r\n", &[after]),
    ])
    .await;
    let (proxy, _stop) = start_proxy().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/wiki HTTP/1.1\r\nHost: o\r\n\r\n",
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(
        read_exact_string(&mut client, expected.len()).await,
        String::from_utf8_lossy(&expected)
    );

    // The chunked body ended exactly where the decoder said it did
    client
        .write_all(b"GET /next HTTP/1.1\r\nHost: o\r\n\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, after);

    handle.await.unwrap();
}

#[tokio::test]
async fn test_request_bodies_forwarded() {
    let ok: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n";
    let closing: &[u8] = b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";

    let (origin, handle) = scripted_origin(vec![
        Exchange::new(
            "POST /form HTTP/1.1\r\nHost: o\r\nContent-Length: 11\r\n\r\nhello=world",
            &[ok],
        ),
        Exchange::new(
            "PUT /upload HTTP/1.1\r\nHost: o\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
            &[closing],
        ),
    ])
    .await;
    let (proxy, _stop) = start_proxy().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let post = format!(
        "POST http://127.0.0.1:{}/form HTTP/1.1\r\nHost: o\r\nContent-Length: 11\r\n\r\nhello=world",
        origin.port()
    );
    client.write_all(post.as_bytes()).await.unwrap();
    assert_eq!(
        read_exact_string(&mut client, ok.len()).await,
        String::from_utf8_lossy(ok)
    );

    client
        .write_all(b"PUT /upload HTTP/1.1\r\nHost: o\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, closing);

    handle.await.unwrap();
}

#[tokio::test]
async fn test_head_response_has_no_body() {
    let head: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: keep-alive\r\n\r\n";
    let get: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc";

    let (origin, handle) = scripted_origin(vec![
        Exchange::new("HEAD /file HTTP/1.1\r\nHost: o\r\n\r\n", &[head]),
        Exchange::new("GET /file HTTP/1.1\r\nHost: o\r\n\r\n", &[get]),
    ])
    .await;
    let (proxy, _stop) = start_proxy().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "HEAD http://127.0.0.1:{}/file HTTP/1.1\r\nHost: o\r\n\r\nGET /file HTTP/1.1\r\nHost: o\r\n\r\n",
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, [head, get].concat());

    handle.await.unwrap();
}

#[tokio::test]
async fn test_origin_closing_early_drops_client() {
    let (origin, handle) = scripted_origin(vec![Exchange::new(
        "GET / HTTP/1.1\r\nHost: o\r\n\r\n",
        &[b"HTTP/1.1 200 OK\r\nContent-Le"],
    )])
    .await;
    let (proxy, _stop) = start_proxy().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: o\r\n\r\n", origin.port());
    client.write_all(request.as_bytes()).await.unwrap();

    // The partial status header is never relayed
    let mut reply = Vec::new();
    let _ = client.read_to_end(&mut reply).await;
    assert!(reply.is_empty());

    handle.await.unwrap();
}

#[tokio::test]
async fn test_unframed_response_relayed_until_close() {
    let (origin, handle) = scripted_origin(vec![Exchange::new(
        "GET /stream HTTP/1.1\r\nHost: o\r\n\r\n",
        &[b"HTTP/1.0 200 OK\r\n\r\n", b"part one, ", b"part two"],
    )])
    .await;
    let (proxy, _stop) = start_proxy().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/stream HTTP/1.1\r\nHost: o\r\n\r\n",
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"HTTP/1.0 200 OK\r\n\r\npart one, part two".to_vec());

    handle.await.unwrap();
}
