//! The CONNECT engine.
//!
//! A CONNECT tunnel is classified by peeking at the first bytes the client
//! sends after the handshake with the proxy: a TLS ClientHello is routed
//! through the interception endpoint (which terminates it with a
//! substituted certificate), anything else is treated as a cleartext
//! upgrade and looped back into the proxy port. The patcher can also deny
//! the tunnel outright or demote it to an opaque byte pipe.

use std::sync::Arc;

use tokio::{
    io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::common::id::next_id;
use crate::patcher::{ConnectDecision, Patcher};
use crate::server::tls::HostCertStore;

/// A TLS record header is three bytes: content type, then the major and
/// minor protocol version.
const TLS_PROBE_LEN: usize = 3;

/// CONNECT heads larger than this are junk, not handshakes.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Shared state the CONNECT engine needs to dispatch tunnels.
pub(crate) struct ConnectContext {
    pub patcher: Arc<dyn Patcher>,
    pub store: Arc<HostCertStore>,
    /// Actual bound port of the proxy listener (cleartext loopback target).
    pub main_port: u16,
    /// Actual bound port of the interception TLS listener.
    pub tls_port: u16,
}

/// A parsed CONNECT request head plus any tunnel bytes that followed it.
pub(crate) struct ConnectRequest {
    pub target: String,
    pub version: String,
    pub connection: Option<String>,
    pub proxy_connection: Option<String>,
    pub head: Vec<u8>,
}

/// Drives one CONNECT transaction to completion. Errors are terminal for
/// the transaction only; both stream halves are dropped on return.
pub(crate) async fn handle<S>(ctx: Arc<ConnectContext>, mut stream: S, sniffed: Vec<u8>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_connect_head(&mut stream, sniffed).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(err) => {
            log::warn!("cannot read CONNECT request: {}", err);
            return;
        }
    };

    let id = next_id();
    let (host, port) = split_target(&request.target);
    // The patcher always sees the parsed host:port pair, with the default
    // port filled in when the client omitted it.
    let host_port = format!("{}:{}", host, port);
    log::trace!("transaction {}: CONNECT {}", id, host_port);

    match ctx.patcher.on_connect(&host_port, id).await {
        ConnectDecision::Deny => {
            log::info!("transaction {}: CONNECT {} denied", id, host_port);
        }
        ConnectDecision::Pipe => {
            pipe_to_origin(stream, &host, port, &request.head).await;
        }
        ConnectDecision::Allow => {
            intercept(ctx, stream, request, &host).await;
        }
    }
}

async fn intercept<S>(ctx: Arc<ConnectContext>, mut stream: S, request: ConnectRequest, host: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = request.head.clone();

    // Most clients wait for the 200 before starting their handshake, so
    // the head is usually empty here. Reply, then collect enough bytes to
    // classify the tunnel.
    if head.len() < TLS_PROBE_LEN {
        if let Err(err) = write_established(&mut stream, &request).await {
            log::warn!("cannot confirm CONNECT to {}: {}", request.target, err);
            return;
        }
        if !fill_head(&mut stream, &mut head, TLS_PROBE_LEN).await {
            return;
        }
    }

    if looks_like_tls_hello(&head) {
        log::trace!("tunnel to {} classified as TLS", request.target);
        if let Err(err) = ctx.store.prepare(host).await {
            log::warn!("cannot prepare certificate context for {}: {}", host, err);
            return;
        }
        dispatch_loopback(stream, head, ctx.tls_port).await;
    } else {
        log::trace!("tunnel to {} classified as cleartext upgrade", request.target);
        dispatch_loopback(stream, head, ctx.main_port).await;
    }
}

/// Opaque splice to the requested origin; the proxy stays out of the
/// byte stream entirely (no 200 is written).
async fn pipe_to_origin<S>(mut client: S, host: &str, port: u16, head: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = match TcpStream::connect((dial_host(host), port)).await {
        Ok(upstream) => upstream,
        Err(err) => {
            log::warn!("cannot open pipe to {}:{}: {}", host, port, err);
            return;
        }
    };

    if !head.is_empty() {
        if let Err(err) = upstream.write_all(head).await {
            log::warn!("cannot replay tunnel head to {}:{}: {}", host, port, err);
            return;
        }
    }

    splice(&mut client, &mut upstream).await;
}

/// Hands the already-classified tunnel to one of the proxy's own
/// listeners, replaying the bytes the client sent so far.
async fn dispatch_loopback<S>(mut client: S, head: Vec<u8>, port: u16)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut local = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(local) => local,
        Err(err) => {
            log::warn!("loopback dispatch to port {} failed: {}", port, err);
            return;
        }
    };

    if !head.is_empty() {
        if let Err(err) = local.write_all(&head).await {
            log::warn!("cannot replay tunnel head to loopback port {}: {}", port, err);
            return;
        }
    }

    splice(&mut client, &mut local).await;
}

async fn splice<A, B>(a: &mut A, b: &mut B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(err) = copy_bidirectional(a, b).await {
        log::warn!("tunnel closed with error: {}", err);
    }
}

/// Reads the CONNECT head (request line and headers) off the raw stream.
/// `sniffed` holds the bytes already consumed by protocol detection.
/// Returns `None` on a clean EOF before the head completes.
async fn read_connect_head<S>(
    stream: &mut S,
    sniffed: Vec<u8>,
) -> std::io::Result<Option<ConnectRequest>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = sniffed;
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "CONNECT head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = buf.split_off(head_end + 4);
    let request = parse_connect_head(&buf, head)?;
    Ok(Some(request))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_connect_head(block: &[u8], head: Vec<u8>) -> std::io::Result<ConnectRequest> {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut words = request_line.split_whitespace();
    let method = words.next().unwrap_or_default();
    let target = words.next().unwrap_or_default();
    let version = words.next().unwrap_or("HTTP/1.1");

    if method != "CONNECT" || target.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed CONNECT request line: {}", request_line),
        ));
    }

    let mut connection = None;
    let mut proxy_connection = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "connection" => connection = Some(value.trim().to_string()),
                "proxy-connection" => proxy_connection = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    Ok(ConnectRequest {
        target: target.to_string(),
        version: version.to_string(),
        connection,
        proxy_connection,
        head,
    })
}

/// Splits a CONNECT target into host and port.
///
/// Only a final all-digits segment within the valid port range is consumed
/// as a port; everything else stays in the host, so bracketed IPv6
/// literals pass through intact.
pub(crate) fn split_target(target: &str) -> (String, u16) {
    if let Some((host, port_str)) = target.rsplit_once(':') {
        if !port_str.is_empty() && port_str.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(port) = port_str.parse::<u32>() {
                if port <= u16::MAX as u32 {
                    return (host.to_string(), port as u16);
                }
            }
        }
    }
    (target.to_string(), 443)
}

/// Strips IPv6 brackets for dialing; socket address resolution wants the
/// bare address.
fn dial_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// True when the first tunnel bytes look like the start of a TLS
/// ClientHello: handshake record (0x16), SSL3/TLS major version 0x03,
/// minor version below 0x06.
pub(crate) fn looks_like_tls_hello(head: &[u8]) -> bool {
    head.len() >= TLS_PROBE_LEN && head[0] == 0x16 && head[1] == 0x03 && head[2] < 0x06
}

async fn write_established<S>(stream: &mut S, request: &ConnectRequest) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = format!("{} 200 Connection Established\r\n", request.version);
    if let Some(value) = &request.proxy_connection {
        reply.push_str(&format!("Proxy-Connection: {}\r\n", value));
    }
    if let Some(value) = &request.connection {
        reply.push_str(&format!("Connection: {}\r\n", value));
    }
    reply.push_str("\r\n");

    stream.write_all(reply.as_bytes()).await?;
    stream.flush().await
}

/// Accumulates tunnel bytes until `want` are buffered. Returns false if
/// the client went away first.
async fn fill_head<S>(stream: &mut S, head: &mut Vec<u8>, want: usize) -> bool
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    while head.len() < want {
        match stream.read(&mut chunk).await {
            Ok(0) => return false,
            Ok(n) => head.extend_from_slice(&chunk[..n]),
            Err(err) => {
                log::warn!("error reading tunnel head: {}", err);
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_target("example.test:443"), ("example.test".into(), 443));
        assert_eq!(split_target("example.test:22"), ("example.test".into(), 22));
        assert_eq!(split_target("example.test:0"), ("example.test".into(), 0));
    }

    #[test]
    fn defaults_to_port_443() {
        assert_eq!(split_target("example.test"), ("example.test".into(), 443));
        assert_eq!(split_target("example.test:https"), ("example.test:https".into(), 443));
        assert_eq!(split_target("example.test:70000"), ("example.test:70000".into(), 443));
    }

    #[test]
    fn preserves_bracketed_ipv6_literals() {
        assert_eq!(split_target("[::1]:8443"), ("[::1]".into(), 8443));
        assert_eq!(split_target("[2001:db8::2]"), ("[2001:db8::2]".into(), 443));
        assert_eq!(dial_host("[::1]"), "::1");
        assert_eq!(dial_host("example.test"), "example.test");
    }

    #[test]
    fn classifies_tls_hello_bytes() {
        assert!(looks_like_tls_hello(&[0x16, 0x03, 0x01]));
        assert!(looks_like_tls_hello(&[0x16, 0x03, 0x05]));
        assert!(!looks_like_tls_hello(&[0x16, 0x03, 0x06]));
        assert!(!looks_like_tls_hello(b"GET"));
    }

    #[test]
    fn short_heads_are_not_classified() {
        // Two bytes are not enough to call it either way; the engine keeps
        // reading until three are buffered.
        assert!(!looks_like_tls_hello(&[0x16, 0x03]));
        assert!(looks_like_tls_hello(&[0x16, 0x03, 0x01, 0xaa, 0xbb]));
    }

    #[tokio::test]
    async fn reads_connect_head_and_leftover_bytes() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server
                .write_all(b"CONNECT example.test:22 HTTP/1.1\r\nHost: example.test:22\r\nProxy-Connection: Keep-Alive\r\n\r\nSSH-2.0-probe")
                .await
                .unwrap();
        });

        let mut client = client;
        let mut sniffed = vec![0u8; 8];
        use tokio::io::AsyncReadExt;
        client.read_exact(&mut sniffed).await.unwrap();

        let request = read_connect_head(&mut client, sniffed)
            .await
            .unwrap()
            .expect("head should parse");
        assert_eq!(request.target, "example.test:22");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.proxy_connection.as_deref(), Some("Keep-Alive"));
        assert_eq!(request.head, b"SSH-2.0-probe");
    }

    #[tokio::test]
    async fn patcher_sees_the_parsed_host_and_default_port() {
        use crate::server::tls::{CertificateIssuer, Error as TlsError};
        use async_trait::async_trait;
        use rustls::sign::CertifiedKey;
        use std::sync::Mutex;

        #[derive(Default)]
        struct RecordingPatcher {
            seen: Mutex<Option<String>>,
        }

        #[async_trait]
        impl Patcher for RecordingPatcher {
            async fn on_connect(&self, target: &str, _id: u64) -> ConnectDecision {
                *self.seen.lock().unwrap() = Some(target.to_string());
                ConnectDecision::Deny
            }
        }

        struct NoIssuer;

        #[async_trait]
        impl CertificateIssuer for NoIssuer {
            async fn init(&self) -> Result<(), TlsError> {
                Ok(())
            }

            async fn sign(&self, host: &str) -> Result<Arc<CertifiedKey>, TlsError> {
                Err(TlsError::GenerateCertificateError(format!(
                    "no certificates in this test (host: {})",
                    host
                )))
            }
        }

        let patcher = Arc::new(RecordingPatcher::default());
        let ctx = Arc::new(ConnectContext {
            patcher: patcher.clone(),
            store: Arc::new(HostCertStore::new(Arc::new(NoIssuer))),
            main_port: 0,
            tls_port: 0,
        });

        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"CONNECT example.test HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();

        handle(ctx, client, Vec::new()).await;

        assert_eq!(
            patcher.seen.lock().unwrap().as_deref(),
            Some("example.test:443")
        );
    }

    #[tokio::test]
    async fn rejects_non_connect_head() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        });

        let mut client = client;
        assert!(read_connect_head(&mut client, Vec::new()).await.is_err());
    }
}
