use std::{
    future::{pending, Future},
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use hyper::service::service_fn;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ServerBuilder,
};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::oneshot::Sender,
    task::spawn,
};
use tokio_rustls::TlsAcceptor;

use crate::common::http::AgentProvider;
use crate::patcher::Patcher;
use crate::server::{
    connect::{self, ConnectContext},
    dynamic::DynamicTlsServer,
    request::RequestEngine,
    tls::{self, CertificateIssuer, HostCertStore, StoreCertResolver},
};

use crate::server::server::Error::{
    LocalSocketAddrError, PublishSocketAddrError, SocketBindError,
};

/// Default port of the proxy listener.
pub const DEFAULT_PROXY_PORT: u16 = 12345;
/// Default port of the loopback TLS interception listener.
pub const DEFAULT_INTERCEPT_PORT: u16 = 12346;

const CONNECT_PREFIX: &[u8] = b"CONNECT ";
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to socket addr {0}: {1}")]
    SocketBindError(SocketAddr, std::io::Error),
    #[error("cannot parse socket address: {0}")]
    SocketAddrParseError(#[from] std::net::AddrParseError),
    #[error("cannot obtain local socket address: {0}")]
    LocalSocketAddrError(std::io::Error),
    #[error("cannot send reserved TCP address to caller {0}")]
    PublishSocketAddrError(SocketAddr),
    #[error("proxy listener error: {0}")]
    AcceptError(std::io::Error),
    #[error("interception listener error: {0}")]
    InterceptionListenerError(std::io::Error),
    #[error("interception listener task failed: {0}")]
    InterceptionTaskError(#[from] tokio::task::JoinError),
    #[error("TLS error: {0}")]
    TlsError(#[from] tls::Error),
}

/// Listener and mediation settings for a [`ProxyServer`].
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port of the proxy listener (0 picks an ephemeral port).
    pub port: u16,
    /// Port of the loopback interception listener (0 picks an ephemeral
    /// port).
    pub tls_port: u16,
    /// Bind the proxy listener on all interfaces instead of loopback.
    pub expose: bool,
    /// Serve the proxy port itself over TLS with a locally issued
    /// certificate.
    pub use_tls: bool,
    /// Log one INFO line per mediated transaction.
    pub print_access_log: bool,
    /// Upper bound for buffered request and response bodies.
    pub body_limit: Option<usize>,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROXY_PORT,
            tls_port: DEFAULT_INTERCEPT_PORT,
            expose: false,
            use_tls: false,
            print_access_log: false,
            body_limit: None,
        }
    }
}

/// The proxy entrypoint: owns both listeners and wires the CONNECT engine,
/// the interception endpoint, and the request engine together.
pub struct ProxyServer {
    config: ProxyServerConfig,
    issuer: Arc<dyn CertificateIssuer>,
    patcher: Arc<dyn Patcher>,
    agents: Arc<dyn AgentProvider>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyServerConfig,
        issuer: Arc<dyn CertificateIssuer>,
        patcher: Arc<dyn Patcher>,
        agents: Arc<dyn AgentProvider>,
    ) -> Self {
        Self {
            config,
            issuer,
            patcher,
            agents,
        }
    }

    /// Starts the proxy and runs until a fatal listener error.
    pub async fn start(self) -> Result<(), Error> {
        self.start_with_signals(None, pending()).await
    }

    /// Starts the proxy with external lifecycle wiring.
    ///
    /// # Parameters
    /// - `socket_addr_sender`: An optional `Sender` that receives the bound
    ///   proxy address once the listener is ready.
    /// - `shutdown`: A future that resolves when the server should stop
    ///   accepting connections.
    pub async fn start_with_signals<F>(
        self,
        socket_addr_sender: Option<Sender<SocketAddr>>,
        shutdown: F,
    ) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        // see https://github.com/rustls/rustls/issues/1938
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            rustls::crypto::ring::default_provider()
                .install_default()
                .expect("cannot install rustls crypto provider");
        }

        // CA material must be ready before any listener accepts.
        self.issuer.init().await?;

        let store = Arc::new(HostCertStore::new(self.issuer.clone()));
        let engine = Arc::new(RequestEngine::new(
            self.patcher.clone(),
            self.agents.clone(),
            self.config.body_limit,
            self.config.print_access_log,
        ));

        // The interception listener stays on loopback: the only intended
        // route into it is the CONNECT engine one dispatch away.
        let tls_addr = SocketAddr::from(([127, 0, 0, 1], self.config.tls_port));
        let tls_listener = TcpListener::bind(tls_addr)
            .await
            .map_err(|e| SocketBindError(tls_addr, e))?;
        let tls_port = tls_listener
            .local_addr()
            .map_err(LocalSocketAddrError)?
            .port();

        let local_tls = if self.config.use_tls {
            store.prepare("localhost").await?;
            store.prepare("127.0.0.1").await?;
            let resolver = Arc::new(StoreCertResolver::new(
                store.clone(),
                Some("localhost".to_string()),
            ));
            let mut config = ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(resolver);
            config.alpn_protocols = vec![b"http/1.1".to_vec(), b"http/1.0".to_vec()];
            Some(TlsAcceptor::from(Arc::new(config)))
        } else {
            None
        };

        let host = if self.config.expose {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };
        let addr: SocketAddr = format!("{}:{}", host, self.config.port).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SocketBindError(addr, e))?;
        let local_addr = listener.local_addr().map_err(LocalSocketAddrError)?;

        if let Some(sender) = socket_addr_sender {
            sender
                .send(local_addr)
                .map_err(|addr| PublishSocketAddrError(addr))?;
        }

        let ctx = Arc::new(ConnectContext {
            patcher: self.patcher.clone(),
            store: store.clone(),
            main_port: local_addr.port(),
            tls_port,
        });

        let dynamic = Arc::new(DynamicTlsServer::new(engine.clone(), store));
        let mut interception = spawn(dynamic.run(tls_listener));

        log::info!(
            "proxy listening on {} ({}), interception endpoint on 127.0.0.1:{}",
            local_addr,
            if self.config.use_tls { "https" } else { "http" },
            tls_port
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, _remote_address)) => {
                            let engine = engine.clone();
                            let ctx = ctx.clone();
                            let acceptor = local_tls.clone();
                            spawn(async move {
                                handle_tcp_stream(engine, ctx, acceptor, tcp_stream).await;
                            });
                        }
                        Err(err) => {
                            log::error!("proxy listener error: {}", err);
                            interception.abort();
                            return Err(Error::AcceptError(err));
                        }
                    }
                }
                finished = &mut interception => {
                    let err = match finished {
                        Ok(Ok(())) => Error::InterceptionListenerError(io::Error::other(
                            "listener stopped unexpectedly",
                        )),
                        Ok(Err(err)) => Error::InterceptionListenerError(err),
                        Err(err) => Error::InterceptionTaskError(err),
                    };
                    log::error!("{}", err);
                    return Err(err);
                }
                _ = &mut shutdown => {
                    interception.abort();
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Classifies a fresh client connection by its first bytes and routes it:
/// CONNECT requests go to the tunnel engine, TLS bytes (when the proxy
/// port itself speaks TLS) are terminated and re-examined, everything else
/// is HTTP for the request engine.
async fn handle_tcp_stream(
    engine: Arc<RequestEngine>,
    ctx: Arc<ConnectContext>,
    acceptor: Option<TlsAcceptor>,
    mut stream: TcpStream,
) {
    log::trace!("new TCP connection incoming");

    let sniffed = match sniff(&mut stream, acceptor.is_some()).await {
        Ok(sniffed) => sniffed,
        Err(err) => {
            log::warn!("cannot read from client connection: {}", err);
            return;
        }
    };
    if sniffed.is_empty() {
        return;
    }

    if sniffed.starts_with(CONNECT_PREFIX) {
        connect::handle(ctx, stream, sniffed).await;
        return;
    }

    if let Some(acceptor) = acceptor {
        if sniffed[0] == TLS_HANDSHAKE_BYTE {
            log::trace!("TCP connection seems to be TLS encrypted");
            match acceptor.accept(RewindStream::new(sniffed, stream)).await {
                Ok(tls_stream) => handle_decrypted(engine, ctx, tls_stream).await,
                Err(err) => log::warn!("TLS handshake on proxy port failed: {}", err),
            }
            return;
        }
    }

    serve_http_connection(engine, RewindStream::new(sniffed, stream)).await;
}

/// Same routing as [`handle_tcp_stream`], one TLS layer down: a client
/// that reaches the proxy over TLS still issues CONNECT for tunneled
/// origins.
async fn handle_decrypted<S>(engine: Arc<RequestEngine>, ctx: Arc<ConnectContext>, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let sniffed = match sniff(&mut stream, false).await {
        Ok(sniffed) => sniffed,
        Err(err) => {
            log::warn!("cannot read from client connection: {}", err);
            return;
        }
    };
    if sniffed.is_empty() {
        return;
    }

    if sniffed.starts_with(CONNECT_PREFIX) {
        connect::handle(ctx, stream, sniffed).await;
        return;
    }

    serve_http_connection(engine, RewindStream::new(sniffed, stream)).await;
}

async fn serve_http_connection<S>(engine: Arc<RequestEngine>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = ServerBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);

    let service = service_fn(move |req| {
        let engine = engine.clone();
        async move { engine.mediate(req).await }
    });

    if let Err(err) = builder
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        // Transaction failures were already logged where they happened;
        // this also fires on routine client disconnects.
        log::trace!("client connection ended: {}", err);
    }
}

/// Reads just enough of a fresh connection to tell CONNECT, TLS, and plain
/// HTTP apart. Stops early once the buffer can no longer be a CONNECT
/// prefix (or a TLS record, when the proxy port speaks TLS).
async fn sniff<S>(stream: &mut S, allow_tls: bool) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(CONNECT_PREFIX.len());
    let mut chunk = [0u8; 256];

    while buf.len() < CONNECT_PREFIX.len() {
        let maybe_connect = CONNECT_PREFIX[..buf.len()] == buf[..];
        let maybe_tls = allow_tls && buf.first().map_or(true, |b| *b == TLS_HANDSHAKE_BYTE);
        if !maybe_connect && !maybe_tls {
            break;
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Ok(buf)
}

/// Stream adapter that replays already-sniffed bytes before reading from
/// the underlying stream. Writes pass straight through.
pub(crate) struct RewindStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    stream: S,
}

impl<S> RewindStream<S> {
    pub fn new(prefix: Vec<u8>, stream: S) -> Self {
        RewindStream {
            prefix,
            pos: 0,
            stream,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.prefix.len() {
            let n = std::cmp::min(buf.remaining(), this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn sniff_stops_early_for_plain_http() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            server.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        });

        let sniffed = sniff(&mut client, false).await.unwrap();
        assert!(!sniffed.is_empty());
        assert!(!sniffed.starts_with(CONNECT_PREFIX));
    }

    #[tokio::test]
    async fn sniff_collects_the_connect_prefix() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            server
                .write_all(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
        });

        let sniffed = sniff(&mut client, false).await.unwrap();
        assert!(sniffed.starts_with(CONNECT_PREFIX));
    }

    #[tokio::test]
    async fn rewind_stream_replays_sniffed_bytes_first() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            server.write_all(b" world").await.unwrap();
        });

        let mut stream = RewindStream::new(b"hello".to_vec(), client);
        let mut read = vec![0u8; 11];
        stream.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"hello world");
    }
}
