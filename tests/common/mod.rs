//! Shared helpers for the end-to-end tests: a proxy started on ephemeral
//! ports and hand-rolled scratch origins with wire-exact behavior.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use interpose::{CertificateIssuer, Patcher, ProxyServerBuilder};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::{oneshot, Mutex},
};

/// A proxy instance bound to ephemeral ports; shuts down on drop.
pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestProxy {
    pub async fn start(patcher: Arc<dyn Patcher>) -> Self {
        Self::start_with_issuer(patcher, None).await
    }

    pub async fn start_with_issuer(
        patcher: Arc<dyn Patcher>,
        issuer: Option<Arc<dyn CertificateIssuer>>,
    ) -> Self {
        let mut builder = ProxyServerBuilder::new().port(0).tls_port(0).patcher(patcher);
        if let Some(issuer) = issuer {
            builder = builder.certificate_issuer(issuer);
        }
        let server = builder.build().expect("cannot build proxy");

        let (addr_tx, addr_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(async move {
            let shutdown = async {
                let _ = stop_rx.await;
            };
            if let Err(err) = server.start_with_signals(Some(addr_tx), shutdown).await {
                panic!("proxy terminated with an error: {}", err);
            }
        });

        let addr = addr_rx.await.expect("proxy did not publish its address");
        TestProxy {
            addr,
            shutdown: Some(stop_tx),
        }
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A scratch HTTP origin that answers every request with a fixed response
/// and records what it received.
pub struct Origin {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    last_request: Arc<Mutex<String>>,
}

impl Origin {
    pub async fn start(response: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let last_request = Arc::new(Mutex::new(String::new()));

        let task_hits = hits.clone();
        let task_last = last_request.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                task_hits.fetch_add(1, Ordering::SeqCst);

                let response = response.clone();
                let last = task_last.clone();
                tokio::spawn(async move {
                    let head = read_head(&mut stream).await;
                    *last.lock().await = String::from_utf8_lossy(&head).to_string();
                    let _ = stream.write_all(&response).await;
                    let _ = stream.flush().await;
                });
            }
        });

        Origin {
            addr,
            hits,
            last_request,
        }
    }

    pub async fn last_request(&self) -> String {
        self.last_request.lock().await.clone()
    }
}

/// A scratch TCP origin that echoes every byte back, for opaque-pipe
/// tunnels.
pub async fn start_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Reads until the end of an HTTP head (`\r\n\r\n`) and returns everything
/// read so far.
pub async fn read_head<S>(stream: &mut S) -> Vec<u8>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    buf
}

/// Reads the stream to EOF and returns the bytes.
pub async fn read_to_end<S>(stream: &mut S) -> Vec<u8>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    buf
}
