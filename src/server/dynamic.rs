//! The interception endpoint: a single TLS listener that impersonates
//! every host routed to it.
//!
//! The CONNECT engine installs a certificate context for the target host
//! before it opens the loopback connection, so by the time the ClientHello
//! arrives here the SNI resolver finds the host's certificate already in
//! place. Terminated requests are rewritten to absolute `https://` form
//! and fed back into the shared request engine.

use std::sync::Arc;

use http::{header, Request, Uri};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ServerBuilder,
};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::server::request::{Error as MediationError, RequestEngine};
use crate::server::tls::{HostCertStore, StoreCertResolver};

pub(crate) struct DynamicTlsServer {
    engine: Arc<RequestEngine>,
    acceptor: TlsAcceptor,
}

impl DynamicTlsServer {
    pub fn new(engine: Arc<RequestEngine>, store: Arc<HostCertStore>) -> Self {
        let resolver = Arc::new(StoreCertResolver::new(store, None));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"http/1.1".to_vec(), b"http/1.0".to_vec()];

        Self {
            engine,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Accept loop for the interception listener. Handshake failures are
    /// per-connection events; only listener errors end the loop.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, _remote) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                match server.acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let mut builder = ServerBuilder::new(TokioExecutor::new());
                        builder.http1().preserve_header_case(true);

                        let engine = server.engine.clone();
                        let service = service_fn(move |mut req: Request<Incoming>| {
                            let engine = engine.clone();
                            async move {
                                to_absolute_https(&mut req)?;
                                engine.mediate(req).await
                            }
                        });

                        if let Err(err) = builder
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await
                        {
                            log::trace!("intercepted connection ended: {}", err);
                        }
                    }
                    Err(err) => {
                        log::warn!("TLS handshake on interception port failed: {}", err);
                    }
                }
            });
        }
    }
}

/// Rewrites an origin-form URI to absolute `https://` form using the
/// `Host` header, so the request engine sees the same shape as a direct
/// proxy request.
fn to_absolute_https<B>(req: &mut Request<B>) -> Result<(), MediationError> {
    let uri = req.uri().clone();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(());
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| {
            log::warn!("intercepted request without a Host header");
            MediationError::InvalidUrl(uri.to_string())
        })?;

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let absolute: Uri = format!("https://{}{}", host, path_and_query)
        .parse()
        .map_err(|_| {
            log::warn!("cannot build absolute URL from Host {} and path {}", host, path_and_query);
            MediationError::InvalidUrl(uri.to_string())
        })?;

    *req.uri_mut() = absolute;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rewrites_origin_form_to_absolute_https() {
        let mut req = Request::builder()
            .uri("/search?q=proxy")
            .header(header::HOST, "example.test")
            .body(())
            .unwrap();

        to_absolute_https(&mut req).unwrap();
        assert_eq!(req.uri(), "https://example.test/search?q=proxy");
    }

    #[test]
    fn keeps_absolute_uris_untouched() {
        let mut req = Request::builder()
            .uri("https://example.test/")
            .header(header::HOST, "other.test")
            .body(())
            .unwrap();

        to_absolute_https(&mut req).unwrap();
        assert_eq!(req.uri(), "https://example.test/");
    }

    #[test]
    fn refuses_requests_without_a_host_header() {
        let mut req = Request::builder().uri("/").body(()).unwrap();
        assert!(to_absolute_https(&mut req).is_err());
    }
}
