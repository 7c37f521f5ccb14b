//! Upstream HTTP client plumbing.
//!
//! The request engine never opens origin connections itself; it asks an
//! [`AgentProvider`] for an [`HttpAgent`] and sends the buffered request
//! through it. The default provider keeps one pooled hyper client that
//! dials cleartext and TLS origins alike; alternative providers can key
//! their choice on the request version, headers, or target scheme.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, Version};
use http_body_util::{BodyExt, Full, Limited};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot send request: {0}")]
    HyperError(#[from] hyper::Error),
    #[error("cannot send request: {0}")]
    HyperUtilError(#[from] hyper_util::client::legacy::Error),
    #[error("cannot buffer response body: {0}")]
    BufferError(String),
}

/// A connection to the world: sends one buffered request, returns the
/// buffered response.
#[async_trait]
pub trait HttpAgent: Send + Sync {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error>;
}

/// Selects the agent used for one upstream request.
///
/// The selection inputs mirror what a connection-pooling heuristic needs:
/// the client's HTTP version, its request headers, and whether the origin
/// is dialed over TLS.
pub trait AgentProvider: Send + Sync {
    fn get_agent(
        &self,
        version: Version,
        headers: &HeaderMap,
        is_https: bool,
    ) -> Arc<dyn HttpAgent>;
}

/// Default agent provider backed by a single pooled
/// `hyper_util::client::legacy::Client` over a rustls connector that
/// serves both `http://` and `https://` origins.
///
/// When a `body_limit` is set, responses are bounded while they stream in;
/// an origin that exceeds the limit fails the transaction without its body
/// ever being buffered in full.
pub struct PooledAgentProvider {
    agent: Arc<PooledAgent>,
}

struct PooledAgent {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    body_limit: Option<usize>,
}

impl PooledAgentProvider {
    pub fn new(body_limit: Option<usize>) -> Self {
        // see https://github.com/rustls/rustls/issues/1938
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            rustls::crypto::ring::default_provider()
                .install_default()
                .expect("cannot install rustls crypto provider");
        }

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("cannot set up using native root certificates")
            .https_or_http()
            .enable_http1()
            .build();

        Self {
            agent: Arc::new(PooledAgent {
                client: Client::builder(TokioExecutor::new()).build(https_connector),
                body_limit,
            }),
        }
    }
}

impl Default for PooledAgentProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AgentProvider for PooledAgentProvider {
    fn get_agent(
        &self,
        _version: Version,
        _headers: &HeaderMap,
        _is_https: bool,
    ) -> Arc<dyn HttpAgent> {
        self.agent.clone()
    }
}

#[async_trait]
impl HttpAgent for PooledAgent {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let (req_parts, req_body) = req.into_parts();
        let hyper_req = Request::from_parts(req_parts, Full::new(req_body));

        let res = self.client.request(hyper_req).await?;

        let (res_parts, res_body) = res.into_parts();
        let body = match self.body_limit {
            Some(limit) => Limited::new(res_body, limit)
                .collect()
                .await
                .map_err(|err| Error::BufferError(err.to_string()))?
                .to_bytes(),
            None => res_body.collect().await?.to_bytes(),
        };

        Ok(Response::from_parts(res_parts, body))
    }
}
