//! The mediation engine: one client request in, one origin exchange,
//! one patched response out.
//!
//! Requests arrive here from two directions: absolute-form proxy requests
//! on the proxy port, and origin-form requests that the interception
//! endpoint has already rewritten to absolute `https://` form. Both run
//! the same pipeline. A transaction either produces a response or fails
//! with an error, in which case the connection to the client is torn down
//! without a reply.

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::Incoming;
use std::sync::Arc;
use thiserror::Error;

use crate::common::{
    encoding::decode_body,
    http::AgentProvider,
    id::next_id,
    mime::{accepted_mime_type, is_text_mime},
};
use crate::patcher::{Patcher, RequestDecision};

const DEFAULT_REPLY_MIME: &str = "text/html";
const SYNTHETIC_SERVER: &str = "Apache/2.4.7 (Ubuntu)";

#[derive(Error, Debug)]
pub enum Error {
    #[error("request was denied")]
    Denied,
    #[error("upgrade requests are not supported")]
    UpgradeUnsupported,
    #[error("CONNECT cannot be mediated on an established connection")]
    NestedConnect,
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
    #[error("cannot buffer body: {0}")]
    BufferBody(String),
    #[error("body exceeds the configured limit")]
    BodyTooLarge,
    #[error("upstream request failed: {0}")]
    Upstream(#[from] crate::common::http::Error),
    #[error("cannot decode response body: {0}")]
    Decompress(std::io::Error),
}

/// One client-originated request and the state needed to replay it
/// upstream: correlation id, effective target, and the patcher-visible
/// header and body sets.
struct Transaction {
    id: u64,
    method: Method,
    target: Uri,
    url: String,
    version: Version,
    referer: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

pub struct RequestEngine {
    patcher: Arc<dyn Patcher>,
    agents: Arc<dyn AgentProvider>,
    body_limit: Option<usize>,
    print_access_log: bool,
}

impl RequestEngine {
    pub fn new(
        patcher: Arc<dyn Patcher>,
        agents: Arc<dyn AgentProvider>,
        body_limit: Option<usize>,
        print_access_log: bool,
    ) -> Self {
        Self {
            patcher,
            agents,
            body_limit,
            print_access_log,
        }
    }

    /// Runs one transaction to completion.
    ///
    /// An `Err` return destroys the client connection: hyper drops the
    /// stream without writing a response, which is the intended signal for
    /// denied and failed transactions.
    pub async fn mediate(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
        if req.headers().contains_key(header::UPGRADE) {
            log::warn!("refusing protocol upgrade request for {}", req.uri());
            return Err(Error::UpgradeUnsupported);
        }
        if req.method() == Method::CONNECT {
            log::warn!("unexpected CONNECT on an established connection");
            return Err(Error::NestedConnect);
        }

        let uri = req.uri().clone();
        if uri.scheme_str().is_none() || uri.host().is_none() {
            log::warn!("cannot forward request without an absolute URL: {}", uri);
            return Err(Error::InvalidUrl(uri.to_string()));
        }

        let (parts, body) = req.into_parts();
        let body = self.buffer_request_body(body).await?;
        if parts.method == Method::GET && !body.is_empty() {
            log::warn!("GET request to {} carries a body of {} bytes", uri, body.len());
        }

        let mut tx = Transaction {
            id: next_id(),
            method: parts.method.clone(),
            url: uri.to_string(),
            target: uri,
            version: parts.version,
            referer: parts
                .headers
                .get(header::REFERER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            headers: parts.headers.clone(),
            body,
        };

        let (decision, body) = self
            .patcher
            .on_request(
                tx.referer.as_deref(),
                &tx.url,
                tx.body,
                &mut tx.headers,
                tx.id,
            )
            .await;
        tx.body = body;

        // Ask the origin for content we know how to decode, no matter what
        // the client offered.
        tx.headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        let accept = parts
            .headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok());

        match decision {
            RequestDecision::Allow => {}
            RequestDecision::Deny => {
                log::info!("request {} to {} denied", tx.id, tx.url);
                return Err(Error::Denied);
            }
            RequestDecision::Empty { headers } => {
                return synthesize_reply(accept, headers, Bytes::new());
            }
            RequestDecision::Redirect {
                location: None,
                text,
                headers,
            } => {
                let body = Bytes::from(text.unwrap_or_default());
                return synthesize_reply(accept, headers, body);
            }
            RequestDecision::Redirect {
                location: Some(location),
                ..
            } => {
                self.retarget(&mut tx, &location)?;
            }
        }

        self.forward(tx).await
    }

    /// Rewrites the transaction target to the patcher-provided URL.
    fn retarget(&self, tx: &mut Transaction, location: &str) -> Result<(), Error> {
        let target: Uri = location
            .parse()
            .map_err(|_| Error::InvalidUrl(location.to_string()))?;
        if target.scheme_str().is_none() || target.host().is_none() {
            log::warn!("redirect target is not an absolute URL: {}", location);
            return Err(Error::InvalidUrl(location.to_string()));
        }

        if let Some(authority) = target.authority() {
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(|_| Error::InvalidUrl(location.to_string()))?;
            tx.headers.insert(header::HOST, host);
        }

        log::trace!("transaction {} redirected to {}", tx.id, target);
        tx.target = target;
        Ok(())
    }

    async fn forward(
        &self,
        tx: Transaction,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
        let is_https = tx.target.scheme_str() == Some("https");
        let agent = self.agents.get_agent(tx.version, &tx.headers, is_https);

        let mut upstream_req = Request::new(tx.body);
        *upstream_req.method_mut() = tx.method.clone();
        *upstream_req.uri_mut() = tx.target.clone();
        *upstream_req.version_mut() = tx.version;
        *upstream_req.headers_mut() = tx.headers;

        let upstream_res = agent.send(upstream_req).await.map_err(|err| {
            log::warn!("upstream request for {} failed: {}", tx.url, err);
            Error::Upstream(err)
        })?;

        let (mut parts, mut body) = upstream_res.into_parts();
        // The default agent already bounds the response while it streams
        // in; this re-check catches agents that ignore the cap.
        if let Some(limit) = self.body_limit {
            if body.len() > limit {
                log::warn!(
                    "response from {} exceeds the body limit ({} > {} bytes)",
                    tx.url,
                    body.len(),
                    limit
                );
                return Err(Error::BodyTooLarge);
            }
        }

        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let is_text = is_text_mime(&accepted_mime_type(content_type, "", false));

        let final_body = if is_text {
            let encoding = parts
                .headers
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if encoding == "gzip" || encoding == "deflate" {
                body = Bytes::from(decode_body(&encoding, &body).map_err(|err| {
                    log::warn!(
                        "cannot decompress {} response body from {}: {}",
                        encoding,
                        tx.url,
                        err
                    );
                    Error::Decompress(err)
                })?);
                // The patcher sees plain text; if it re-encodes, it resets
                // this header itself.
                parts
                    .headers
                    .insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
            }

            let text = String::from_utf8_lossy(&body).into_owned();
            self.patcher
                .on_text_response(tx.referer.as_deref(), &tx.url, &text, &mut parts.headers, tx.id)
                .await
        } else {
            self.patcher
                .on_other_response(tx.referer.as_deref(), &tx.url, body, &mut parts.headers, tx.id)
                .await
        };

        // The client must never learn the origin's pins: a pinned real
        // certificate would break every later substituted handshake.
        parts.headers.remove("public-key-pins");
        // The body is re-sent in one piece with an exact length.
        parts.headers.remove(header::TRANSFER_ENCODING);
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(final_body.len()));

        if self.print_access_log {
            log::info!("{} {} -> {}", tx.method, tx.url, parts.status);
        }

        Ok(Response::from_parts(parts, full(final_body)))
    }

    async fn buffer_request_body(&self, body: Incoming) -> Result<Bytes, Error> {
        let collected = match self.body_limit {
            Some(limit) => Limited::new(body, limit).collect().await.map_err(|err| {
                log::warn!("cannot buffer request body: {}", err);
                Error::BufferBody(err.to_string())
            })?,
            None => body.collect().await.map_err(|err| {
                log::warn!("cannot buffer request body: {}", err);
                Error::BufferBody(err.to_string())
            })?,
        };
        Ok(collected.to_bytes())
    }
}

/// Builds a synthesized `200 OK` that never touches the origin.
fn synthesize_reply(
    accept: Option<&str>,
    headers: Option<HeaderMap>,
    body: Bytes,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
    let length = body.len();
    let mut reply = Response::new(full(body));
    *reply.status_mut() = StatusCode::OK;
    *reply.headers_mut() = headers.unwrap_or_else(|| default_reply_headers(accept));
    reply
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    Ok(reply)
}

fn default_reply_headers(accept: Option<&str>) -> HeaderMap {
    let mime = accepted_mime_type(accept, DEFAULT_REPLY_MIME, true);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&mime)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_REPLY_MIME)),
    );
    headers.insert(header::SERVER, HeaderValue::from_static(SYNTHETIC_SERVER));
    headers
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
