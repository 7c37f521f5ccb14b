//! The patcher contract.
//!
//! A [`Patcher`] is the proxy's only extension surface: four asynchronous
//! hooks, each called at most once per transaction. The proxy treats the
//! hooks as opaque policy; it never re-enters the patcher for a
//! transaction id after the final hook for that transaction returned.
//!
//! Response hooks receive the response headers mutably so a patcher that
//! re-encodes a body can also reset `Content-Encoding` (the proxy sets it
//! to `identity` after decompressing).

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

/// Verdict for a `CONNECT` request, before any tunnel bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Intercept the tunnel: TLS handshakes are terminated with a local
    /// certificate, cleartext upgrades loop back into the proxy.
    Allow,
    /// Close the client connection without a reply.
    Deny,
    /// Open an opaque byte pipe to the requested host and stay out of it.
    Pipe,
}

/// Verdict for a mediated HTTP request.
#[derive(Debug, Clone)]
pub enum RequestDecision {
    /// Forward to the origin, with the possibly rewritten body.
    Allow,
    /// Close the client connection without a reply.
    Deny,
    /// Reply `200 OK` with an empty body; the origin is not contacted.
    /// `headers` replaces the synthesized default header set when present.
    Empty { headers: Option<HeaderMap> },
    /// With `location`, re-target the upstream request to that URL.
    /// Without it, reply `200 OK` carrying `text` as the body; the origin
    /// is not contacted.
    Redirect {
        location: Option<String>,
        text: Option<String>,
        headers: Option<HeaderMap>,
    },
}

/// Per-transaction interception policy.
///
/// Every hook has a pass-through default, so implementations only override
/// the decisions they care about.
#[async_trait]
pub trait Patcher: Send + Sync {
    /// Called for each `CONNECT` request with the parsed `host:port`
    /// target; the default port 443 is filled in when the client omitted
    /// it.
    async fn on_connect(&self, _target: &str, _id: u64) -> ConnectDecision {
        ConnectDecision::Allow
    }

    /// Called once the full request body is buffered, before the origin is
    /// contacted. Returns the verdict and the (possibly rewritten) body.
    async fn on_request(
        &self,
        _referer: Option<&str>,
        _url: &str,
        body: Bytes,
        _headers: &mut HeaderMap,
        _id: u64,
    ) -> (RequestDecision, Bytes) {
        (RequestDecision::Allow, body)
    }

    /// Called with the fully decompressed body of a text response.
    /// Returns the bytes to forward to the client.
    async fn on_text_response(
        &self,
        _referer: Option<&str>,
        _url: &str,
        body: &str,
        _headers: &mut HeaderMap,
        _id: u64,
    ) -> Bytes {
        Bytes::copy_from_slice(body.as_bytes())
    }

    /// Called with the raw body of a non-text response.
    async fn on_other_response(
        &self,
        _referer: Option<&str>,
        _url: &str,
        body: Bytes,
        _headers: &mut HeaderMap,
        _id: u64,
    ) -> Bytes {
        body
    }
}

/// A patcher that lets every transaction through untouched.
pub struct PassthroughPatcher;

#[async_trait]
impl Patcher for PassthroughPatcher {}
