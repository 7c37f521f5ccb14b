//! TLS-intercepting HTTP(S) proxy for inspecting and rewriting your own
//! user-agent traffic.
//!
//! `interpose` terminates client TLS with per-host leaf certificates
//! minted on the fly by a local root CA, hands every request and response
//! to a [`Patcher`] for inspection or rewriting, and forwards the result
//! to the true origin. It is aimed at developers, testers, and
//! content-filtering setups that need programmatic, transaction-level
//! control over their own traffic.
//!
//! # How it works
//!
//! The proxy runs two listeners. The *proxy port* accepts regular proxy
//! traffic: absolute-form HTTP requests and `CONNECT` tunnels. A `CONNECT`
//! tunnel is classified by its first bytes: TLS handshakes are re-routed
//! into the *interception port*, a loopback-only TLS endpoint that
//! impersonates the requested host with a locally signed certificate and
//! feeds the decrypted requests back through the same mediation pipeline.
//! Cleartext upgrades loop back into the proxy port; the patcher can also
//! turn a tunnel into an opaque byte pipe or refuse it outright.
//!
//! Response bodies classified as text are decompressed before the patcher
//! sees them, so policies operate on plain text regardless of what the
//! origin sent over the wire.
//!
//! # Getting started
//!
//! ```no_run
//! use interpose::ProxyServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A proxy with the default pass-through patcher and a root CA
//!     // generated at startup.
//!     let server = ProxyServerBuilder::new().port(12345).build()?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! Point a client at `http://127.0.0.1:12345` as its HTTP(S) proxy and
//! install the root certificate ([`LocalCertificateAuthority::ca_certificate_pem`])
//! into its trust store.
//!
//! # Writing a patcher
//!
//! Implement [`Patcher`] and override the hooks you care about; every hook
//! has a pass-through default. Decisions are expressed as
//! [`ConnectDecision`] and [`RequestDecision`] values.
//!
//! # Logging
//!
//! The crate logs through the [`log`](https://crates.io/crates/log) facade.
//! Transaction-level failures are warnings; listener-level failures are
//! errors and terminate [`ProxyServer::start`].

pub mod common;
pub mod patcher;
pub mod server;

pub use common::http::{AgentProvider, HttpAgent, PooledAgentProvider};
pub use patcher::{ConnectDecision, PassthroughPatcher, Patcher, RequestDecision};
pub use server::{
    builder::ProxyServerBuilder,
    server::{ProxyServer, ProxyServerConfig, DEFAULT_INTERCEPT_PORT, DEFAULT_PROXY_PORT},
    tls::{CertificateIssuer, HostCertStore, LocalCertificateAuthority, StoreCertResolver},
};
