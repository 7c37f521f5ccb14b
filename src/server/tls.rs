use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::server::tls::Error::{CaCertificateError, GenerateCertificateError};
use async_trait::async_trait;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SanType};
use rustls::{
    crypto::ring::sign::any_supported_type,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use std::{
    collections::HashMap,
    io::Cursor,
    sync::{Arc, Mutex, RwLock},
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("CA certificate error: {0}")]
    CaCertificateError(String),
    #[error("cannot generate certificate: {0}")]
    GenerateCertificateError(String),
}

/// Mints the certificate material the interception endpoints serve.
///
/// `init` prepares the root CA (loading or generating key material) and
/// must complete before any listener accepts. `sign` produces a leaf
/// certificate valid for one host; callers are responsible for caching,
/// the issuer itself is stateless per call.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn init(&self) -> Result<(), Error>;
    async fn sign(&self, host: &str) -> Result<Arc<CertifiedKey>, Error>;
}

#[derive(Clone)]
struct CaMaterial {
    cert_pem: String,
    key_pem: String,
}

/// Certificate issuer backed by a local root CA.
///
/// The root is either provided as PEM (so an operator can reuse a CA that
/// is already in the OS trust store) or generated at `init` time. Leaf
/// certificates use fresh P-256 keys and are signed by the root.
pub struct LocalCertificateAuthority {
    configured: Option<CaMaterial>,
    material: RwLock<Option<CaMaterial>>,
}

impl LocalCertificateAuthority {
    /// Creates an authority that generates a fresh root CA during `init`.
    pub fn new() -> Self {
        Self {
            configured: None,
            material: RwLock::new(None),
        }
    }

    /// Creates an authority from existing root CA material in PEM format.
    pub fn from_pem<IntoString: Into<String>>(ca_cert: IntoString, ca_key: IntoString) -> Self {
        Self {
            configured: Some(CaMaterial {
                cert_pem: ca_cert.into(),
                key_pem: ca_key.into(),
            }),
            material: RwLock::new(None),
        }
    }

    /// The root certificate in PEM format, available after `init`.
    ///
    /// This is what users install into their trust store so the proxy's
    /// substituted certificates verify.
    pub fn ca_certificate_pem(&self) -> Option<String> {
        self.material
            .read()
            .unwrap()
            .as_ref()
            .map(|m| m.cert_pem.clone())
    }

    fn generate_root() -> Result<CaMaterial, Error> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|err| CaCertificateError(format!("cannot generate CA key pair: {:?}", err)))?;

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "interpose root CA");
        params.distinguished_name.push(DnType::OrganizationName, "interpose");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let cert = params
            .self_signed(&key)
            .map_err(|err| CaCertificateError(format!("cannot self-sign CA certificate: {:?}", err)))?;

        Ok(CaMaterial {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    fn material(&self) -> Result<CaMaterial, Error> {
        self.material
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| CaCertificateError("certificate authority is not initialized".into()))
    }

    fn generate_host_certificate(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
        let material = self.material()?;

        let ca_key = KeyPair::from_pem(&material.key_pem).map_err(|err| {
            CaCertificateError(format!(
                "expected CA key in PEM format but failed to parse it (host: {}: error: {:?})",
                hostname, err
            ))
        })?;

        // IP targets (including bracketed IPv6 literals) go into IP SANs;
        // everything else is treated as a DNS name.
        let unbracketed = hostname
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(hostname);
        let params = if let Ok(ip) = unbracketed.parse::<std::net::IpAddr>() {
            let mut p = CertificateParams::default();
            p.subject_alt_names.push(SanType::IpAddress(ip));
            p
        } else {
            CertificateParams::new(vec![hostname.to_owned()]).map_err(|err| {
                GenerateCertificateError(format!(
                    "cannot generate certificate (host: {}: error: {:?})",
                    hostname, err
                ))
            })?
        };

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot generate new key pair (host: {}: error: {:?})",
                hostname, err
            ))
        })?;

        let serialized_key_pair = key_pair.serialize_pem();

        // Reconstruct the issuer certificate so the new leaf can be signed
        // with the CA's private key.
        let issuer_params = CertificateParams::from_ca_cert_pem(&material.cert_pem).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot create issuer parameters from CA certificate (host: {}: error: {:?})",
                hostname, err
            ))
        })?;

        let issuer_cert = issuer_params.self_signed(&ca_key).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot reconstruct issuer certificate (host: {}: error: {:?})",
                hostname, err
            ))
        })?;

        let leaf_cert = params
            .signed_by(&key_pair, &issuer_cert, &ca_key)
            .map_err(|err| {
                GenerateCertificateError(format!(
                    "cannot generate host certificate (host: {}: error: {:?})",
                    hostname, err
                ))
            })?;

        let private_key = load_private_key(serialized_key_pair).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot convert generated key pair to private key (host: {}: error: {:?})",
                hostname, err
            ))
        })?;

        let certificates = load_certificates(leaf_cert.pem()).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot convert generated certificate PEM (host: {}: error: {:?})",
                hostname, err
            ))
        })?;

        let signing_key = any_supported_type(&private_key).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot convert generated private key to signing key (host: {}: error: {:?})",
                hostname, err
            ))
        })?;

        Ok(Arc::new(CertifiedKey::new(certificates, signing_key)))
    }
}

impl Default for LocalCertificateAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateIssuer for LocalCertificateAuthority {
    async fn init(&self) -> Result<(), Error> {
        let material = match &self.configured {
            Some(configured) => {
                // Fail fast on unusable key material instead of failing on
                // the first intercepted host.
                KeyPair::from_pem(&configured.key_pem).map_err(|err| {
                    CaCertificateError(format!("cannot parse configured CA key: {:?}", err))
                })?;
                CertificateParams::from_ca_cert_pem(&configured.cert_pem).map_err(|err| {
                    CaCertificateError(format!("cannot parse configured CA certificate: {:?}", err))
                })?;
                configured.clone()
            }
            None => {
                log::info!("no CA material configured, generating a fresh root CA");
                Self::generate_root()?
            }
        };

        *self.material.write().unwrap() = Some(material);
        Ok(())
    }

    async fn sign(&self, host: &str) -> Result<Arc<CertifiedKey>, Error> {
        self.generate_host_certificate(host)
    }
}

fn load_certificates(cert_pem: String) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut cert_pem_reader = Cursor::new(cert_pem.into_bytes());
    let mut certificates = Vec::new();
    for cert_result in rustls_pemfile::certs(&mut cert_pem_reader) {
        let cert = cert_result.map_err(|err| {
            GenerateCertificateError(format!("cannot use generated certificate: {:?}", err))
        })?;
        certificates.push(cert);
    }
    Ok(certificates)
}

fn load_private_key(key_pem: String) -> Result<PrivateKeyDer<'static>, Error> {
    let mut key_pem_reader = Cursor::new(key_pem.into_bytes());
    let private_key = rustls_pemfile::private_key(&mut key_pem_reader)
        .map_err(|err| {
            GenerateCertificateError(format!("cannot use generated private key: {:?}", err))
        })?
        .ok_or(GenerateCertificateError(String::from(
            "invalid generated private key",
        )))?;
    Ok(private_key)
}

/// Host-to-certificate map backing the interception endpoints.
///
/// The map only ever grows: once a host's certificate is installed it
/// stays installed for the process lifetime, and every host served over
/// TLS is present here before its handshake completes.
pub struct HostCertStore {
    issuer: Arc<dyn CertificateIssuer>,
    certificates: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for HostCertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCertStore")
            .field("hosts", &self.certificates.read().unwrap().keys())
            .finish()
    }
}

impl HostCertStore {
    pub fn new(issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            issuer,
            certificates: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.certificates.read().unwrap().contains_key(host)
    }

    pub fn lookup(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.certificates.read().unwrap().get(host).cloned()
    }

    /// Ensures a certificate for `host` is installed before returning.
    ///
    /// The hit path stays asynchronous (it yields once) so callers observe
    /// the same suspension point whether or not signing happens. Concurrent
    /// calls for the same host sign at most once; the per-host lock
    /// serializes them and the second caller finds the certificate
    /// installed.
    pub async fn prepare(&self, host: &str) -> Result<(), Error> {
        if self.contains(host) {
            tokio::task::yield_now().await;
            return Ok(());
        }

        let lock = self.lock_for_host(host);
        let _guard = lock.lock().await;
        if self.contains(host) {
            return Ok(());
        }

        let key = self.issuer.sign(host).await?;
        self.certificates
            .write()
            .unwrap()
            .insert(host.to_string(), key);

        log::trace!("installed certificate context for {}", host);
        Ok(())
    }

    fn lock_for_host(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// SNI-keyed certificate resolver over a [`HostCertStore`].
///
/// Resolution is lookup-only: certificates are minted ahead of the
/// handshake via [`HostCertStore::prepare`], never inside the rustls
/// callback. `fallback` names the certificate served to clients that send
/// no SNI extension (the proxy's own endpoint uses this; the interception
/// endpoint has no sensible fallback).
#[derive(Debug)]
pub struct StoreCertResolver {
    store: Arc<HostCertStore>,
    fallback: Option<String>,
}

impl StoreCertResolver {
    pub fn new(store: Arc<HostCertStore>, fallback: Option<String>) -> Self {
        Self { store, fallback }
    }
}

impl ResolvesServerCert for StoreCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        if let Some(hostname) = client_hello.server_name() {
            let resolved = self.store.lookup(hostname);
            if resolved.is_none() {
                log::warn!("no certificate context installed for {}", hostname);
            }
            return resolved;
        }

        // Clients may omit the SNI extension (RFC 6066 section 3); serve
        // the fallback certificate when one is configured.
        match &self.fallback {
            Some(host) => self.store.lookup(host),
            None => {
                log::warn!("TLS client sent no server name and no fallback certificate is set");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingIssuer {
        inner: LocalCertificateAuthority,
        signs: AtomicUsize,
    }

    #[async_trait]
    impl CertificateIssuer for CountingIssuer {
        async fn init(&self) -> Result<(), Error> {
            self.inner.init().await
        }

        async fn sign(&self, host: &str) -> Result<Arc<CertifiedKey>, Error> {
            self.signs.fetch_add(1, Ordering::SeqCst);
            self.inner.sign(host).await
        }
    }

    #[tokio::test]
    async fn signs_a_leaf_for_a_dns_host() {
        let ca = LocalCertificateAuthority::new();
        ca.init().await.unwrap();

        let key = ca.sign("example.test").await.unwrap();
        assert!(!key.cert.is_empty());
        assert!(ca.ca_certificate_pem().is_some());
    }

    #[tokio::test]
    async fn signs_a_leaf_for_an_ip_host() {
        let ca = LocalCertificateAuthority::new();
        ca.init().await.unwrap();

        assert!(ca.sign("127.0.0.1").await.is_ok());
        assert!(ca.sign("[::1]").await.is_ok());
    }

    #[tokio::test]
    async fn sign_before_init_fails() {
        let ca = LocalCertificateAuthority::new();
        assert!(ca.sign("example.test").await.is_err());
    }

    #[tokio::test]
    async fn prepare_signs_each_host_once() {
        let issuer = Arc::new(CountingIssuer {
            inner: LocalCertificateAuthority::new(),
            signs: AtomicUsize::new(0),
        });
        issuer.init().await.unwrap();

        let store = Arc::new(HostCertStore::new(issuer.clone()));

        let (first, second) = tokio::join!(
            store.prepare("example.test"),
            store.prepare("example.test")
        );
        first.unwrap();
        second.unwrap();
        store.prepare("example.test").await.unwrap();

        assert_eq!(issuer.signs.load(Ordering::SeqCst), 1);
        assert!(store.contains("example.test"));
        assert!(store.lookup("example.test").is_some());
    }
}
