use crate::common::http::{AgentProvider, PooledAgentProvider};
use crate::patcher::{PassthroughPatcher, Patcher};
use crate::server::{
    server::{ProxyServer, ProxyServerConfig, DEFAULT_INTERCEPT_PORT, DEFAULT_PROXY_PORT},
    tls::{CertificateIssuer, LocalCertificateAuthority},
};
use std::{error::Error, path::PathBuf, sync::Arc};

/// The builder streamlines proxy configuration, filling in defaults and
/// handling dependency injection for the certificate issuer, the patcher,
/// and the upstream agent provider.
pub struct ProxyServerBuilder {
    port: Option<u16>,
    tls_port: Option<u16>,
    expose: Option<bool>,
    use_tls: Option<bool>,
    print_access_log: Option<bool>,
    body_limit: Option<usize>,
    ca_cert: Option<String>,
    ca_key: Option<String>,
    ca_cert_path: Option<PathBuf>,
    ca_key_path: Option<PathBuf>,
    issuer: Option<Arc<dyn CertificateIssuer>>,
    patcher: Option<Arc<dyn Patcher>>,
    agents: Option<Arc<dyn AgentProvider>>,
}

impl ProxyServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        ProxyServerBuilder {
            port: None,
            tls_port: None,
            expose: None,
            use_tls: None,
            print_access_log: None,
            body_limit: None,
            ca_cert: None,
            ca_key: None,
            ca_cert_path: None,
            ca_key_path: None,
            issuer: None,
            patcher: None,
            agents: None,
        }
    }

    /// Sets the proxy listener port (default 12345, 0 for ephemeral).
    ///
    /// # Parameters
    /// - `port`: The port number.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the proxy listener port as an optional value.
    ///
    /// # Parameters
    /// - `port`: An optional port number.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn port_option(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    /// Sets the loopback TLS interception port (default 12346, 0 for
    /// ephemeral).
    ///
    /// # Parameters
    /// - `port`: The port number.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn tls_port(mut self, port: u16) -> Self {
        self.tls_port = Some(port);
        self
    }

    /// Sets the loopback TLS interception port as an optional value.
    ///
    /// # Parameters
    /// - `port`: An optional port number.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn tls_port_option(mut self, port: Option<u16>) -> Self {
        self.tls_port = port;
        self
    }

    /// Sets whether the proxy listener binds on all interfaces.
    ///
    /// # Parameters
    /// - `expose`: A boolean indicating whether to expose the listener.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn expose(mut self, expose: bool) -> Self {
        self.expose = Some(expose);
        self
    }

    /// Sets whether the proxy listener binds on all interfaces as an
    /// optional value.
    ///
    /// # Parameters
    /// - `expose`: An optional boolean indicating whether to expose the
    ///   listener.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn expose_option(mut self, expose: Option<bool>) -> Self {
        self.expose = expose;
        self
    }

    /// Sets whether the proxy port itself serves TLS with a locally issued
    /// certificate.
    ///
    /// # Parameters
    /// - `use_tls`: A boolean enabling TLS on the proxy port.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = Some(use_tls);
        self
    }

    /// Sets whether the proxy port itself serves TLS as an optional value.
    ///
    /// # Parameters
    /// - `use_tls`: An optional boolean enabling TLS on the proxy port.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn use_tls_option(mut self, use_tls: Option<bool>) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Sets whether to log one INFO line per mediated transaction.
    ///
    /// # Parameters
    /// - `enabled`: A boolean indicating whether to print access logs.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn print_access_log(mut self, enabled: bool) -> Self {
        self.print_access_log = Some(enabled);
        self
    }

    /// Sets whether to print access logs as an optional value.
    ///
    /// # Parameters
    /// - `enabled`: An optional boolean indicating whether to print access
    ///   logs.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn print_access_log_option(mut self, enabled: Option<bool>) -> Self {
        self.print_access_log = enabled;
        self
    }

    /// Caps buffered request and response bodies at `limit` bytes.
    ///
    /// Bodies buffer fully in memory before the patcher runs; without a
    /// cap an adversarial peer can exhaust memory.
    ///
    /// # Parameters
    /// - `limit`: The maximum body size in bytes.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = Some(limit);
        self
    }

    /// Caps buffered bodies as an optional value.
    ///
    /// # Parameters
    /// - `limit`: An optional maximum body size in bytes.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn body_limit_option(mut self, limit: Option<usize>) -> Self {
        self.body_limit = limit;
        self
    }

    /// Sets the root CA certificate and private key in PEM format.
    ///
    /// # Parameters
    /// - `cert`: The CA certificate.
    /// - `private_key`: The CA private key.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn ca_key_pair<IntoString: Into<String>>(
        mut self,
        cert: IntoString,
        private_key: IntoString,
    ) -> Self {
        self.ca_cert = Some(cert.into());
        self.ca_key = Some(private_key.into());
        self
    }

    /// Sets the paths to the root CA certificate and private key files.
    ///
    /// # Parameters
    /// - `cert_path`: The path to the CA certificate file.
    /// - `private_key_path`: The path to the CA private key file.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn ca_key_pair_files<Path: Into<PathBuf>>(
        mut self,
        cert_path: Path,
        private_key_path: Path,
    ) -> Self {
        self.ca_cert_path = Some(cert_path.into());
        self.ca_key_path = Some(private_key_path.into());
        self
    }

    /// Sets the paths to the root CA files as optional values.
    ///
    /// # Parameters
    /// - `cert_path`: An optional path to the CA certificate file.
    /// - `private_key_path`: An optional path to the CA private key file.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn ca_key_pair_files_option<Path: Into<PathBuf>>(
        mut self,
        cert_path: Option<Path>,
        private_key_path: Option<Path>,
    ) -> Self {
        self.ca_cert_path = cert_path.map(|p| p.into());
        self.ca_key_path = private_key_path.map(|p| p.into());
        self
    }

    /// Replaces the certificate issuer entirely.
    ///
    /// # Parameters
    /// - `issuer`: The issuer that mints leaf certificates.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn certificate_issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Sets the patcher consulted for every transaction.
    ///
    /// # Parameters
    /// - `patcher`: The interception policy.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn patcher(mut self, patcher: Arc<dyn Patcher>) -> Self {
        self.patcher = Some(patcher);
        self
    }

    /// Sets the provider of upstream HTTP agents.
    ///
    /// # Parameters
    /// - `agents`: The agent provider.
    ///
    /// # Returns
    /// A modified `ProxyServerBuilder` instance for method chaining.
    pub fn agent_provider(mut self, agents: Arc<dyn AgentProvider>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Validates the configuration to ensure no conflicting CA settings
    /// are present.
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        let has_ca_pem = self.ca_cert.is_some() || self.ca_key.is_some();
        let has_ca_paths = self.ca_cert_path.is_some() || self.ca_key_path.is_some();

        if has_ca_pem && has_ca_paths {
            return Err("A CA key pair and CA key pair paths have both been configured. Please choose only one method.".into());
        }

        if (has_ca_pem || has_ca_paths) && self.issuer.is_some() {
            return Err("Both CA material and a certificate issuer were configured. Please use only one of them.".into());
        }

        Ok(())
    }

    /// Builds the `ProxyServer` with the current settings.
    ///
    /// # Returns
    /// A `ProxyServer` instance or an error if the build process fails.
    pub fn build(self) -> Result<ProxyServer, Box<dyn Error>> {
        self.validate()?;

        let issuer: Arc<dyn CertificateIssuer> = match (
            self.issuer,
            self.ca_cert_path,
            self.ca_key_path,
            self.ca_cert,
            self.ca_key,
        ) {
            // If a full issuer was provided, use it.
            (Some(issuer), _, _, _, _) => issuer,
            // If paths are provided, read the key material from disk.
            (_, Some(ca_cert_path), Some(ca_key_path), _, _) => {
                let ca_cert = std::fs::read_to_string(ca_cert_path)?;
                let ca_key = std::fs::read_to_string(ca_key_path)?;
                Arc::new(LocalCertificateAuthority::from_pem(ca_cert, ca_key))
            }
            // If key material was provided directly, use it as-is.
            (_, _, _, Some(ca_cert), Some(ca_key)) => {
                Arc::new(LocalCertificateAuthority::from_pem(ca_cert, ca_key))
            }
            // Otherwise generate a fresh root CA at startup.
            _ => Arc::new(LocalCertificateAuthority::new()),
        };

        let config = ProxyServerConfig {
            port: self.port.unwrap_or(DEFAULT_PROXY_PORT),
            tls_port: self.tls_port.unwrap_or(DEFAULT_INTERCEPT_PORT),
            expose: self.expose.unwrap_or(false),
            use_tls: self.use_tls.unwrap_or(false),
            print_access_log: self.print_access_log.unwrap_or(false),
            body_limit: self.body_limit,
        };

        let patcher = self
            .patcher
            .unwrap_or_else(|| Arc::new(PassthroughPatcher));
        let body_limit = config.body_limit;
        let agents = self
            .agents
            .unwrap_or_else(|| Arc::new(PooledAgentProvider::new(body_limit)));

        Ok(ProxyServer::new(config, issuer, patcher, agents))
    }
}

impl Default for ProxyServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
