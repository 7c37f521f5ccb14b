use clap::Parser;
use interpose::ProxyServerBuilder;
use std::path::PathBuf;

/// Holds command line parameters provided by the user.
#[derive(Parser, Debug)]
#[command(name = "interpose", about = "TLS-intercepting HTTP(S) proxy", version)]
struct CommandLineParameters {
    /// Port of the proxy listener.
    #[arg(short, long, env = "INTERPOSE_PORT", default_value_t = interpose::DEFAULT_PROXY_PORT)]
    port: u16,

    /// Port of the loopback TLS interception listener.
    #[arg(long, env = "INTERPOSE_TLS_PORT", default_value_t = interpose::DEFAULT_INTERCEPT_PORT)]
    tls_port: u16,

    /// Bind the proxy listener on all interfaces instead of loopback only.
    #[arg(long, env = "INTERPOSE_EXPOSE")]
    expose: bool,

    /// Serve the proxy port itself over TLS with a locally issued
    /// certificate.
    #[arg(long, env = "INTERPOSE_USE_TLS")]
    use_tls: bool,

    /// Log one line per mediated transaction.
    #[arg(long)]
    print_access_log: bool,

    /// Upper bound in bytes for buffered request and response bodies.
    #[arg(long, env = "INTERPOSE_BODY_LIMIT")]
    body_limit: Option<usize>,

    /// Path to the root CA certificate in PEM format.
    #[arg(long, env = "INTERPOSE_CA_CERT", requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// Path to the root CA private key in PEM format.
    #[arg(long, env = "INTERPOSE_CA_KEY", requires = "ca_cert")]
    ca_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let params = CommandLineParameters::parse();

    let server = ProxyServerBuilder::new()
        .port(params.port)
        .tls_port(params.tls_port)
        .expose(params.expose)
        .use_tls(params.use_tls)
        .print_access_log(params.print_access_log)
        .body_limit_option(params.body_limit)
        .ca_key_pair_files_option(params.ca_cert, params.ca_key)
        .build()
        .unwrap_or_else(|err| fatal(&*err));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received");
    };

    if let Err(err) = server.start_with_signals(None, shutdown).await {
        fatal(&err);
    }
}

fn fatal(err: &dyn std::error::Error) -> ! {
    log::error!("==================================================");
    log::error!("the proxy terminated with a fatal error:");
    log::error!("    {}", err);
    log::error!("==================================================");
    std::process::exit(1);
}
