use clap::Parser;
use subdocd::{config::Config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Attempt to load config before initializing logs to pick up log_level from file.
    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Filter precedence: CLI (--log-level / SUBDOCD_LOG_LEVEL) > RUST_LOG
    // (env) > config.toml log_level > default("info").
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    // Load from config file (if present), then override with CLI/env.
    let cfg = cfg_file.with_overrides(
        cli.listen_addr.clone(),
        cli.log_level.clone(),
        cli.max_value_size,
        cli.max_buckets,
        cli.default_bucket.clone(),
        cli.tls_cert_file.clone(),
        cli.tls_key_file.clone(),
        cli.tls_ca_file.clone(),
        cli.tls_client_auth,
    );

    cfg.validate()?;
    tracing::info!(listen_addr = %cfg.listen_addr, "starting subdocd");

    if let Err(e) = server::run(cfg).await {
        tracing::error!(error = %format!("{e:?}"), "server terminated with error");
    }

    Ok(())
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "subdocd",
    version,
    about = "memcached-compatible sub-document server"
)]
struct Cli {
    /// Path to config TOML file.
    #[arg(short = 'c', long = "config", env = "SUBDOCD_CONFIG")]
    config: Option<String>,

    /// Listen address for the server (e.g. 127.0.0.1:11211).
    #[arg(long = "listen-addr", env = "SUBDOCD_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Log level or filter spec (e.g. info or info,subdocd=debug).
    #[arg(long = "log-level", env = "SUBDOCD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Maximum accepted document payload size, in bytes.
    #[arg(long = "max-value-size", env = "SUBDOCD_MAX_VALUE_SIZE")]
    max_value_size: Option<usize>,

    /// Maximum number of buckets the registry will hold at once.
    #[arg(long = "max-buckets", env = "SUBDOCD_MAX_BUCKETS")]
    max_buckets: Option<usize>,

    /// Bucket created automatically on startup.
    #[arg(long = "default-bucket", env = "SUBDOCD_DEFAULT_BUCKET")]
    default_bucket: Option<String>,

    /// TLS certificate chain file (PEM). Enables TLS when set with --tls-key-file.
    #[arg(long = "tls-cert-file", env = "SUBDOCD_TLS_CERT_FILE")]
    tls_cert_file: Option<String>,

    /// TLS private key file (PEM, PKCS#8).
    #[arg(long = "tls-key-file", env = "SUBDOCD_TLS_KEY_FILE")]
    tls_key_file: Option<String>,

    /// CA bundle used to verify client certificates.
    #[arg(long = "tls-ca-file", env = "SUBDOCD_TLS_CA_FILE")]
    tls_ca_file: Option<String>,

    /// Require and verify a client certificate (requires --tls-ca-file).
    #[arg(long = "tls-client-auth", env = "SUBDOCD_TLS_CLIENT_AUTH")]
    tls_client_auth: Option<bool>,
}
