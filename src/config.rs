use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    pub log_level: Option<String>,
    /// Maximum accepted document payload size, in bytes.
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
    /// Maximum number of buckets the registry will hold at once.
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
    /// Bucket created automatically on startup so the server is usable
    /// without an explicit create/select handshake.
    #[serde(default = "default_bucket_name")]
    pub default_bucket: String,
    // Server TLS configuration.
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
    #[serde(default)]
    pub tls_ca_file: Option<String>,
    #[serde(default)]
    pub tls_client_auth: bool,
}

fn default_max_value_size() -> usize {
    20 * 1024 * 1024
}

fn default_max_buckets() -> usize {
    100
}

fn default_bucket_name() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:11211".to_string(),
            log_level: None,
            max_value_size: default_max_value_size(),
            max_buckets: default_max_buckets(),
            default_bucket: default_bucket_name(),
            tls_cert_file: None,
            tls_key_file: None,
            tls_ca_file: None,
            tls_client_auth: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is None or the
    /// file is missing/unreadable, returns defaults. Parsing errors are
    /// returned.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("config.toml");
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => Err(Error::Msg(format!("Failed to parse {}: {}", path, e))),
            },
            Err(_e) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        listen_addr: Option<String>,
        log_level: Option<String>,
        max_value_size: Option<usize>,
        max_buckets: Option<usize>,
        default_bucket: Option<String>,
        tls_cert_file: Option<String>,
        tls_key_file: Option<String>,
        tls_ca_file: Option<String>,
        tls_client_auth: Option<bool>,
    ) -> Self {
        if let Some(addr) = listen_addr {
            self.listen_addr = addr;
        }
        if let Some(ll) = log_level {
            self.log_level = Some(ll);
        }
        if let Some(v) = max_value_size {
            self.max_value_size = v;
        }
        if let Some(v) = max_buckets {
            self.max_buckets = v;
        }
        if let Some(v) = default_bucket {
            self.default_bucket = v;
        }
        if let Some(v) = tls_cert_file {
            self.tls_cert_file = Some(v);
        }
        if let Some(v) = tls_key_file {
            self.tls_key_file = Some(v);
        }
        if let Some(v) = tls_ca_file {
            self.tls_ca_file = Some(v);
        }
        if let Some(v) = tls_client_auth {
            self.tls_client_auth = v;
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::Msg("listen_addr cannot be empty".to_string()));
        }
        if !self.listen_addr.contains(':') {
            return Err(Error::Msg(format!(
                "listen_addr '{}' must be in host:port format",
                self.listen_addr
            )));
        }
        if self.max_value_size == 0 {
            return Err(Error::Msg("max_value_size must be greater than 0".to_string()));
        }
        if self.max_buckets == 0 {
            return Err(Error::Msg("max_buckets must be greater than 0".to_string()));
        }

        if self.tls_cert_file.is_some() || self.tls_key_file.is_some() {
            if self.tls_cert_file.is_none() {
                return Err(Error::Msg(
                    "tls_cert_file must be set when tls_key_file is set".to_string(),
                ));
            }
            if self.tls_key_file.is_none() {
                return Err(Error::Msg(
                    "tls_key_file must be set when tls_cert_file is set".to_string(),
                ));
            }
            if let Some(ref cert_file) = self.tls_cert_file {
                if !std::path::Path::new(cert_file).exists() {
                    return Err(Error::Msg(format!(
                        "tls_cert_file '{}' does not exist",
                        cert_file
                    )));
                }
            }
            if let Some(ref key_file) = self.tls_key_file {
                if !std::path::Path::new(key_file).exists() {
                    return Err(Error::Msg(format!(
                        "tls_key_file '{}' does not exist",
                        key_file
                    )));
                }
            }
            if let Some(ref ca_file) = self.tls_ca_file {
                if !std::path::Path::new(ca_file).exists() {
                    return Err(Error::Msg(format!(
                        "tls_ca_file '{}' does not exist",
                        ca_file
                    )));
                }
            }
        }
        if self.tls_client_auth && self.tls_ca_file.is_none() {
            return Err(Error::Msg(
                "tls_client_auth requires tls_ca_file".to_string(),
            ));
        }

        Ok(())
    }
}
