// Server-side TLS acceptor. Repurposes the donor's tokio-rustls/
// rustls-pemfile/webpki-roots stack (originally wired for an outbound
// shadow-mode client connection) for an inbound listener, per spec §1's
// "optionally over TLS".

use anyhow::{Context, Result, anyhow};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;

/// Build a `TlsAcceptor` from the listener's TLS configuration. Returns
/// `Ok(None)` when TLS isn't configured (plaintext listener).
pub fn build_tls_acceptor(cfg: &Config) -> Result<Option<TlsAcceptor>> {
    let (cert_file, key_file) = match (&cfg.tls_cert_file, &cfg.tls_key_file) {
        (Some(c), Some(k)) => (c, k),
        _ => return Ok(None),
    };

    let cert_data = fs::read(cert_file).context("failed to read tls_cert_file")?;
    let mut cert_reader = BufReader::new(&cert_data[..]);
    let cert_chain: Vec<_> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse server certificate")?;

    let key_data = fs::read(key_file).context("failed to read tls_key_file")?;
    let mut key_reader = BufReader::new(&key_data[..]);
    let keys: Vec<_> = pkcs8_private_keys(&mut key_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse server key")?;
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no private key found in tls_key_file"))?;
    let key = rustls::pki_types::PrivateKeyDer::try_from(key).context("invalid private key")?;

    let builder = ServerConfig::builder();

    let server_config = if cfg.tls_client_auth {
        let ca_file = cfg
            .tls_ca_file
            .as_ref()
            .ok_or_else(|| anyhow!("tls_client_auth requires tls_ca_file"))?;
        let ca_data = fs::read(ca_file).context("failed to read tls_ca_file")?;
        let mut ca_reader = BufReader::new(&ca_data[..]);
        let mut roots = RootCertStore::empty();
        for cert in certs(&mut ca_reader).collect::<Result<Vec<_>, _>>()? {
            roots.add(cert).context("failed to add CA certificate")?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("failed to build client cert verifier")?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .context("failed to build server TLS config with client auth")?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .context("failed to build server TLS config")?
    };

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_tls_files_configured_yields_plaintext() {
        let cfg = Config {
            tls_cert_file: None,
            tls_key_file: None,
            ..Default::default()
        };
        assert!(build_tls_acceptor(&cfg).unwrap().is_none());
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let cfg = Config {
            tls_cert_file: Some("/nonexistent/cert.pem".into()),
            tls_key_file: Some("/nonexistent/key.pem".into()),
            ..Default::default()
        };
        assert!(build_tls_acceptor(&cfg).is_err());
    }
}
