//! TCP (optionally TLS) accept loop. Each accepted connection gets its own
//! task running [`crate::connection::run_connection`] against the shared
//! [`crate::connection::ServerState`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::connection::{ServerState, run_connection};
use crate::error::{Error, Result};
use crate::tls::build_tls_acceptor;

pub async fn run(cfg: Config) -> Result<()> {
    let tls_acceptor = build_tls_acceptor(&cfg).map_err(|e| Error::Msg(e.to_string()))?;
    let state = Arc::new(ServerState::new(&cfg));

    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!(
        listen_addr = %cfg.listen_addr,
        tls = tls_acceptor.is_some(),
        "subdocd listening"
    );

    serve(listener, state, tls_acceptor).await
}

/// Bind `cfg.listen_addr` (commonly `127.0.0.1:0` in tests, letting the OS
/// pick a free port) and spawn the accept loop on a background task,
/// returning the address actually bound to and a handle the caller can
/// `.abort()` to shut the listener down.
pub async fn spawn_with_shutdown(cfg: Config) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let tls_acceptor = build_tls_acceptor(&cfg).map_err(|e| Error::Msg(e.to_string()))?;
    let state = Arc::new(ServerState::new(&cfg));

    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(serve(listener, state, tls_acceptor));
    Ok((addr, handle))
}

async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        tracing::debug!(%addr, "accepted connection");
        let state = state.clone();

        match tls_acceptor.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(stream) => {
                            if let Err(e) = run_connection(stream, state).await {
                                tracing::debug!(error = %format!("{e:?}"), "connection closed with error");
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %format!("{e:?}"), "TLS handshake failed");
                        }
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    if let Err(e) = run_connection(socket, state).await {
                        tracing::debug!(error = %format!("{e:?}"), "connection closed with error");
                    }
                });
            }
        }
    }
}
