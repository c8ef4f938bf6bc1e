use axum::body::Body;
use axum::Router;
use futures_util::pin_mut;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::{server::conn::auto, service::TowerToHyperService};
use log::*;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _;

use crate::app_state::AppState;
use crate::server::ServeError;

/// Builds a TLS acceptor from the certificate stored in the database, or
/// `None` when no certificate has been provisioned yet.
pub(super) async fn bind_tls_listener(
  state: &AppState,
  address: &str,
) -> Result<Option<(TcpListener, TlsAcceptor)>, ServeError> {
  let Some(cert) = state
    .storage()
    .get_latest_cert()
    .await
    .map_err(|err| ServeError::Tls(err.to_string()))?
  else {
    return Ok(None);
  };

  let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
    rustls_pemfile::certs(&mut cert.cert_chain_pem.as_bytes())
      .collect::<Result<_, _>>()
      .map_err(|err| ServeError::Tls(format!("invalid certificate chain: {err}")))?;

  let key = rustls_pemfile::private_key(&mut cert.private_key_pem.as_bytes())
    .map_err(|err| ServeError::Tls(format!("invalid private key: {err}")))?
    .ok_or_else(|| ServeError::Tls("no private key in stored certificate".to_string()))?;

  let mut server_config =
    rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
      .with_safe_default_protocol_versions()
      .map_err(|err| ServeError::Tls(err.to_string()))?
      .with_no_client_auth()
      .with_single_cert(certs, key)
      .map_err(|err| ServeError::Tls(err.to_string()))?;
  server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

  let listener = tokio::net::TcpListener::bind(address)
    .await
    .map_err(|err| super::InitError::Bind(address.to_string(), err))?;

  return Ok(Some((
    listener,
    TlsAcceptor::from(Arc::new(server_config)),
  )));
}

/// Accept loop serving the router over TLS. On cancellation it stops
/// accepting and waits for open connections to finish their in-flight
/// requests.
pub(super) async fn serve_tls(
  listener: TcpListener,
  acceptor: TlsAcceptor,
  router: Router<()>,
  shutdown: CancellationToken,
) {
  let (close_tx, close_rx) = watch::channel(());

  loop {
    let (stream, _remote_addr) = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok(pair) => pair,
        Err(err) => {
          warn!("TLS accept error: {err}");
          tokio::time::sleep(std::time::Duration::from_secs(1)).await;
          continue;
        }
      },
    };

    let acceptor = acceptor.clone();
    let router = router.clone();
    let shutdown = shutdown.clone();
    let close_rx = close_rx.clone();

    tokio::spawn(async move {
      let tls_stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(err) => {
          debug!("TLS handshake failed: {err}");
          return;
        }
      };

      let service = TowerToHyperService::new(
        router.map_request(|request: axum::http::Request<Incoming>| request.map(Body::new)),
      );
      let builder = auto::Builder::new(TokioExecutor::new());
      let connection = builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
      pin_mut!(connection);

      let mut shutdown_sent = false;
      loop {
        tokio::select! {
          result = connection.as_mut() => {
            if let Err(err) = result {
              debug!("TLS connection error: {err}");
            }
            break;
          }
          _ = shutdown.cancelled(), if !shutdown_sent => {
            shutdown_sent = true;
            connection.as_mut().graceful_shutdown();
          }
        }
      }

      drop(close_rx);
    });
  }

  // Wait for in-flight connections; our own receiver must go first.
  drop(close_rx);
  drop(listener);
  close_tx.closed().await;
}
