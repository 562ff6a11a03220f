//! One listening endpoint of a node.
//!
//! A [`Server`] binds a gateway listener for a single local address,
//! wraps every inbound stream in mutual TLS, and feeds the result to the
//! peer set. Each accepted stream gets its own task, because a slow TLS
//! handshake must not block the accept loop.

use std::sync::Arc;

use mesh_crypto::{Fingerprint, OnionAddr, SecretAddress, SecretIdentity};
use mesh_gateway::Gateway;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::peers::PeerSet;
use crate::{tls, Result};

/// A running listener for one local address.
///
/// Dropping or [`close`](Server::close)-ing the server stops the accept
/// loop and unpublishes the hidden address. Streams already handed to the
/// peer set live on until the peer set ends them.
pub struct Server {
    /// Fingerprint of the address we serve.
    address_fp: Fingerprint,
    /// The hidden address peers dial.
    onion: OnionAddr,
    /// Cancels the accept loop.
    shutdown: CancellationToken,
}

impl Server {
    /// Bind `address` on `gateway` and start accepting.
    ///
    /// Every accepted stream performs a TLS handshake presenting
    /// `identity`'s certificate and is then handed to `peers`.
    pub async fn start(
        gateway: &Arc<dyn Gateway>,
        address: &SecretAddress,
        identity: &SecretIdentity,
        peers: Arc<PeerSet>,
    ) -> Result<Server> {
        let mut listener = gateway.listen(address).await?;
        let acceptor = tls::acceptor(identity)?;
        let onion = *listener.onion();
        let address_fp = address.fingerprint();
        let shutdown = CancellationToken::new();

        let loop_shutdown = shutdown.clone();
        tokio::spawn(async move {
            debug!(%onion, "server accepting");
            loop {
                let stream = tokio::select! {
                    () = loop_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(%onion, error = %e, "accept failed; server stopping");
                            break;
                        }
                    },
                };
                let acceptor = acceptor.clone();
                let peers = Arc::clone(&peers);
                tokio::spawn(async move {
                    let (identity, stream) = match tls::accept(&acceptor, stream).await {
                        Ok(done) => done,
                        Err(e) => {
                            trace!(error = %e, "inbound TLS handshake failed");
                            return;
                        }
                    };
                    // Errors here are per-link; the peer set already
                    // logged anything interesting.
                    let _ = peers
                        .handle(identity, stream, crate::Direction::Inbound)
                        .await;
                });
            }
            debug!(%onion, "server stopped");
        });

        Ok(Server {
            address_fp,
            onion,
            shutdown,
        })
    }

    /// Fingerprint of the address this server listens for.
    pub fn address_fp(&self) -> &Fingerprint {
        &self.address_fp
    }

    /// The hidden address this server is reachable at.
    pub fn onion(&self) -> &OnionAddr {
        &self.onion
    }

    /// Stop accepting and unpublish the address.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("onion", &self.onion)
            .finish_non_exhaustive()
    }
}
