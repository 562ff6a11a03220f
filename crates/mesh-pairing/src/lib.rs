#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list @@
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list @@ -->

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mesh_crypto::{PublicAddress, PublicKeyRing, SecretAddress, SecretIdentity};
use mesh_gateway::Gateway;
use mesh_net::{exchange_magic, Dialer, PeerSet, Server};
use mesh_proto::pairing::{self, PairingEnvelope};
use mesh_proto::{negotiate, split, Decoder, Encoder, Muxer};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Deadline for the identity exchange once a link is up.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

/// An error produced during pairing.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Another connection already claimed this pairing session.
    #[error("Pairing session already claimed")]
    AlreadyClaimed,

    /// The session was torn down, or its result already collected.
    #[error("Pairing session closed")]
    Closed,

    /// The peer broke the protocol.
    #[error("Protocol violation: {0}")]
    Violation(&'static str),

    /// A step missed its deadline.
    #[error("Timed out in {0}")]
    Timeout(&'static str),

    /// The wait was cancelled by the caller.
    #[error("Cancelled")]
    ContextCancelled,

    /// Record framing or negotiation failed.
    #[error("Protocol transport failure")]
    Proto(#[from] mesh_proto::Error),

    /// Link establishment failed.
    #[error("Link failure")]
    Net(#[from] mesh_net::Error),

    /// The gateway failed underneath us.
    #[error("Gateway failure")]
    Gateway(#[from] mesh_gateway::Error),

    /// Key material was unusable.
    #[error("Cryptographic failure")]
    Crypto(#[from] mesh_crypto::Error),

    /// An internal error that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// A `Result` with this crate's [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The initiating side of a pairing session.
///
/// Holds a throwaway server whose whole secret is meant to leave the
/// machine out-of-band. Exactly one remote connection will ever be
/// served; [`wait`](PairingServer::wait) collects the peer's real keys.
pub struct PairingServer {
    /// The ephemeral session identity (the shared secret).
    secret: SecretIdentity,
    /// The ephemeral listening address.
    address: SecretAddress,
    /// Authorization registry trusting only the session identity.
    peers: Arc<PeerSet>,
    /// The throwaway listener.
    server: Mutex<Option<Server>>,
    /// Our real keys, sent to the peer during the exchange.
    ours: PublicKeyRing,
    /// Claimed by the first connection to pass TLS.
    claimed: AtomicBool,
    /// Where the successful exchange delivers the peer's keys.
    result_tx: Mutex<Option<oneshot::Sender<PublicKeyRing>>>,
    /// The receiving end, taken by the first `wait`.
    result_rx: Mutex<Option<oneshot::Receiver<PublicKeyRing>>>,
}

impl PairingServer {
    /// Open a pairing session: generate the throwaway material and start
    /// the ephemeral server.
    pub async fn start(
        gateway: &Arc<dyn Gateway>,
        ours: PublicKeyRing,
    ) -> Result<Arc<PairingServer>> {
        let secret = SecretIdentity::generate();
        let address = SecretAddress::generate();
        let local = secret.fingerprint();
        let (result_tx, result_rx) = oneshot::channel();

        let this = Arc::new_cyclic(|weak: &Weak<PairingServer>| {
            let muxer = {
                let weak = weak.clone();
                let mut muxer = Muxer::new(pairing::PROTOCOL);
                muxer.register(
                    pairing::VERSION,
                    Arc::new(move |_fp, decoder, encoder| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            match weak.upgrade() {
                                Some(session) => session
                                    .serve_exchange(decoder, encoder)
                                    .await
                                    .map_err(mesh_proto::Error::handler),
                                None => Ok(()),
                            }
                        })
                    }),
                );
                Arc::new(muxer)
            };
            let handler: mesh_net::ConnHandler = Arc::new(move |fp, stream| {
                let muxer = Arc::clone(&muxer);
                Box::pin(async move { Ok(muxer.serve(fp, stream).await?) })
            });
            PairingServer {
                secret,
                address,
                peers: Arc::new(PeerSet::new(local, handler, None)),
                server: Mutex::new(None),
                ours,
                claimed: AtomicBool::new(false),
                result_tx: Mutex::new(Some(result_tx)),
                result_rx: Mutex::new(Some(result_rx)),
            }
        });

        this.peers.trust(this.secret.public())?;
        let server = Server::start(gateway, &this.address, &this.secret, Arc::clone(&this.peers))
            .await?;
        *this
            .server
            .lock()
            .map_err(|_| Error::Internal("poisoned lock"))? = Some(server);
        info!("pairing session opened");
        Ok(this)
    }

    /// The secret to transport out-of-band: the session identity and the
    /// ephemeral address to dial.
    pub fn secret(&self) -> (SecretIdentity, PublicAddress) {
        (self.secret.clone(), self.address.public())
    }

    /// Wait for the peer's real keys. Cancelling `token` tears the whole
    /// session down. A second call fails with [`Error::Closed`].
    pub async fn wait(&self, token: &CancellationToken) -> Result<PublicKeyRing> {
        let rx = self
            .result_rx
            .lock()
            .map_err(|_| Error::Internal("poisoned lock"))?
            .take()
            .ok_or(Error::Closed)?;
        tokio::select! {
            () = token.cancelled() => {
                self.close();
                Err(Error::ContextCancelled)
            }
            result = rx => result.map_err(|_| Error::Closed),
        }
    }

    /// Tear down the session: server, peer set, and any in-flight link.
    pub fn close(&self) {
        self.peers.close();
        if let Ok(mut server) = self.server.lock() {
            if let Some(server) = server.take() {
                server.close();
            }
        }
    }

    /// Serve the single identity exchange this session will ever do.
    async fn serve_exchange(
        self: Arc<Self>,
        mut decoder: Decoder,
        mut encoder: Encoder,
    ) -> Result<()> {
        // The singleton gate: the first connection to get here wins.
        if self.claimed.swap(true, Ordering::SeqCst) {
            debug!("rejecting extra pairing connection");
            return Err(Error::AlreadyClaimed);
        }
        let theirs = exchange_identities(&mut decoder, &mut encoder, &self.ours).await?;
        let sender = self
            .result_tx
            .lock()
            .map_err(|_| Error::Internal("poisoned lock"))?
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(theirs);
                Ok(())
            }
            None => Err(Error::Closed),
        }
    }
}

impl std::fmt::Debug for PairingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingServer")
            .field("claimed", &self.claimed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// The joining side: dial the ephemeral server with the shared secret
/// and swap real key rings.
pub async fn join(
    gateway: &Arc<dyn Gateway>,
    secret: &SecretIdentity,
    address: &PublicAddress,
    ours: PublicKeyRing,
) -> Result<PublicKeyRing> {
    let stream = gateway.dial(&address.onion()).await?;
    let dialer = Dialer::new(secret)?;
    let (server_identity, stream) = dialer.connect(stream).await?;
    // The server must hold the same shared secret we do.
    if server_identity != secret.public() {
        return Err(Error::Violation("wrong session identity"));
    }
    let stream = exchange_magic(stream).await?;
    let (mut decoder, mut encoder) = split(stream);
    negotiate(
        &mut decoder,
        &mut encoder,
        pairing::PROTOCOL,
        &[pairing::VERSION],
    )
    .await?;
    exchange_identities(&mut decoder, &mut encoder, &ours).await
}

/// Send our real keys while receiving the peer's, both within the
/// exchange deadline.
async fn exchange_identities(
    decoder: &mut Decoder,
    encoder: &mut Encoder,
    ours: &PublicKeyRing,
) -> Result<PublicKeyRing> {
    let envelope = PairingEnvelope::identity(ours.identity, ours.address);
    let outcome = tokio::time::timeout(EXCHANGE_TIMEOUT, async {
        tokio::try_join!(
            async { Ok::<_, Error>(encoder.send(&envelope).await?) },
            async { Ok::<_, Error>(decoder.recv::<PairingEnvelope>().await?) }
        )
    })
    .await;
    let ((), theirs) = match outcome {
        Ok(inner) => inner?,
        Err(_) => return Err(Error::Timeout("identity exchange")),
    };
    let theirs = theirs
        .identity
        .ok_or(Error::Violation("expected identity record"))?;
    Ok(PublicKeyRing::new(theirs.identity, theirs.address))
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use mesh_crypto::SecretKeyRing;
    use mesh_gateway::MockNetwork;

    /// A fresh real key ring's public half.
    fn real_keys() -> PublicKeyRing {
        SecretKeyRing::generate().public()
    }

    #[tokio::test]
    async fn pairing_exchanges_real_keys() {
        let network = MockNetwork::new();
        let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
        let alice = real_keys();
        let bob = real_keys();

        let session = PairingServer::start(&gateway, alice.clone()).await.unwrap();
        let (secret, address) = session.secret();

        let join_gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
        let bob_clone = bob.clone();
        let joiner = tokio::spawn(async move {
            join(&join_gateway, &secret, &address, bob_clone).await
        });

        let seen_by_alice = session.wait(&CancellationToken::new()).await.unwrap();
        let seen_by_bob = joiner.await.unwrap().unwrap();
        assert_eq!(seen_by_alice, bob);
        assert_eq!(seen_by_bob, alice);
    }

    #[tokio::test]
    async fn second_connection_is_rejected() {
        let network = MockNetwork::new();
        let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
        let session = PairingServer::start(&gateway, real_keys()).await.unwrap();
        let (secret, address) = session.secret();

        let first = join(&gateway, &secret, &address, real_keys()).await;
        assert!(first.is_ok());
        let _ = session.wait(&CancellationToken::new()).await.unwrap();

        // The session is claimed; a second join cannot complete.
        let second = join(&gateway, &secret, &address, real_keys()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn wait_twice_is_closed() {
        let network = MockNetwork::new();
        let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
        let session = PairingServer::start(&gateway, real_keys()).await.unwrap();
        let (secret, address) = session.secret();
        join(&gateway, &secret, &address, real_keys()).await.unwrap();
        session.wait(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            session.wait(&CancellationToken::new()).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn cancelled_wait_tears_down() {
        let network = MockNetwork::new();
        let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
        let session = PairingServer::start(&gateway, real_keys()).await.unwrap();
        let (secret, address) = session.secret();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            session.wait(&token).await,
            Err(Error::ContextCancelled)
        ));
        // The ephemeral address is gone from the network.
        assert!(join(&gateway, &secret, &address, real_keys()).await.is_err());
    }

    #[tokio::test]
    async fn wrong_secret_cannot_join() {
        let network = MockNetwork::new();
        let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
        let session = PairingServer::start(&gateway, real_keys()).await.unwrap();
        let (_secret, address) = session.secret();

        let wrong = SecretIdentity::generate();
        assert!(join(&gateway, &wrong, &address, real_keys()).await.is_err());
    }
}
