//! The node: one user's presence on the overlay.
//!
//! A [`Node`] owns the key ring, runs one [`Server`] per local address,
//! dials peers on demand, and performs the address-rotation handshake on
//! every established link. Rotation is how old addresses die: after a
//! peer is removed, the remaining peers are told the new preferred
//! address on their next link, migrate to it, and the address they left
//! behind is retired once nobody is associated with it any more.
//!
//! Every ring mutation happens under the node's write lock and fires the
//! ring-change callback exactly once, while the lock is still held, so
//! the persisted ring can never get ahead of or behind the live one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use mesh_crypto::{Fingerprint, PublicAddress, PublicKeyRing, SecretKeyRing};
use mesh_gateway::{Gateway, GatewayStream};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tracing::{debug, error, info, trace};

use crate::peers::{ConnHandler, PeerSet};
use crate::server::Server;
use crate::tls::Dialer;
use crate::{Error, Result};

/// Timing knobs of a node.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct NodeConfig {
    /// Idle timeout applied to every peer link; `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Deadline for the address-rotation exchange. The default of one
    /// second is tight on a high-latency anonymizing network; deployments
    /// there may want to raise it.
    pub rotation_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            idle_timeout: Some(Duration::from_secs(5 * 60)),
            rotation_timeout: Duration::from_secs(1),
        }
    }
}

/// Callback fired (under the node's write lock) after every ring change.
///
/// An error means the new ring could not be persisted; the mutation
/// stands in memory, but the failure is surfaced to the caller because
/// the system cannot safely diverge its on-disk view.
pub type RingCallback = Box<
    dyn Fn(&SecretKeyRing) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// One user's presence on the overlay.
pub struct Node {
    /// The gateway carrying all our traffic.
    gateway: Arc<dyn Gateway>,
    /// Timing knobs.
    config: NodeConfig,
    /// The key ring, behind the node's lock.
    ring: RwLock<SecretKeyRing>,
    /// Live servers by address fingerprint.
    servers: Mutex<HashMap<Fingerprint, Server>>,
    /// Authorization and live-link registry.
    peers: Arc<PeerSet>,
    /// Outbound TLS dialer presenting our identity.
    dialer: Dialer,
    /// Application handler run after the rotation handshake.
    app: ConnHandler,
    /// Ring-change callback.
    callback: RingCallback,
}

impl Node {
    /// Start a node: build the peer set from `ring.trusted`, start one
    /// server per local address, and stand ready to dial.
    pub async fn start(
        gateway: Arc<dyn Gateway>,
        ring: SecretKeyRing,
        config: NodeConfig,
        app: ConnHandler,
        callback: RingCallback,
    ) -> Result<Arc<Node>> {
        let dialer = Dialer::new(ring.identity())?;
        let idle_timeout = config.idle_timeout;
        let local = ring.identity().fingerprint();

        let node = Arc::new_cyclic(|weak: &Weak<Node>| {
            let weak = weak.clone();
            let handler: ConnHandler = Arc::new(move |fp, stream| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(node) => node.handle_conn(fp, stream).await,
                        None => Err(Error::Closed),
                    }
                })
            });
            Node {
                gateway,
                config,
                peers: Arc::new(PeerSet::new(local, handler, idle_timeout)),
                ring: RwLock::new(ring),
                servers: Mutex::new(HashMap::new()),
                dialer,
                app,
                callback,
            }
        });

        let (identity, addresses, trusted) = {
            let ring = node.read_ring()?;
            (
                ring.identity().clone(),
                ring.addresses().to_vec(),
                ring.trusted().values().cloned().collect::<Vec<_>>(),
            )
        };
        for peer in trusted {
            node.peers.trust(peer.identity)?;
        }
        for address in addresses {
            let server =
                Server::start(&node.gateway, &address, &identity, Arc::clone(&node.peers)).await?;
            node.servers
                .lock()
                .map_err(|_| Error::Internal("poisoned lock"))?
                .insert(*server.address_fp(), server);
        }
        info!(identity = %node.fingerprint()?, "node started");
        Ok(node)
    }

    /// The local identity fingerprint.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(self.read_ring()?.identity().fingerprint())
    }

    /// The public keys we advertise about ourselves.
    pub fn public(&self) -> Result<PublicKeyRing> {
        Ok(self.read_ring()?.public())
    }

    /// A point-in-time copy of the whole key ring.
    pub fn ring_snapshot(&self) -> Result<SecretKeyRing> {
        Ok(self.read_ring()?.clone())
    }

    /// The node's peer set.
    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    /// Begin trusting `peer`: record it in the ring under the preferred
    /// address and authorize it in the peer set.
    pub fn trust(&self, peer: PublicKeyRing) -> Result<()> {
        let identity = peer.identity;
        self.mutate_ring(|ring| ring.trust(peer).map(|()| ((), true)))?;
        self.peers.trust(identity)?;
        debug!(peer = %identity.fingerprint(), "peer trusted");
        Ok(())
    }

    /// Stop trusting `fp`: drop it from the peer set (closing any live
    /// link), remove it from the ring, rotate in a fresh preferred
    /// address, and retire any address left empty.
    pub async fn untrust(&self, fp: &Fingerprint) -> Result<()> {
        let outcome = self.mutate_ring(|ring| ring.untrust(fp).map(|o| (o, true)))?;
        self.peers.untrust(fp)?;

        {
            let mut servers = self
                .servers
                .lock()
                .map_err(|_| Error::Internal("poisoned lock"))?;
            for retired in &outcome.retired {
                if let Some(server) = servers.remove(retired) {
                    info!(address = %retired, "retiring emptied address");
                    server.close();
                }
            }
        }

        let identity = self.read_ring()?.identity().clone();
        let server = Server::start(
            &self.gateway,
            &outcome.new_address,
            &identity,
            Arc::clone(&self.peers),
        )
        .await?;
        self.servers
            .lock()
            .map_err(|_| Error::Internal("poisoned lock"))?
            .insert(*server.address_fp(), server);
        debug!(peer = %fp, "peer untrusted; fresh address published");
        Ok(())
    }

    /// Dial `fp` at its believed address and drive the link until it
    /// finishes. Dropping the returned future abandons the attempt.
    pub async fn dial(&self, fp: &Fingerprint) -> Result<()> {
        let address = {
            let ring = self.read_ring()?;
            ring.trusted_peer(fp)
                .ok_or(Error::UnknownPeer(*fp))?
                .address
        };
        trace!(peer = %fp, "dialing");
        let stream = self.gateway.dial(&address.onion()).await?;
        let (identity, stream) = self.dialer.connect(stream).await?;
        self.peers
            .handle(identity, stream, crate::Direction::Outbound)
            .await
    }

    /// Tear the node down: close every server and every link.
    pub fn close(&self) {
        self.peers.close();
        if let Ok(mut servers) = self.servers.lock() {
            for (_, server) in servers.drain() {
                server.close();
            }
        }
    }

    /// Peer-set handler: run the rotation handshake, absorb what it
    /// teaches us, then hand the stream to the application.
    async fn handle_conn(self: Arc<Self>, fp: Fingerprint, stream: GatewayStream) -> Result<()> {
        let (preferred_local, believed_remote) = {
            let ring = self.read_ring()?;
            let peer = ring.trusted_peer(&fp).ok_or(Error::Unauthorized(fp))?;
            (ring.preferred_address().public(), peer.address)
        };

        let (stream, requested_remote, believed_local) = rotation_exchange(
            stream,
            &preferred_local,
            &believed_remote,
            self.config.rotation_timeout,
        )
        .await?;

        // The peer asks to be reached at its preferred address; adopt it
        // if our book is stale.
        if requested_remote != believed_remote {
            debug!(peer = %fp, "peer rotated to a new address");
            self.mutate_ring(|ring| {
                let changed = ring.update_trusted_address(&fp, requested_remote)?;
                Ok(((), changed))
            })?;
        }

        // The peer has caught up with our preferred address; migrate it
        // there and retire whatever address that empties.
        if believed_local == preferred_local {
            let retired = self.mutate_ring(|ring| {
                let outcome = ring.move_to_preferred(&fp)?;
                Ok((outcome.retired, outcome.moved))
            })?;
            if let Some(retired) = retired {
                let server = {
                    let mut servers = self
                        .servers
                        .lock()
                        .map_err(|_| Error::Internal("poisoned lock"))?;
                    servers.remove(&retired)
                };
                if let Some(server) = server {
                    info!(address = %retired, "retiring emptied address");
                    server.close();
                }
            }
        }

        (self.app)(fp, stream).await
    }

    /// Take the read lock, surviving poisoning as an internal error.
    fn read_ring(&self) -> Result<std::sync::RwLockReadGuard<'_, SecretKeyRing>> {
        self.ring.read().map_err(|_| Error::Internal("poisoned lock"))
    }

    /// Run `f` on the ring under the write lock; when it reports a
    /// change, fire the ring callback before the lock is released.
    fn mutate_ring<T>(
        &self,
        f: impl FnOnce(&mut SecretKeyRing) -> mesh_crypto::Result<(T, bool)>,
    ) -> Result<T> {
        let mut ring = self
            .ring
            .write()
            .map_err(|_| Error::Internal("poisoned lock"))?;
        let (out, changed) = f(&mut ring)?;
        if changed {
            if let Err(e) = (self.callback)(&ring) {
                error!(error = %e, "ring persistence failed; states may diverge");
                return Err(Error::RingCallback(Arc::from(e)));
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

/// Run the address-rotation frame: write our preferred local address and
/// the address we believe the peer is at; read the peer's pair of the
/// same; all within `deadline`.
async fn rotation_exchange(
    stream: GatewayStream,
    preferred_local: &PublicAddress,
    believed_remote: &PublicAddress,
    deadline: Duration,
) -> Result<(GatewayStream, PublicAddress, PublicAddress)> {
    let (mut r, mut w) = tokio::io::split(stream);
    let ours = {
        let mut buf = [0_u8; 64];
        buf[..32].copy_from_slice(preferred_local.as_bytes());
        buf[32..].copy_from_slice(believed_remote.as_bytes());
        buf
    };
    let outcome = tokio::time::timeout(deadline, async {
        tokio::try_join!(
            async {
                w.write_all(&ours).await?;
                w.flush().await?;
                Ok::<_, Error>(())
            },
            async {
                let mut buf = [0_u8; 64];
                r.read_exact(&mut buf).await?;
                Ok::<_, Error>(buf)
            }
        )
    })
    .await;
    let ((), theirs) = match outcome {
        Ok(inner) => inner?,
        Err(_) => return Err(Error::HandshakeTimeout("address rotation")),
    };
    let requested_remote = PublicAddress::from_bytes(&theirs[..32])?;
    let believed_local = PublicAddress::from_bytes(&theirs[32..])?;
    Ok((r.unsplit(w), requested_remote, believed_local))
}
