//! The peer set: authorization registry and live-connection table.
//!
//! Every authenticated stream, inbound or outbound, passes through
//! [`PeerSet::handle`], which enforces the link rules: the peer must be
//! authorized, at most one link per peer may exist, both sides must speak
//! the protocol magic within a second, and an idle link is eventually
//! broken. Only then does the application handler see the stream.
//!
//! Deduplication keeps one link per peer. When both sides dial each other
//! at the same moment, plain refusal could kill both cross links, so the
//! tie is broken deterministically: an inbound link from a peer whose
//! fingerprint sorts below ours may replace our own *pending* attempt;
//! every other duplicate is refused, and a link that has finished the
//! magic exchange is never evicted. Both ends reach the same verdict, so
//! exactly one link survives.
//!
//! We keep a blocking `RwLock` close to async code here, so the lock must
//! never be held across an await; every method takes it, finishes, and
//! drops it before any IO happens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use mesh_crypto::{Fingerprint, PublicIdentity};
use mesh_gateway::GatewayStream;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::breaker::Breaker;
use crate::{Error, Result};

/// The 8-byte protocol magic exchanged right after the TLS handshake.
pub const MAGIC: [u8; 8] = *b"COVID-19";

/// Deadline for the magic exchange.
const MAGIC_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side opened a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Direction {
    /// The peer dialed us.
    Inbound,
    /// We dialed the peer.
    Outbound,
}

/// The application entry point for an established link.
///
/// Receives the peer fingerprint and exclusive ownership of the stream;
/// the link is torn down when the future resolves.
pub type ConnHandler =
    Arc<dyn Fn(Fingerprint, GatewayStream) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A registered live connection.
struct Conn {
    /// Unique id of this registration, so a replaced connection's
    /// cleanup cannot evict its successor.
    id: u64,
    /// Cancels the connection's handler.
    token: CancellationToken,
    /// Set once the magic exchange finished; established links are
    /// never evicted by a crossing dial.
    established: Arc<AtomicBool>,
}

/// Mutable state of a peer set, inside its lock.
struct Inner {
    /// Identities allowed to connect, by fingerprint.
    auths: HashMap<Fingerprint, PublicIdentity>,
    /// Live connection per peer.
    conns: HashMap<Fingerprint, Conn>,
    /// Whether [`PeerSet::close`] has run.
    closed: bool,
}

/// Authorization registry and live-connection table.
pub struct PeerSet {
    /// Our own identity fingerprint, for the deduplication tie-break.
    local: Fingerprint,
    /// The state, within a lock.
    inner: RwLock<Inner>,
    /// Application handler invoked once a link is fully established.
    handler: ConnHandler,
    /// Idle timeout applied to established links, if any.
    idle_timeout: Option<Duration>,
    /// Source of registration ids.
    next_id: AtomicU64,
}

impl PeerSet {
    /// Create a peer set for the identity `local`, with no authorized
    /// peers yet.
    pub fn new(local: Fingerprint, handler: ConnHandler, idle_timeout: Option<Duration>) -> Self {
        PeerSet {
            local,
            inner: RwLock::new(Inner {
                auths: HashMap::new(),
                conns: HashMap::new(),
                closed: false,
            }),
            handler,
            idle_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Authorize `identity` to connect.
    pub fn trust(&self, identity: PublicIdentity) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Internal("poisoned lock"))?;
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.auths.insert(identity.fingerprint(), identity);
        Ok(())
    }

    /// Revoke authorization and tear down any live link for `fp`.
    pub fn untrust(&self, fp: &Fingerprint) -> Result<()> {
        let conn = {
            let mut inner = self.inner.write().map_err(|_| Error::Internal("poisoned lock"))?;
            inner.auths.remove(fp);
            inner.conns.remove(fp)
        };
        if let Some(conn) = conn {
            debug!(peer = %fp, "closing link of untrusted peer");
            conn.token.cancel();
        }
        Ok(())
    }

    /// Tear down every link and refuse all future work.
    pub fn close(&self) {
        let tokens: Vec<CancellationToken> = {
            let mut inner = match self.inner.write() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            inner.closed = true;
            inner.auths.clear();
            inner.conns.drain().map(|(_, c)| c.token).collect()
        };
        for token in tokens {
            token.cancel();
        }
    }

    /// Whether a live link to `fp` exists right now.
    pub fn is_connected(&self, fp: &Fingerprint) -> bool {
        self.inner
            .read()
            .map(|inner| inner.conns.contains_key(fp))
            .unwrap_or(false)
    }

    /// Return the authorized identity for `fp`, if any.
    pub fn authorized(&self, fp: &Fingerprint) -> Option<PublicIdentity> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.auths.get(fp).copied())
    }

    /// Drive one authenticated stream through the link rules and, if they
    /// all pass, the application handler.
    ///
    /// `identity` must be the identity extracted from the peer's TLS
    /// certificate. The future resolves when the link is finished.
    pub async fn handle(
        &self,
        identity: PublicIdentity,
        stream: GatewayStream,
        direction: Direction,
    ) -> Result<()> {
        let fp = identity.fingerprint();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let established = Arc::new(AtomicBool::new(false));
        let (token, evicted) = {
            let mut inner = self.inner.write().map_err(|_| Error::Internal("poisoned lock"))?;
            if inner.closed {
                return Err(Error::Closed);
            }
            match inner.auths.get(&fp) {
                Some(known) if *known == identity => {}
                _ => {
                    debug!(peer = %fp, "dropping unauthorized peer");
                    return Err(Error::Unauthorized(fp));
                }
            }
            let mut evicted = None;
            if let Some(existing) = inner.conns.get(&fp) {
                // Cross-connect tie-break: the inbound link of the
                // smaller fingerprint may replace a still-pending
                // attempt of ours; everything else is refused.
                let replaceable = !existing.established.load(Ordering::SeqCst)
                    && direction == Direction::Inbound
                    && fp < self.local;
                if replaceable {
                    evicted = inner.conns.remove(&fp);
                } else {
                    trace!(peer = %fp, "dropping duplicate link");
                    return Err(Error::Duplicate(fp));
                }
            }
            let token = CancellationToken::new();
            inner.conns.insert(
                fp,
                Conn {
                    id,
                    token: token.clone(),
                    established: Arc::clone(&established),
                },
            );
            (token, evicted)
        };
        if let Some(evicted) = evicted {
            debug!(peer = %fp, "replacing crossed link");
            evicted.token.cancel();
        }

        let result = self.run(fp, stream, token, established).await;

        if let Ok(mut inner) = self.inner.write() {
            // Only remove our own registration; we may have been
            // replaced by a crossed link while finishing.
            if inner.conns.get(&fp).map(|c| c.id) == Some(id) {
                inner.conns.remove(&fp);
            }
        }
        if let Err(e) = &result {
            debug!(peer = %fp, error = %e, "link finished with error");
        }
        result
    }

    /// The post-registration part of [`PeerSet::handle`].
    async fn run(
        &self,
        fp: Fingerprint,
        stream: GatewayStream,
        token: CancellationToken,
        established: Arc<AtomicBool>,
    ) -> Result<()> {
        let stream = tokio::select! {
            () = token.cancelled() => return Err(Error::Closed),
            stream = exchange_magic(stream) => stream?,
        };
        established.store(true, Ordering::SeqCst);
        let stream: GatewayStream = match self.idle_timeout {
            Some(timeout) => Box::new(Breaker::new(stream, timeout)),
            None => stream,
        };
        trace!(peer = %fp, "link established");
        let fut = (self.handler)(fp, stream);
        tokio::select! {
            () = token.cancelled() => {
                debug!(peer = %fp, "link cancelled");
                Err(Error::Closed)
            }
            res = fut => res,
        }
    }
}

impl std::fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (auths, conns) = self
            .inner
            .read()
            .map(|i| (i.auths.len(), i.conns.len()))
            .unwrap_or((0, 0));
        f.debug_struct("PeerSet")
            .field("auths", &auths)
            .field("conns", &conns)
            .finish_non_exhaustive()
    }
}

/// Send our magic while reading the peer's; both under one deadline.
///
/// Server-side links get this from [`PeerSet::handle`]; pure clients
/// (event guests, pairing joiners) call it themselves right after TLS.
pub async fn exchange_magic(stream: GatewayStream) -> Result<GatewayStream> {
    let (mut r, mut w) = tokio::io::split(stream);
    let outcome = tokio::time::timeout(MAGIC_TIMEOUT, async {
        tokio::try_join!(
            async {
                w.write_all(&MAGIC).await?;
                w.flush().await?;
                Ok::<_, Error>(())
            },
            async {
                let mut buf = [0_u8; 8];
                r.read_exact(&mut buf).await?;
                Ok::<_, Error>(buf)
            }
        )
    })
    .await;
    let ((), theirs) = match outcome {
        Ok(inner) => inner?,
        Err(_) => {
            warn!("peer failed to complete the magic exchange in time");
            return Err(Error::HandshakeTimeout("magic exchange"));
        }
    };
    if theirs != MAGIC {
        return Err(Error::MagicMismatch);
    }
    Ok(r.unsplit(w))
}
