//! The organizer side of the event protocol.
//!
//! An [`EventServer`] is a private overlay in miniature: it listens at
//! the event's own hidden address under the event's own identity, and its
//! peer set authorizes exactly two kinds of keys — the pseudonyms of
//! checked-in participants, and the ephemeral credentials of checkin
//! sessions still in flight.
//!
//! A checkin session is consumed the moment a connection arrives under
//! its credential, whatever happens next; a credential that has ever been
//! used or closed can never be used again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use mesh_crypto::{Fingerprint, PublicAddress, PublicIdentity, SecretIdentity};
use mesh_gateway::Gateway;
use mesh_net::{PeerSet, Server};
use mesh_proto::event::{self, EventEnvelope, InfectionStatus, Report};
use mesh_proto::{Decoder, Encoder, Muxer, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    valid_transition, CallbackError, Error, HostedEvent, Result, CHECKIN_TIMEOUT, IDLE_TIMEOUT,
};

/// What the event server needs from the application.
pub trait EventHost: Send + Sync + 'static {
    /// The event state changed; persist `event`. Failures are logged and
    /// do not abort the protocol handler.
    fn on_update(&self, event: &HostedEvent) -> std::result::Result<(), CallbackError>;

    /// A report was accepted for `pseudonym` with the given status.
    fn on_report(&self, event: &Fingerprint, pseudonym: &Fingerprint, status: InfectionStatus);

    /// Fetch the banner image bytes for `event` from storage.
    fn banner(&self, event: &HostedEvent) -> std::result::Result<Vec<u8>, CallbackError>;
}

/// The out-of-band blob an organizer hands to an invitee.
///
/// The ephemeral session identity doubles as the guest's TLS credential,
/// which keeps the blob as small as a QR code wants it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CheckinCredential {
    /// The one-shot session identity, shared secret between both sides.
    pub session: SecretIdentity,
    /// The event's identity key.
    pub identity: PublicIdentity,
    /// The event's listening address.
    pub address: PublicAddress,
}

/// Progress of one checkin session.
#[derive(Clone, Copy, Debug)]
enum CheckinOutcome {
    /// Nobody has redeemed the credential yet.
    Pending,
    /// A guest checked in; their pseudonym fingerprint.
    Done(Fingerprint),
    /// The session was consumed without a successful checkin.
    Closed,
}

/// A checkin session as handed to the application.
#[derive(Clone, Debug)]
pub struct CheckinSession {
    /// The credential to transport out-of-band.
    credential: CheckinCredential,
    /// Watched session outcome.
    outcome: watch::Receiver<CheckinOutcome>,
}

impl CheckinSession {
    /// The credential to hand to the invitee.
    pub fn credential(&self) -> &CheckinCredential {
        &self.credential
    }

    /// Wait until the session concludes, returning the new participant's
    /// pseudonym fingerprint. Cancelling `token` aborts the wait.
    pub async fn wait(&mut self, token: &CancellationToken) -> Result<Fingerprint> {
        loop {
            match *self.outcome.borrow() {
                CheckinOutcome::Done(fp) => return Ok(fp),
                CheckinOutcome::Closed => return Err(Error::Closed),
                CheckinOutcome::Pending => {}
            }
            tokio::select! {
                () = token.cancelled() => return Err(Error::ContextCancelled),
                changed = self.outcome.changed() => {
                    changed.map_err(|_| Error::Closed)?;
                }
            }
        }
    }
}

/// A checkin session's server-side state.
struct ActiveCheckin {
    /// The ephemeral session identity.
    secret: SecretIdentity,
    /// Where the outcome is announced.
    outcome_tx: watch::Sender<CheckinOutcome>,
    /// Kept so further [`EventServer::checkin`] calls can reissue the
    /// same session.
    outcome_rx: watch::Receiver<CheckinOutcome>,
}

/// The running server for one hosted event.
pub struct EventServer {
    /// The event state, behind the event server's lock.
    state: RwLock<HostedEvent>,
    /// Checkin sessions still redeemable, by credential fingerprint.
    checkins: Mutex<HashMap<Fingerprint, ActiveCheckin>>,
    /// Authorization and link registry for this event only.
    peers: Arc<PeerSet>,
    /// The listener at the event's hidden address.
    server: Mutex<Option<Server>>,
    /// Application callbacks.
    host: Arc<dyn EventHost>,
    /// Banner bytes, cached after the first metadata request.
    banner_cache: Mutex<Option<Vec<u8>>>,
}

impl EventServer {
    /// Start serving `event`: authorize all known participants, publish
    /// the event address, and answer guests.
    pub async fn start(
        gateway: &Arc<dyn Gateway>,
        event: HostedEvent,
        host: Arc<dyn EventHost>,
    ) -> Result<Arc<EventServer>> {
        let local = event.fingerprint();
        let this = Arc::new_cyclic(|weak: &Weak<EventServer>| {
            let muxer = {
                let weak = weak.clone();
                let mut muxer = Muxer::new(event::PROTOCOL);
                muxer.register(
                    event::VERSION,
                    Arc::new(move |fp, decoder, encoder| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            match weak.upgrade() {
                                Some(server) => server
                                    .handle_v1(fp, decoder, encoder)
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
            EventServer {
                state: RwLock::new(event),
                checkins: Mutex::new(HashMap::new()),
                peers: Arc::new(PeerSet::new(local, handler, Some(IDLE_TIMEOUT))),
                server: Mutex::new(None),
                host,
                banner_cache: Mutex::new(None),
            }
        });

        let (identity, address, participants) = {
            let state = this.read_state()?;
            (
                state.identity.clone(),
                state.address.clone(),
                state.participants.values().copied().collect::<Vec<_>>(),
            )
        };
        for pseudonym in participants {
            this.peers.trust(pseudonym)?;
        }
        let server = Server::start(gateway, &address, &identity, Arc::clone(&this.peers)).await?;
        *this
            .server
            .lock()
            .map_err(|_| Error::Internal("poisoned lock"))? = Some(server);
        info!(event = %identity.fingerprint(), "event server started");
        Ok(this)
    }

    /// A point-in-time copy of the event state.
    pub fn snapshot(&self) -> Result<HostedEvent> {
        Ok(self.read_state()?.clone())
    }

    /// The fingerprint naming this event.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(self.read_state()?.fingerprint())
    }

    /// Open (or re-issue) a checkin session.
    ///
    /// While a session is pending, further calls return the same session;
    /// a new credential is only minted once the previous one is consumed.
    /// Fails with [`Error::EventConcluded`] after termination.
    pub fn checkin(&self) -> Result<CheckinSession> {
        let (identity, address) = {
            let state = self.read_state()?;
            if state.concluded() {
                return Err(Error::EventConcluded);
            }
            (state.identity.public(), state.address.public())
        };
        let mut checkins = self
            .checkins
            .lock()
            .map_err(|_| Error::Internal("poisoned lock"))?;
        if let Some(active) = checkins.values().next() {
            return Ok(CheckinSession {
                credential: CheckinCredential {
                    session: active.secret.clone(),
                    identity,
                    address,
                },
                outcome: active.outcome_rx.clone(),
            });
        }

        let secret = SecretIdentity::generate();
        self.peers.trust(secret.public())?;
        let (outcome_tx, outcome_rx) = watch::channel(CheckinOutcome::Pending);
        checkins.insert(
            secret.fingerprint(),
            ActiveCheckin {
                secret: secret.clone(),
                outcome_tx,
                outcome_rx: outcome_rx.clone(),
            },
        );
        debug!(event = %identity.fingerprint(), "checkin session opened");
        Ok(CheckinSession {
            credential: CheckinCredential {
                session: secret,
                identity,
                address,
            },
            outcome: outcome_rx,
        })
    }

    /// Conclude the event: set its end time and close every open checkin
    /// session. Fails with [`Error::EventConcluded`] if already done.
    pub fn terminate(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.write_state()?;
            if state.concluded() {
                return Err(Error::EventConcluded);
            }
            state.end = Timestamp::now();
            state.updated = state.end;
            state.clone()
        };
        self.close_checkins();
        self.notify_update(&snapshot);
        info!(event = %snapshot.fingerprint(), "event terminated");
        Ok(())
    }

    /// Stop serving: close every link, session, and the listener.
    pub fn close(&self) {
        self.close_checkins();
        self.peers.close();
        if let Ok(mut server) = self.server.lock() {
            if let Some(server) = server.take() {
                server.close();
            }
        }
    }

    /// Drain the checkin map, announcing `Closed` to every waiter.
    fn close_checkins(&self) {
        let drained: Vec<ActiveCheckin> = match self.checkins.lock() {
            Ok(mut checkins) => checkins.drain().map(|(_, a)| a).collect(),
            Err(_) => return,
        };
        for active in drained {
            let _ = active.outcome_tx.send(CheckinOutcome::Closed);
            let _ = self.peers.untrust(&active.secret.fingerprint());
        }
    }

    /// Entry point for every negotiated connection: a live checkin
    /// credential means a checkin, a known pseudonym means data exchange.
    async fn handle_v1(
        self: Arc<Self>,
        fp: Fingerprint,
        mut decoder: Decoder,
        mut encoder: Encoder,
    ) -> Result<()> {
        let session = {
            let mut checkins = self
                .checkins
                .lock()
                .map_err(|_| Error::Internal("poisoned lock"))?;
            // One shot: whatever happens from here on, this credential is
            // spent.
            checkins.remove(&fp)
        };
        if let Some(session) = session {
            let result = self.do_checkin(&mut decoder, &mut encoder).await;
            let outcome = match &result {
                Ok(pseudonym) => CheckinOutcome::Done(*pseudonym),
                Err(_) => CheckinOutcome::Closed,
            };
            let _ = session.outcome_tx.send(outcome);
            return result.map(|_| ());
        }

        let known = self.read_state()?.participants.contains_key(&fp);
        if !known {
            return Err(Error::Violation("connection from unknown role"));
        }
        self.data_exchange(fp, &mut decoder, &mut encoder).await
    }

    /// Run one checkin under its single end-to-end deadline.
    async fn do_checkin(&self, decoder: &mut Decoder, encoder: &mut Encoder) -> Result<Fingerprint> {
        timeout(CHECKIN_TIMEOUT, self.checkin_exchange(decoder, encoder))
            .await
            .map_err(|_| Error::Timeout("checkin"))?
    }

    /// Receive the checkin record, verify the pseudonym's signature over
    /// our identity, grant membership, and acknowledge.
    async fn checkin_exchange(
        &self,
        decoder: &mut Decoder,
        encoder: &mut Encoder,
    ) -> Result<Fingerprint> {
        let envelope = decoder.recv::<EventEnvelope>().await?;
        let checkin = envelope.checkin.ok_or(Error::Violation("expected checkin"))?;

        let pseudonym = PublicIdentity::from_bytes(&checkin.pseudonym)
            .map_err(|_| Error::InvalidSize { field: "pseudonym" })?;
        let event_identity = self.read_state()?.identity.public();
        pseudonym
            .verify(event_identity.as_bytes(), &checkin.signature)
            .map_err(|_| Error::InvalidSignature)?;

        let pfp = pseudonym.fingerprint();
        let snapshot = {
            let mut state = self.write_state()?;
            state.participants.insert(pfp, pseudonym);
            state.updated = Timestamp::now();
            state.clone()
        };
        self.peers.trust(pseudonym)?;
        self.notify_update(&snapshot);
        debug!(event = %snapshot.fingerprint(), participant = %pfp, "guest checked in");

        encoder.send(&EventEnvelope::checkin_ack()).await?;
        Ok(pfp)
    }

    /// The long-lived phase: answer metadata and status requests and
    /// apply signed reports until the guest goes away.
    async fn data_exchange(
        &self,
        fp: Fingerprint,
        decoder: &mut Decoder,
        encoder: &mut Encoder,
    ) -> Result<()> {
        loop {
            let envelope = match decoder.recv::<EventEnvelope>().await {
                Ok(envelope) => envelope,
                // EOF and idle-breaker both end the link quietly.
                Err(_) => return Ok(()),
            };
            if envelope.get_metadata.is_some() {
                let (name, banner) = self.metadata()?;
                encoder.send(&EventEnvelope::metadata(name, banner)).await?;
            } else if envelope.get_status.is_some() {
                let stats = self.read_state()?.stats();
                encoder.send(&EventEnvelope::status(stats)).await?;
            } else if let Some(report) = envelope.report {
                self.apply_report(fp, report, encoder).await?;
            } else {
                return Err(Error::Violation("unexpected record"));
            }
        }
    }

    /// Produce the metadata record contents, filling the banner cache on
    /// first use.
    fn metadata(&self) -> Result<(String, Vec<u8>)> {
        let snapshot = self.read_state()?.clone();
        let mut cache = self
            .banner_cache
            .lock()
            .map_err(|_| Error::Internal("poisoned lock"))?;
        if cache.is_none() {
            match self.host.banner(&snapshot) {
                Ok(bytes) => *cache = Some(bytes),
                Err(e) => {
                    warn!(event = %snapshot.fingerprint(), error = %e, "banner fetch failed");
                    *cache = Some(Vec::new());
                }
            }
        }
        Ok((snapshot.name, cache.clone().unwrap_or_default()))
    }

    /// Validate and apply one signed report.
    async fn apply_report(
        &self,
        fp: Fingerprint,
        report: Report,
        encoder: &mut Encoder,
    ) -> Result<()> {
        let status: InfectionStatus = report
            .status
            .parse()
            .map_err(|()| Error::Violation("unparseable status"))?;
        if report.name.is_empty() {
            return Err(Error::Violation("empty reporter name"));
        }
        let identity = PublicIdentity::from_bytes(&report.identity)
            .map_err(|_| Error::InvalidSize { field: "identity" })?;
        let event_identity = self.read_state()?.identity.public();
        let payload = event::report_signing_payload(
            event_identity.as_bytes(),
            &report.name,
            &report.status,
            &report.message,
        );
        identity
            .verify(&payload, &report.signature)
            .map_err(|_| Error::InvalidSignature)?;

        /// What the state mutation decided.
        enum Verdict {
            /// Stored; snapshot to persist and the accepted status.
            Accepted(Box<HostedEvent>, InfectionStatus),
            /// Transition refused; the status that remains on file.
            Rejected(InfectionStatus),
        }

        let verdict = {
            let mut state = self.write_state()?;
            match state.identities.get(&fp) {
                // A pseudonym is bound to the first real identity that
                // reports under it; changing it is hostile.
                Some(known) if *known != identity => {
                    warn!(event = %state.fingerprint(), participant = %fp, "identity swap attempt");
                    return Err(Error::IdentitySwap);
                }
                _ => {}
            }
            state.identities.insert(fp, identity);

            let old = state.statuses.get(&fp).copied().unwrap_or_default();
            if !valid_transition(old, status) {
                Verdict::Rejected(old)
            } else {
                state.statuses.insert(fp, status);
                state.names.entry(fp).or_insert_with(|| report.name.clone());
                state.updated = Timestamp::now();
                Verdict::Accepted(Box::new(state.clone()), status)
            }
        };

        match verdict {
            Verdict::Accepted(snapshot, status) => {
                self.notify_update(&snapshot);
                self.host.on_report(&snapshot.fingerprint(), &fp, status);
                encoder.send(&EventEnvelope::report_ack(status)).await?;
            }
            Verdict::Rejected(current) => {
                debug!(participant = %fp, proposed = %status, current = %current,
                    "report refused; invalid transition");
                encoder.send(&EventEnvelope::report_ack(current)).await?;
            }
        }
        Ok(())
    }

    /// Hand a snapshot to the host; persistence failures are logged, not
    /// propagated into the protocol.
    fn notify_update(&self, snapshot: &HostedEvent) {
        if let Err(e) = self.host.on_update(snapshot) {
            warn!(event = %snapshot.fingerprint(), error = %e, "event persistence failed");
        }
    }

    /// Take the state read lock.
    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, HostedEvent>> {
        self.state.read().map_err(|_| Error::Internal("poisoned lock"))
    }

    /// Take the state write lock.
    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, HostedEvent>> {
        self.state.write().map_err(|_| Error::Internal("poisoned lock"))
    }
}

impl std::fmt::Debug for EventServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventServer").finish_non_exhaustive()
    }
}
