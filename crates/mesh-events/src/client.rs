//! The guest side of the event protocol.
//!
//! An [`EventClient`] drives one joined event: the initial checkin (while
//! the one-shot credential is still held) and afterwards the periodic
//! data exchange that keeps metadata, statistics, and our own infection
//! report in sync with the organizer.

use std::sync::{Arc, RwLock};

use mesh_crypto::{Fingerprint, SecretIdentity};
use mesh_gateway::Gateway;
use mesh_net::{exchange_magic, Dialer};
use mesh_proto::event::{self, EventEnvelope, InfectionStatus, Metadata, Report, Status};
use mesh_proto::{negotiate, split, Decoder, Encoder, Timestamp};
use sha3::{Digest as _, Sha3_256};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    valid_transition, CallbackError, Error, JoinedEvent, Result, CHECKIN_TIMEOUT, IDLE_TIMEOUT,
    MAINTENANCE_PERIOD, REPORT_RETRY, STATS_RECHECK,
};

/// What a guest currently wants the organizer to know about them.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct GuestProfile {
    /// The guest's real display name.
    pub name: String,
    /// The guest's current infection status.
    pub status: InfectionStatus,
    /// Free-form message attached to the next report.
    pub message: String,
}

impl GuestProfile {
    /// Build a [`GuestProfile`] from its fields.
    pub fn new(name: String, status: InfectionStatus, message: String) -> Self {
        Self {
            name,
            status,
            message,
        }
    }
}

/// What the event client needs from the application.
pub trait EventGuest: Send + Sync + 'static {
    /// The current profile to report from.
    fn profile(&self) -> GuestProfile;

    /// The event state changed; persist `event`. Failures are logged and
    /// do not abort the exchange.
    fn on_update(&self, event: &JoinedEvent) -> std::result::Result<(), CallbackError>;

    /// Store the banner image bytes for `event`.
    fn on_banner(&self, event: &Fingerprint, bytes: &[u8])
        -> std::result::Result<(), CallbackError>;
}

/// The running client for one joined event.
pub struct EventClient {
    /// The joined-event state, behind a lock.
    state: RwLock<JoinedEvent>,
    /// The user's real identity, for signing reports.
    user: SecretIdentity,
    /// Application callbacks.
    guest: Arc<dyn EventGuest>,
    /// The gateway carrying our dials.
    gateway: Arc<dyn Gateway>,
    /// Cancels the periodic loop.
    stopped: CancellationToken,
}

impl EventClient {
    /// Build a client around `event`.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        event: JoinedEvent,
        user: SecretIdentity,
        guest: Arc<dyn EventGuest>,
    ) -> Arc<EventClient> {
        Arc::new(EventClient {
            state: RwLock::new(event),
            user,
            guest,
            gateway,
            stopped: CancellationToken::new(),
        })
    }

    /// A point-in-time copy of the joined-event state.
    pub fn snapshot(&self) -> Result<JoinedEvent> {
        Ok(self.read_state()?.clone())
    }

    /// The fingerprint naming this event.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(self.read_state()?.fingerprint())
    }

    /// Stop the periodic loop.
    pub fn close(&self) {
        self.stopped.cancel();
    }

    /// Run one exchange with the organizer: a checkin while we still
    /// hold the credential, the data exchange afterwards.
    pub async fn sync(&self) -> Result<()> {
        if self.read_state()?.needs_checkin() {
            self.checkin().await
        } else {
            self.exchange().await
        }
    }

    /// Spawn the periodic-dial loop: sync immediately, then every stats
    /// interval, tightening to the report-retry interval while we have a
    /// checkin or report outstanding. The loop ends when the maintenance
    /// window closes or [`close`](EventClient::close) is called.
    pub fn spawn_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if this.stopped.is_cancelled() {
                    break;
                }
                if let Ok(state) = this.snapshot() {
                    if !state.end.is_zero()
                        && Timestamp::now() > state.end + MAINTENANCE_PERIOD
                    {
                        debug!(event = %state.fingerprint(), "maintenance window over");
                        break;
                    }
                }
                if let Err(e) = this.sync().await {
                    trace!(error = %e, "event sync failed");
                }
                let interval = if this.pending_work() {
                    REPORT_RETRY
                } else {
                    STATS_RECHECK
                };
                tokio::select! {
                    () = this.stopped.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    /// Whether we owe the organizer anything (checkin or report).
    fn pending_work(&self) -> bool {
        let Ok(state) = self.read_state() else {
            return false;
        };
        if state.needs_checkin() {
            return true;
        }
        let profile = self.guest.profile();
        profile.status != InfectionStatus::Unknown && profile.status != state.status
    }

    /// Redeem our checkin credential.
    pub async fn checkin(&self) -> Result<()> {
        let (credential, pseudonym, event_identity) = {
            let state = self.read_state()?;
            let credential = state
                .checkin
                .clone()
                .ok_or(Error::CheckinNotInProgress)?;
            (credential, state.pseudonym.clone(), state.identity)
        };

        let (mut decoder, mut encoder) = self.connect(&credential).await?;
        let signature = pseudonym.sign(event_identity.as_bytes());
        let request = EventEnvelope::checkin(*pseudonym.public().as_bytes(), signature);

        // One deadline covers the whole exchange; an organizer that
        // accepts the link but never reads must not hang us.
        let outcome = timeout(CHECKIN_TIMEOUT, async {
            tokio::try_join!(encoder.send(&request), decoder.recv::<EventEnvelope>())
        })
        .await;
        let ((), envelope) = match outcome {
            Ok(inner) => inner?,
            Err(_) => return Err(Error::Timeout("checkin")),
        };
        if envelope.checkin_ack.is_none() {
            return Err(Error::Violation("expected checkin ack"));
        }

        let snapshot = {
            let mut state = self.write_state()?;
            state.checkin = None;
            state.updated = Timestamp::now();
            state.clone()
        };
        self.notify_update(&snapshot);
        debug!(event = %snapshot.fingerprint(), "checked in");
        Ok(())
    }

    /// Run one data exchange: request whatever we are missing, deliver a
    /// report if ours is newer, and absorb the answers.
    async fn exchange(&self) -> Result<()> {
        let (pseudonym, snapshot) = {
            let state = self.read_state()?;
            (state.pseudonym.clone(), state.clone())
        };
        let profile = self.guest.profile();
        let (mut decoder, mut encoder) = self.connect(&pseudonym).await?;

        let mut pending = 0_u32;
        if snapshot.name.is_empty() {
            encoder.send(&EventEnvelope::get_metadata()).await?;
            pending += 1;
        }
        if profile.status != InfectionStatus::Unknown && profile.status != snapshot.status {
            let report = self.build_report(&snapshot, &profile);
            encoder.send(&EventEnvelope::report(report)).await?;
            pending += 1;
        }
        encoder.send(&EventEnvelope::get_status()).await?;
        pending += 1;

        while pending > 0 {
            let envelope = timeout(IDLE_TIMEOUT, decoder.recv::<EventEnvelope>())
                .await
                .map_err(|_| Error::Timeout("data exchange"))??;
            if let Some(metadata) = envelope.metadata {
                self.apply_metadata(metadata)?;
            } else if let Some(status) = envelope.status {
                self.apply_status(status)?;
            } else if let Some(ack) = envelope.report_ack {
                self.apply_report_ack(&ack.status)?;
            } else {
                return Err(Error::Violation("unexpected record"));
            }
            pending -= 1;
        }
        Ok(())
    }

    /// Build the signed report for the organizer.
    fn build_report(&self, snapshot: &JoinedEvent, profile: &GuestProfile) -> Report {
        let status = profile.status.to_string();
        let payload = event::report_signing_payload(
            snapshot.identity.as_bytes(),
            &profile.name,
            &status,
            &profile.message,
        );
        let signature = self.user.sign(&payload);
        Report::new(
            profile.name.clone(),
            status,
            profile.message.clone(),
            *self.user.public().as_bytes(),
            signature,
        )
    }

    /// Absorb a metadata record.
    fn apply_metadata(&self, metadata: Metadata) -> Result<()> {
        if metadata.name.is_empty() || metadata.banner.is_empty() {
            return Err(Error::Violation("empty metadata"));
        }
        let event_fp = self.read_state()?.fingerprint();
        {
            let state = self.read_state()?;
            if !state.name.is_empty() {
                // We never asked; the organizer is trying to rewrite
                // history.
                return Err(Error::Violation("metadata swap"));
            }
        }
        if let Err(e) = self.guest.on_banner(&event_fp, &metadata.banner) {
            warn!(event = %event_fp, error = %e, "banner storage failed");
            return Ok(());
        }
        let banner_hash: [u8; 32] = Sha3_256::digest(&metadata.banner).into();
        let snapshot = {
            let mut state = self.write_state()?;
            state.name = metadata.name;
            state.banner = banner_hash;
            state.updated = Timestamp::now();
            state.clone()
        };
        self.notify_update(&snapshot);
        Ok(())
    }

    /// Absorb a statistics record.
    fn apply_status(&self, status: Status) -> Result<()> {
        let snapshot = {
            let mut state = self.write_state()?;
            let changed = state.start != status.start
                || state.end != status.end
                || state.attendees != status.attendees
                || state.negatives != status.negatives
                || state.suspected != status.suspected
                || state.positives != status.positives;
            if changed {
                state.start = status.start;
                state.end = status.end;
                state.attendees = status.attendees;
                state.negatives = status.negatives;
                state.suspected = status.suspected;
                state.positives = status.positives;
                state.updated = Timestamp::now();
            }
            state.synced = Timestamp::now();
            state.clone()
        };
        self.notify_update(&snapshot);
        Ok(())
    }

    /// Absorb a report acknowledgement.
    ///
    /// The organizer answers with whatever status is now on file for us:
    /// our proposed one if it was accepted, the unchanged current one if
    /// it was refused. Anything else is a protocol violation and drops
    /// the link.
    fn apply_report_ack(&self, ack: &str) -> Result<()> {
        let status: InfectionStatus = ack
            .parse()
            .map_err(|()| Error::Violation("unparseable ack status"))?;
        if status == InfectionStatus::Unknown {
            return Err(Error::Violation("unknown status in ack"));
        }
        let current = self.read_state()?.status;
        if status == current {
            // Refused; our local status already matches the books.
            return Ok(());
        }
        if !valid_transition(current, status) {
            return Err(Error::InvalidTransition);
        }
        let snapshot = {
            let mut state = self.write_state()?;
            state.status = status;
            state.updated = Timestamp::now();
            state.clone()
        };
        self.notify_update(&snapshot);
        Ok(())
    }

    /// Dial the event and complete TLS, magic, and version negotiation,
    /// authenticating as `credential`.
    async fn connect(&self, credential: &SecretIdentity) -> Result<(Decoder, Encoder)> {
        let (address, event_identity) = {
            let state = self.read_state()?;
            (state.address, state.identity)
        };
        let stream = self.gateway.dial(&address.onion()).await?;
        let dialer = Dialer::new(credential)?;
        let (server_identity, stream) = dialer.connect(stream).await?;
        if server_identity != event_identity {
            return Err(Error::Violation("wrong event identity"));
        }
        let stream = exchange_magic(stream).await?;
        let (mut decoder, mut encoder) = split(stream);
        let version = negotiate(
            &mut decoder,
            &mut encoder,
            event::PROTOCOL,
            &[event::VERSION],
        )
        .await?;
        trace!(event = %event_identity.fingerprint(), version, "event link ready");
        Ok((decoder, encoder))
    }

    /// Hand a snapshot to the guest; persistence failures are logged.
    fn notify_update(&self, snapshot: &JoinedEvent) {
        if let Err(e) = self.guest.on_update(snapshot) {
            warn!(event = %snapshot.fingerprint(), error = %e, "event persistence failed");
        }
    }

    /// Take the state read lock.
    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, JoinedEvent>> {
        self.state.read().map_err(|_| Error::Internal("poisoned lock"))
    }

    /// Take the state write lock.
    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, JoinedEvent>> {
        self.state.write().map_err(|_| Error::Internal("poisoned lock"))
    }
}

impl std::fmt::Debug for EventClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventClient").finish_non_exhaustive()
    }
}
