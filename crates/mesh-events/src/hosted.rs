//! The organizer's view of an event.

use std::collections::HashMap;

use mesh_crypto::{Fingerprint, PublicIdentity, SecretAddress, SecretIdentity};
use mesh_proto::event::{InfectionStatus, Status};
use mesh_proto::Timestamp;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

/// Everything the organizer knows about one hosted event.
///
/// This is the record persisted under `hosted-<fingerprint>`; the
/// [`EventServer`](crate::EventServer) holds the live copy and hands
/// snapshots to the host callback whenever it changes.
///
/// All participant-keyed maps are keyed by *pseudonym* fingerprint; real
/// identities only enter the picture once a participant files a signed
/// report.
#[serde_as]
#[derive(Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HostedEvent {
    /// The event's own identity key; its fingerprint names the event.
    pub identity: SecretIdentity,
    /// The event's own listening address key.
    pub address: SecretAddress,
    /// Checked-in participants: pseudonym fingerprint → pseudonym key.
    pub participants: HashMap<Fingerprint, PublicIdentity>,
    /// Real identities, granted at first signed report.
    pub identities: HashMap<Fingerprint, PublicIdentity>,
    /// Infection status per participant.
    pub statuses: HashMap<Fingerprint, InfectionStatus>,
    /// First-seen real display name per participant.
    pub names: HashMap<Fingerprint, String>,
    /// Display name of the event.
    pub name: String,
    /// Content hash of the banner image; all-zero if none.
    #[serde_as(as = "Bytes")]
    pub banner: [u8; 32],
    /// When the event was created.
    pub start: Timestamp,
    /// When the event concluded; zero while it is open.
    pub end: Timestamp,
    /// Last mutation of any of the above.
    pub updated: Timestamp,
}

impl HostedEvent {
    /// Create a fresh event named `name` with the given banner hash.
    pub fn create(name: impl Into<String>, banner: [u8; 32]) -> Self {
        let now = Timestamp::now();
        HostedEvent {
            identity: SecretIdentity::generate(),
            address: SecretAddress::generate(),
            participants: HashMap::new(),
            identities: HashMap::new(),
            statuses: HashMap::new(),
            names: HashMap::new(),
            name: name.into(),
            banner,
            start: now,
            end: Timestamp::ZERO,
            updated: now,
        }
    }

    /// The fingerprint naming this event.
    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    /// Whether the event has concluded.
    pub fn concluded(&self) -> bool {
        !self.end.is_zero()
    }

    /// The aggregate statistics published to guests.
    ///
    /// The organizer counts as an attendee, which is why the total is one
    /// more than the participant map.
    pub fn stats(&self) -> Status {
        let count = |status: InfectionStatus| {
            u64::try_from(
                self.statuses
                    .values()
                    .filter(|s| **s == status)
                    .count(),
            )
            .unwrap_or(u64::MAX)
        };
        Status::new(
            self.start,
            self.end,
            u64::try_from(self.participants.len())
                .unwrap_or(u64::MAX)
                .saturating_add(1),
            count(InfectionStatus::Negative),
            count(InfectionStatus::Suspected),
            count(InfectionStatus::Positive),
        )
    }
}

impl std::fmt::Debug for HostedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedEvent")
            .field("event", &self.fingerprint())
            .field("name", &self.name)
            .field("participants", &self.participants.len())
            .field("concluded", &self.concluded())
            .finish_non_exhaustive()
    }
}
