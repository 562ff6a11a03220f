//! The guest's view of an event.

use mesh_crypto::{Fingerprint, PublicAddress, PublicIdentity, SecretIdentity};
use mesh_proto::event::InfectionStatus;
use mesh_proto::Timestamp;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

/// Everything a guest knows about one joined event.
///
/// Persisted under `joined-<fingerprint>`. The `checkin` credential is
/// present only between scanning the organizer's credential and the
/// first successful checkin; the pseudonym is permanent.
#[serde_as]
#[derive(Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct JoinedEvent {
    /// The event's identity key; its fingerprint names the event.
    pub identity: PublicIdentity,
    /// The event's listening address.
    pub address: PublicAddress,
    /// The unconsumed checkin credential, if we have not checked in yet.
    pub checkin: Option<SecretIdentity>,
    /// Our pseudonym for this event.
    pub pseudonym: SecretIdentity,
    /// Display name of the event; empty until metadata arrives.
    pub name: String,
    /// Content hash of the banner image; all-zero until it arrives.
    #[serde_as(as = "Bytes")]
    pub banner: [u8; 32],
    /// When the event started.
    pub start: Timestamp,
    /// When the event concluded; zero while it is open.
    pub end: Timestamp,
    /// Our own last acknowledged status.
    pub status: InfectionStatus,
    /// Published attendee count, the organizer included.
    pub attendees: u64,
    /// Published negative count.
    pub negatives: u64,
    /// Published suspected count.
    pub suspected: u64,
    /// Published positive count.
    pub positives: u64,
    /// Last local mutation.
    pub updated: Timestamp,
    /// Last successful exchange with the organizer.
    pub synced: Timestamp,
}

impl JoinedEvent {
    /// Create the local record for an event we were just invited to.
    pub fn from_invitation(
        identity: PublicIdentity,
        address: PublicAddress,
        checkin: SecretIdentity,
    ) -> Self {
        JoinedEvent {
            identity,
            address,
            checkin: Some(checkin),
            pseudonym: SecretIdentity::generate(),
            name: String::new(),
            banner: [0; 32],
            start: Timestamp::ZERO,
            end: Timestamp::ZERO,
            status: InfectionStatus::Unknown,
            attendees: 0,
            negatives: 0,
            suspected: 0,
            positives: 0,
            updated: Timestamp::now(),
            synced: Timestamp::ZERO,
        }
    }

    /// The fingerprint naming this event.
    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    /// Whether we still hold an unconsumed checkin credential.
    pub fn needs_checkin(&self) -> bool {
        self.checkin.is_some()
    }
}

impl std::fmt::Debug for JoinedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinedEvent")
            .field("event", &self.fingerprint())
            .field("name", &self.name)
            .field("status", &self.status)
            .field("needs_checkin", &self.needs_checkin())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use mesh_crypto::SecretAddress;

    #[test]
    fn serde_keeps_credential_until_consumed() {
        let event = JoinedEvent::from_invitation(
            SecretIdentity::from_seed([1; 32]).public(),
            SecretAddress::from_seed([2; 32]).public(),
            SecretIdentity::from_seed([3; 32]),
        );
        assert!(event.needs_checkin());
        let json = serde_json::to_string(&event).unwrap();
        let mut back: JoinedEvent = serde_json::from_str(&json).unwrap();
        assert!(back.needs_checkin());

        back.checkin = None;
        let json = serde_json::to_string(&back).unwrap();
        let done: JoinedEvent = serde_json::from_str(&json).unwrap();
        assert!(!done.needs_checkin());
    }
}
