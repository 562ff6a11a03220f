//! Envelope and records of the event protocol.
//!
//! The event protocol runs between an event's organizer and its guests,
//! in two phases: a one-shot checkin that turns an ephemeral credential
//! into a permanent pseudonymous membership, and a periodic data exchange
//! that moves metadata, aggregate statistics, and signed infection
//! reports.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use crate::Timestamp;

/// Protocol name advertised during version negotiation.
pub const PROTOCOL: &str = "event";

/// The single version of the event protocol currently defined.
pub const VERSION: u64 = 1;

/// A participant's infection status, as carried in reports and acks.
///
/// Statuses only ever move forward: `Unknown → Suspected` and from either
/// of those to the terminal `Negative` or `Positive`. The transition rule
/// itself lives with the event state machines; this type is just the wire
/// vocabulary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum InfectionStatus {
    /// Nothing reported yet.
    #[default]
    Unknown,
    /// Tested negative.
    Negative,
    /// Suspects an infection, no test result yet.
    Suspected,
    /// Tested positive.
    Positive,
}

impl Display for InfectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            InfectionStatus::Unknown => "unknown",
            InfectionStatus::Negative => "negative",
            InfectionStatus::Suspected => "suspected",
            InfectionStatus::Positive => "positive",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for InfectionStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "unknown" => Ok(InfectionStatus::Unknown),
            "negative" => Ok(InfectionStatus::Negative),
            "suspected" => Ok(InfectionStatus::Suspected),
            "positive" => Ok(InfectionStatus::Positive),
            _ => Err(()),
        }
    }
}

/// A record of the event protocol; exactly one field is set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct EventEnvelope {
    /// Guest → organizer: redeem a checkin credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin: Option<Checkin>,
    /// Organizer → guest: the checkin was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_ack: Option<CheckinAck>,
    /// Guest → organizer: request event metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_metadata: Option<GetMetadata>,
    /// Organizer → guest: event metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Guest → organizer: request current statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_status: Option<GetStatus>,
    /// Organizer → guest: current statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Guest → organizer: a signed infection report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    /// Organizer → guest: the status now on file for the reporter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_ack: Option<ReportAck>,
}

impl EventEnvelope {
    /// An envelope redeeming a checkin credential.
    pub fn checkin(pseudonym: [u8; 32], signature: [u8; 64]) -> Self {
        EventEnvelope {
            checkin: Some(Checkin {
                pseudonym,
                signature,
            }),
            ..Default::default()
        }
    }

    /// An envelope acknowledging a checkin.
    pub fn checkin_ack() -> Self {
        EventEnvelope {
            checkin_ack: Some(CheckinAck {}),
            ..Default::default()
        }
    }

    /// An envelope requesting metadata.
    pub fn get_metadata() -> Self {
        EventEnvelope {
            get_metadata: Some(GetMetadata {}),
            ..Default::default()
        }
    }

    /// An envelope carrying metadata.
    pub fn metadata(name: impl Into<String>, banner: Vec<u8>) -> Self {
        EventEnvelope {
            metadata: Some(Metadata {
                name: name.into(),
                banner,
            }),
            ..Default::default()
        }
    }

    /// An envelope requesting statistics.
    pub fn get_status() -> Self {
        EventEnvelope {
            get_status: Some(GetStatus {}),
            ..Default::default()
        }
    }

    /// An envelope carrying statistics.
    pub fn status(status: Status) -> Self {
        EventEnvelope {
            status: Some(status),
            ..Default::default()
        }
    }

    /// An envelope carrying a signed report.
    pub fn report(report: Report) -> Self {
        EventEnvelope {
            report: Some(report),
            ..Default::default()
        }
    }

    /// An envelope acknowledging a report with the status now on file.
    pub fn report_ack(status: InfectionStatus) -> Self {
        EventEnvelope {
            report_ack: Some(ReportAck {
                status: status.to_string(),
            }),
            ..Default::default()
        }
    }
}

/// Redemption of a one-shot checkin credential.
///
/// The signature is made by the guest's *pseudonym* key over the event's
/// identity public key, proving the pseudonym holder was handed the
/// credential out-of-band.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Checkin {
    /// The guest's pseudonym public key for this event.
    #[serde_as(as = "Bytes")]
    pub pseudonym: [u8; 32],
    /// Signature by the pseudonym key over the event identity public key.
    #[serde_as(as = "Bytes")]
    pub signature: [u8; 64],
}

/// Positive answer to a [`Checkin`]. Carries nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CheckinAck {}

/// Request for event metadata. Carries nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct GetMetadata {}

/// Event metadata: display name and banner image.
///
/// The banner travels as bytes on the wire but is stored by content hash.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Metadata {
    /// Display name of the event.
    pub name: String,
    /// The banner image bytes.
    #[serde_as(as = "Bytes")]
    pub banner: Vec<u8>,
}

/// Request for current statistics. Carries nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct GetStatus {}

/// Aggregate event statistics as published to guests.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Status {
    /// When the event started.
    pub start: Timestamp,
    /// When the event concluded; zero while it is still open.
    pub end: Timestamp,
    /// Number of attendees, the organizer included.
    pub attendees: u64,
    /// Attendees who reported negative.
    pub negatives: u64,
    /// Attendees who reported suspected.
    pub suspected: u64,
    /// Attendees who reported positive.
    pub positives: u64,
}

impl Status {
    /// Build a [`Status`] from its fields.
    pub fn new(
        start: Timestamp,
        end: Timestamp,
        attendees: u64,
        negatives: u64,
        suspected: u64,
        positives: u64,
    ) -> Self {
        Self {
            start,
            end,
            attendees,
            negatives,
            suspected,
            positives,
        }
    }
}

/// A signed infection report.
///
/// `signature` is made by `identity` over
/// [`report_signing_payload`]`(event_identity, name, status, message)`, so
/// a report can neither be replayed against another event nor altered.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Report {
    /// The reporter's real display name.
    pub name: String,
    /// The reported status, one of the [`InfectionStatus`] words.
    pub status: String,
    /// Free-form message accompanying the report.
    pub message: String,
    /// The reporter's real identity public key.
    #[serde_as(as = "Bytes")]
    pub identity: [u8; 32],
    /// Signature over the report payload.
    #[serde_as(as = "Bytes")]
    pub signature: [u8; 64],
}

impl Report {
    /// Build a [`Report`] from its fields.
    pub fn new(
        name: String,
        status: String,
        message: String,
        identity: [u8; 32],
        signature: [u8; 64],
    ) -> Self {
        Self {
            name,
            status,
            message,
            identity,
            signature,
        }
    }
}

/// Answer to a [`Report`]: the status the organizer now has on file,
/// which differs from the reported one when the transition was refused.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ReportAck {
    /// The status on file, one of the [`InfectionStatus`] words.
    pub status: String,
}

/// The byte string an infection report signs: the event identity public
/// key followed by the name, status, and message, in order.
pub fn report_signing_payload(
    event_identity: &[u8; 32],
    name: &str,
    status: &str,
    message: &str,
) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(32 + name.len() + status.len() + message.len());
    payload.extend_from_slice(event_identity);
    payload.extend_from_slice(name.as_bytes());
    payload.extend_from_slice(status.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    payload
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;

    #[test]
    fn status_words_roundtrip() {
        for s in [
            InfectionStatus::Unknown,
            InfectionStatus::Negative,
            InfectionStatus::Suspected,
            InfectionStatus::Positive,
        ] {
            assert_eq!(s.to_string().parse::<InfectionStatus>().unwrap(), s);
        }
        assert!("covfefe".parse::<InfectionStatus>().is_err());
        assert!("".parse::<InfectionStatus>().is_err());
    }

    #[test]
    fn signing_payload_binds_every_field() {
        let event = [1_u8; 32];
        let base = report_signing_payload(&event, "Bob", "suspected", "hi");
        assert_ne!(base, report_signing_payload(&[2; 32], "Bob", "suspected", "hi"));
        assert_ne!(base, report_signing_payload(&event, "Rob", "suspected", "hi"));
        assert_ne!(base, report_signing_payload(&event, "Bob", "negative", "hi"));
        assert_ne!(base, report_signing_payload(&event, "Bob", "suspected", "yo"));
    }

    #[test]
    fn envelope_serializes_single_field() {
        let mut buf = Vec::new();
        ciborium::into_writer(&EventEnvelope::get_status(), &mut buf).unwrap();
        let value: ciborium::Value = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(value.into_map().unwrap().len(), 1);
    }
}
