//! Envelope and records of the contact sub-protocol.
//!
//! Contact v1 is the protocol trusted peers speak on the main overlay:
//! profile name exchange and content-addressed avatar transfer. Exactly
//! one field of the envelope is set per record.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

/// Protocol name advertised during version negotiation.
pub const PROTOCOL: &str = "contact";

/// The single version of the contact protocol currently defined.
pub const VERSION: u64 = 1;

/// A record of the contact protocol; exactly one field is set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ContactEnvelope {
    /// Orderly teardown, possibly carrying a reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<Disconnect>,
    /// Request for the peer's profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_profile: Option<GetProfile>,
    /// The sender's profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    /// Request for the peer's avatar image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_avatar: Option<GetAvatar>,
    /// The sender's avatar image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<Avatar>,
}

impl ContactEnvelope {
    /// An envelope carrying a disconnect.
    pub fn disconnect(reason: impl Into<String>) -> Self {
        ContactEnvelope {
            disconnect: Some(Disconnect {
                reason: reason.into(),
            }),
            ..Default::default()
        }
    }

    /// An envelope requesting the peer's profile.
    pub fn get_profile() -> Self {
        ContactEnvelope {
            get_profile: Some(GetProfile {}),
            ..Default::default()
        }
    }

    /// An envelope carrying our profile.
    pub fn profile(name: impl Into<String>, avatar: [u8; 32]) -> Self {
        ContactEnvelope {
            profile: Some(Profile {
                name: name.into(),
                avatar,
            }),
            ..Default::default()
        }
    }

    /// An envelope requesting the peer's avatar image.
    pub fn get_avatar() -> Self {
        ContactEnvelope {
            get_avatar: Some(GetAvatar {}),
            ..Default::default()
        }
    }

    /// An envelope carrying our avatar image; empty bytes mean "none".
    pub fn avatar(image: Vec<u8>) -> Self {
        ContactEnvelope {
            avatar: Some(Avatar { image }),
            ..Default::default()
        }
    }
}

/// Orderly connection teardown.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Disconnect {
    /// Why the sender is leaving; empty means a silent close.
    pub reason: String,
}

/// Request for the peer's profile. Carries nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct GetProfile {}

/// A peer's profile summary.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Profile {
    /// Display name; empty if the peer has not set one.
    pub name: String,
    /// Content hash of the peer's avatar; all-zero if none.
    #[serde_as(as = "Bytes")]
    pub avatar: [u8; 32],
}

/// Request for the peer's avatar image. Carries nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct GetAvatar {}

/// An avatar image in full.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Avatar {
    /// The image bytes; empty means the sender has no avatar.
    #[serde_as(as = "Bytes")]
    pub image: Vec<u8>,
}
