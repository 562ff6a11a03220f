//! The local user's profile.

use mesh_crypto::SecretKeyRing;
use mesh_proto::event::InfectionStatus;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

use crate::{Error, Result, SharedStore};

/// Storage key of the profile record.
const PROFILE_KEY: &[u8] = b"profile";

/// The local user: their key ring and public-facing attributes.
///
/// Persisted as JSON under the `profile` key. The key ring inside is the
/// authoritative copy; the node works on a clone and writes back through
/// the ring callback.
#[serde_as]
#[derive(Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Profile {
    /// The user's key ring.
    pub keyring: SecretKeyRing,
    /// Display name; empty until the user sets one.
    pub name: String,
    /// Content hash of the avatar; all-zero if none.
    #[serde_as(as = "Bytes")]
    pub avatar: [u8; 32],
    /// The user's own current infection status.
    #[serde(default)]
    pub status: InfectionStatus,
}

impl Profile {
    /// Create a fresh profile with a new key ring and no attributes.
    pub fn generate() -> Self {
        Profile {
            keyring: SecretKeyRing::generate(),
            name: String::new(),
            avatar: [0; 32],
            status: InfectionStatus::Unknown,
        }
    }

    /// Whether an avatar is set.
    pub fn has_avatar(&self) -> bool {
        self.avatar != [0; 32]
    }

    /// Load the profile from `store`, if one exists.
    pub(crate) fn load(store: &SharedStore) -> Result<Option<Profile>> {
        match store.get(PROFILE_KEY)? {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(|e| Error::corrupt(e, "profile"))?,
            )),
            None => Ok(None),
        }
    }

    /// Persist the profile to `store`.
    pub(crate) fn save(&self, store: &SharedStore) -> Result<()> {
        let raw = serde_json::to_vec(self).map_err(|e| Error::corrupt(e, "profile"))?;
        Ok(store.put(PROFILE_KEY, &raw)?)
    }

    /// Remove the profile from `store`.
    pub(crate) fn erase(store: &SharedStore) -> Result<()> {
        Ok(store.del(PROFILE_KEY)?)
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("identity", &self.keyring.identity().fingerprint())
            .field("name", &self.name)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
