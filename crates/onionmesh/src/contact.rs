//! Contacts and the contact sub-protocol.
//!
//! A contact is a peer we exchanged key rings with during pairing. The
//! contact protocol keeps their display name and content-addressed
//! avatar fresh: on every link we immediately ask for the peer's
//! profile, fetch their avatar when its hash changes, and serve the same
//! questions about ourselves.
//!
//! While a link is up, its encoder sits in a process-wide registry so
//! that broadcasts can fan out to every live contact at once; everyone
//! else is handed to the dial scheduler as a priority request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_crypto::Fingerprint;
use mesh_proto::contact::{self, ContactEnvelope};
use mesh_proto::{Decoder, Encoder, Muxer};
use mesh_sched::Scheduler;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use sha3::{Digest as _, Sha3_256};
use tracing::{debug, info, trace, warn};

use crate::{ContentStore, Error, Profile, Result, SharedStore};

/// A peer we trust, as shown to the user.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Contact {
    /// The peer's display name; empty until their profile arrives.
    pub name: String,
    /// Content hash of the peer's avatar; all-zero if none.
    #[serde_as(as = "Bytes")]
    pub avatar: [u8; 32],
}

impl Contact {
    /// A freshly added contact with nothing known about it yet.
    pub(crate) fn empty() -> Self {
        Contact {
            name: String::new(),
            avatar: [0; 32],
        }
    }

    /// Whether an avatar hash is set.
    pub fn has_avatar(&self) -> bool {
        self.avatar != [0; 32]
    }

    /// The storage key of the contact record for `fp`.
    fn key(fp: &Fingerprint) -> Vec<u8> {
        format!("contact-{}", fp).into_bytes()
    }

    /// Load the contact record for `fp`, if any.
    pub(crate) fn load(store: &SharedStore, fp: &Fingerprint) -> Result<Option<Contact>> {
        match store.get(&Self::key(fp))? {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(|e| Error::corrupt(e, "contact"))?,
            )),
            None => Ok(None),
        }
    }

    /// Persist the contact record for `fp`.
    pub(crate) fn save(&self, store: &SharedStore, fp: &Fingerprint) -> Result<()> {
        let raw = serde_json::to_vec(self).map_err(|e| Error::corrupt(e, "contact"))?;
        Ok(store.put(&Self::key(fp), &raw)?)
    }

    /// Remove the contact record for `fp`.
    pub(crate) fn erase(store: &SharedStore, fp: &Fingerprint) -> Result<()> {
        Ok(store.del(&Self::key(fp))?)
    }

    /// Every fingerprint with a stored contact record.
    pub(crate) fn list(store: &SharedStore) -> Result<Vec<Fingerprint>> {
        let mut out = Vec::new();
        for key in store.keys_with_prefix(b"contact-")? {
            let Ok(text) = std::str::from_utf8(&key) else {
                continue;
            };
            let Some(fp) = text.strip_prefix("contact-") else {
                continue;
            };
            if let Ok(fp) = fp.parse() {
                out.push(fp);
            }
        }
        Ok(out)
    }
}

/// A live link's encoder, shareable across tasks.
pub(crate) type SharedEncoder = Arc<tokio::sync::Mutex<Encoder>>;

/// The process-wide map from connected contact to its encoder.
pub(crate) type EncoderRegistry = Arc<Mutex<HashMap<Fingerprint, SharedEncoder>>>;

/// Everything the contact-protocol handler needs.
#[derive(Clone)]
pub(crate) struct ContactShared {
    /// Durable storage.
    pub(crate) store: SharedStore,
    /// Image storage.
    pub(crate) cdn: ContentStore,
    /// Live encoders for broadcast.
    pub(crate) encoders: EncoderRegistry,
}

/// Build the contact-protocol muxer around `shared`.
pub(crate) fn contact_muxer(shared: ContactShared) -> Arc<Muxer> {
    let mut muxer = Muxer::new(contact::PROTOCOL);
    muxer.register(
        contact::VERSION,
        Arc::new(move |fp, decoder, encoder| {
            let shared = shared.clone();
            Box::pin(async move {
                serve(shared, fp, decoder, encoder)
                    .await
                    .map_err(mesh_proto::Error::handler)
            })
        }),
    );
    Arc::new(muxer)
}

/// Removes an encoder registration when the link ends.
struct RegistrationGuard {
    /// The registry we are in.
    encoders: EncoderRegistry,
    /// Our key.
    fp: Fingerprint,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if let Ok(mut encoders) = self.encoders.lock() {
            encoders.remove(&self.fp);
        }
    }
}

/// Drive one contact link.
async fn serve(
    shared: ContactShared,
    fp: Fingerprint,
    mut decoder: Decoder,
    encoder: Encoder,
) -> Result<()> {
    let encoder: SharedEncoder = Arc::new(tokio::sync::Mutex::new(encoder));
    {
        let mut encoders = shared
            .encoders
            .lock()
            .map_err(|_| Error::Internal("poisoned lock"))?;
        encoders.insert(fp, Arc::clone(&encoder));
    }
    let _guard = RegistrationGuard {
        encoders: Arc::clone(&shared.encoders),
        fp,
    };

    // Opening move: ask who the peer is today.
    encoder
        .lock()
        .await
        .send(&ContactEnvelope::get_profile())
        .await
        .map_err(Error::from)?;

    loop {
        let envelope = match decoder.recv::<ContactEnvelope>().await {
            Ok(envelope) => envelope,
            // EOF and idle-breaker both end the link quietly.
            Err(_) => return Ok(()),
        };
        if let Some(disconnect) = envelope.disconnect {
            if !disconnect.reason.is_empty() {
                info!(peer = %fp, reason = %disconnect.reason, "peer disconnected");
            }
            return Ok(());
        } else if envelope.get_profile.is_some() {
            let reply = match Profile::load(&shared.store)? {
                Some(profile) => ContactEnvelope::profile(profile.name, profile.avatar),
                None => ContactEnvelope::profile("", [0; 32]),
            };
            encoder.lock().await.send(&reply).await.map_err(Error::from)?;
        } else if let Some(profile) = envelope.profile {
            apply_profile(&shared, &fp, &encoder, profile).await?;
        } else if envelope.get_avatar.is_some() {
            let image = match Profile::load(&shared.store)? {
                Some(profile) if profile.has_avatar() => shared
                    .cdn
                    .fetch(&profile.avatar)
                    .unwrap_or_default()
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            encoder
                .lock()
                .await
                .send(&ContactEnvelope::avatar(image))
                .await
                .map_err(Error::from)?;
        } else if let Some(avatar) = envelope.avatar {
            apply_avatar(&shared, &fp, avatar.image)?;
        } else {
            trace!(peer = %fp, "ignoring unknown contact record");
        }
    }
}

/// Absorb a peer's profile record.
async fn apply_profile(
    shared: &ContactShared,
    fp: &Fingerprint,
    encoder: &SharedEncoder,
    profile: contact::Profile,
) -> Result<()> {
    let mut contact = Contact::load(&shared.store, fp)?.unwrap_or_else(Contact::empty);

    if contact.name.is_empty() {
        contact.name = profile.name.clone();
    } else if contact.name != profile.name && !profile.name.is_empty() {
        // No silent overwrites; reconciliation is a human problem.
        warn!(peer = %fp, stored = %contact.name, received = %profile.name,
            "contact name conflict; keeping stored name");
    }

    // A zero hash means the peer dropped their avatar; anything else
    // that differs from ours is worth fetching.
    if profile.avatar == [0; 32] && contact.has_avatar() {
        shared.cdn.release(&contact.avatar)?;
        contact.avatar = [0; 32];
    }
    let wants_avatar = profile.avatar != [0; 32] && profile.avatar != contact.avatar;
    contact.save(&shared.store, fp)?;
    if wants_avatar {
        encoder
            .lock()
            .await
            .send(&ContactEnvelope::get_avatar())
            .await
            .map_err(Error::from)?;
    }
    Ok(())
}

/// Absorb a peer's avatar record.
fn apply_avatar(shared: &ContactShared, fp: &Fingerprint, image: Vec<u8>) -> Result<()> {
    let mut contact = Contact::load(&shared.store, fp)?.unwrap_or_else(Contact::empty);
    if image.is_empty() {
        if contact.has_avatar() {
            shared.cdn.release(&contact.avatar)?;
            contact.avatar = [0; 32];
            contact.save(&shared.store, fp)?;
        }
        return Ok(());
    }
    let hash: [u8; 32] = Sha3_256::digest(&image).into();
    if hash == contact.avatar {
        return Ok(());
    }
    let stored = shared.cdn.upload(&image)?;
    if contact.has_avatar() {
        shared.cdn.release(&contact.avatar)?;
    }
    contact.avatar = stored;
    contact.save(&shared.store, fp)?;
    debug!(peer = %fp, "avatar updated");
    Ok(())
}

/// Fan an envelope out to every live contact and hand everyone else to
/// the scheduler as a priority request.
pub(crate) fn broadcast(
    encoders: &EncoderRegistry,
    scheduler: &Scheduler,
    trusted: Vec<Fingerprint>,
    envelope: &ContactEnvelope,
    priority: Duration,
) {
    let mut offline = Vec::new();
    for fp in trusted {
        let live = encoders
            .lock()
            .ok()
            .and_then(|encoders| encoders.get(&fp).cloned());
        match live {
            Some(encoder) => {
                let envelope = envelope.clone();
                tokio::spawn(async move {
                    if let Err(e) = encoder.lock().await.send(&envelope).await {
                        debug!(peer = %fp, error = %e, "broadcast send failed");
                    }
                });
            }
            None => offline.push(fp),
        }
    }
    if !offline.is_empty() {
        scheduler.prioritize(priority, offline);
    }
}
