//! The backend facade: every operation the user-facing surface calls.
//!
//! The backend owns durable storage and, while the gateway is enabled,
//! the whole overlay: the node, the dial scheduler, one event server per
//! hosted event, and one event client per joined event. A single
//! application lock serializes the facade operations; the network tasks
//! never take it, they work through the store, the content store, and
//! the encoder registry instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mesh_crypto::{Fingerprint, PublicAddress, PublicKeyRing, SecretIdentity};
use mesh_events::{
    CheckinCredential, CheckinSession, EventClient, EventGuest, EventHost, EventServer,
    GuestProfile, HostedEvent, JoinedEvent, ARCHIVE_PERIOD, MAINTENANCE_PERIOD,
};
use mesh_gateway::Gateway;
use mesh_net::{Node, NodeConfig, RingCallback};
use mesh_proto::contact::ContactEnvelope;
use mesh_proto::event::InfectionStatus;
use mesh_proto::Timestamp;
use mesh_sched::{Scheduler, SchedulerConfig, PROFILE_BROADCAST_PRIORITY};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contact::{broadcast, contact_muxer, Contact, ContactShared, EncoderRegistry};
use crate::{BoxError, ContentStore, Error, Profile, Result, SharedStore};

/// The running overlay, present while the gateway is enabled.
struct Overlay {
    /// Our presence on the network.
    node: Arc<Node>,
    /// The dial scheduler driving contact freshness.
    scheduler: Scheduler,
    /// One server per hosted event still in its maintenance window.
    hosted: HashMap<Fingerprint, Arc<EventServer>>,
    /// One client per joined event still in its maintenance window.
    joined: HashMap<Fingerprint, Arc<EventClient>>,
}

/// Mutable state behind the application lock.
struct Inner {
    /// The overlay, while the gateway is enabled.
    overlay: Option<Overlay>,
    /// The single pairing session, if one is running.
    pairing: Option<Arc<mesh_pairing::PairingServer>>,
    /// Pending checkin sessions by hosted-event fingerprint.
    checkins: HashMap<Fingerprint, CheckinSession>,
}

/// The application core's facade.
pub struct Backend {
    /// The gateway carrying all network traffic.
    gateway: Arc<dyn Gateway>,
    /// Durable storage.
    store: SharedStore,
    /// Content-addressed image storage.
    cdn: ContentStore,
    /// Live encoders of connected contacts, for broadcast.
    encoders: EncoderRegistry,
    /// Whether the overlay is up, as the scheduler sees it.
    online: Arc<AtomicBool>,
    /// Everything else, behind the application lock.
    inner: tokio::sync::Mutex<Inner>,
}

impl Backend {
    /// Build a backend over `gateway` and `store`. The gateway starts
    /// out disabled; call [`enable_gateway`](Backend::enable_gateway)
    /// once a profile exists.
    pub fn new(gateway: Arc<dyn Gateway>, store: SharedStore) -> Backend {
        let cdn = ContentStore::new(Arc::clone(&store));
        Backend {
            gateway,
            store,
            cdn,
            encoders: Arc::new(Mutex::new(HashMap::new())),
            online: Arc::new(AtomicBool::new(false)),
            inner: tokio::sync::Mutex::new(Inner {
                overlay: None,
                pairing: None,
                checkins: HashMap::new(),
            }),
        }
    }

    //
    // Profile lifecycle
    //

    /// The current profile.
    pub async fn profile(&self) -> Result<Profile> {
        Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)
    }

    /// Create a fresh profile with a new key ring.
    pub async fn create_profile(&self) -> Result<()> {
        let _inner = self.inner.lock().await;
        if Profile::load(&self.store)?.is_some() {
            return Err(Error::ProfileExists);
        }
        Profile::generate().save(&self.store)?;
        info!("profile created");
        Ok(())
    }

    /// Set the display name; setting the current name is a no-op.
    pub async fn update_profile(&self, name: &str) -> Result<()> {
        let inner = self.inner.lock().await;
        let mut profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
        if profile.name == name {
            return Ok(());
        }
        profile.name = name.to_owned();
        profile.save(&self.store)?;
        self.broadcast_profile(&inner, &profile);
        Ok(())
    }

    /// Set the avatar image.
    pub async fn update_avatar(&self, image: &[u8]) -> Result<()> {
        let inner = self.inner.lock().await;
        let mut profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
        let hash = self.cdn.upload(image)?;
        let old = profile.avatar;
        if profile.has_avatar() && old != hash {
            self.cdn.release(&old)?;
        }
        profile.avatar = hash;
        profile.save(&self.store)?;
        self.broadcast_profile(&inner, &profile);
        Ok(())
    }

    /// Remove the avatar image.
    pub async fn delete_avatar(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        let mut profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
        if !profile.has_avatar() {
            return Ok(());
        }
        let old = profile.avatar;
        self.cdn.release(&old)?;
        profile.avatar = [0; 32];
        profile.save(&self.store)?;
        self.broadcast_profile(&inner, &profile);
        Ok(())
    }

    /// Delete the profile and everything hanging off it. Idempotent.
    pub async fn delete_profile(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(profile) = Profile::load(&self.store)? else {
            return Ok(());
        };
        self.teardown_overlay(&mut inner);

        for fp in Contact::list(&self.store)? {
            if let Some(contact) = Contact::load(&self.store, &fp)? {
                if contact.has_avatar() {
                    self.cdn.release(&contact.avatar)?;
                }
            }
            Contact::erase(&self.store, &fp)?;
        }
        for fp in list_events(&self.store, HOSTED_PREFIX)? {
            if let Some(event) = load_hosted(&self.store, &fp)? {
                if event.banner != [0; 32] {
                    self.cdn.release(&event.banner)?;
                }
            }
            self.store.del(&hosted_key(&fp))?;
        }
        for fp in list_events(&self.store, JOINED_PREFIX)? {
            if let Some(event) = load_joined(&self.store, &fp)? {
                if event.banner != [0; 32] {
                    self.cdn.release(&event.banner)?;
                }
            }
            self.store.del(&joined_key(&fp))?;
        }
        if profile.has_avatar() {
            self.cdn.release(&profile.avatar)?;
        }
        Profile::erase(&self.store)?;
        info!("profile deleted");
        Ok(())
    }

    //
    // Gateway lifecycle
    //

    /// Bring the overlay up: node, scheduler, and event loops.
    /// Idempotent while already enabled.
    pub async fn enable_gateway(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.overlay.is_some() {
            return Ok(());
        }
        let profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;

        let muxer = contact_muxer(ContactShared {
            store: Arc::clone(&self.store),
            cdn: self.cdn.clone(),
            encoders: Arc::clone(&self.encoders),
        });
        let app: mesh_net::ConnHandler = Arc::new(move |fp, stream| {
            let muxer = Arc::clone(&muxer);
            Box::pin(async move { Ok(muxer.serve(fp, stream).await?) })
        });
        let callback = self.ring_callback();
        let node = Node::start(
            Arc::clone(&self.gateway),
            profile.keyring.clone(),
            NodeConfig::default(),
            app,
            callback,
        )
        .await?;

        let scheduler = Scheduler::spawn(
            Arc::new(SchedulerDial {
                node: Arc::clone(&node),
                online: Arc::clone(&self.online),
            }),
            SchedulerConfig::default(),
        );
        scheduler.reinit(Contact::list(&self.store)?);

        let mut overlay = Overlay {
            node,
            scheduler,
            hosted: HashMap::new(),
            joined: HashMap::new(),
        };
        self.start_event_tasks(&mut overlay, &profile).await?;

        inner.overlay = Some(overlay);
        self.online.store(true, Ordering::SeqCst);
        info!("gateway enabled");
        Ok(())
    }

    /// Take the overlay down again. Idempotent.
    pub async fn disable_gateway(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.teardown_overlay(&mut inner);
        Ok(())
    }

    /// Whether the overlay is currently up.
    pub async fn gateway_enabled(&self) -> bool {
        self.inner.lock().await.overlay.is_some()
    }

    //
    // Pairing
    //

    /// Open a pairing session, returning the secret to transport
    /// out-of-band.
    pub async fn init_pairing(&self) -> Result<(SecretIdentity, PublicAddress)> {
        let mut inner = self.inner.lock().await;
        let _profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
        let overlay = inner.overlay.as_ref().ok_or(Error::NetworkDisabled)?;
        if inner.pairing.is_some() {
            return Err(Error::AlreadyPairing);
        }
        let session =
            mesh_pairing::PairingServer::start(&self.gateway, overlay.node.public()?).await?;
        let secret = session.secret();
        inner.pairing = Some(session);
        Ok(secret)
    }

    /// Wait for our pairing session to complete and install the peer as
    /// a contact.
    pub async fn wait_pairing(&self) -> Result<Fingerprint> {
        let session = {
            let inner = self.inner.lock().await;
            inner.pairing.as_ref().cloned().ok_or(Error::NotPairing)?
        };
        let waited = session.wait(&CancellationToken::new()).await;
        let mut inner = self.inner.lock().await;
        inner.pairing = None;
        let theirs = waited.map_err(Error::from)?;
        self.add_contact(&mut inner, theirs).await
    }

    /// Abort any running pairing session.
    pub async fn abort_pairing(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner.pairing.take().ok_or(Error::NotPairing)?;
        session.close();
        Ok(())
    }

    /// Join a peer's pairing session from its out-of-band secret, and
    /// install the peer as a contact.
    pub async fn join_pairing(
        &self,
        secret: &SecretIdentity,
        address: &PublicAddress,
    ) -> Result<Fingerprint> {
        let ours = {
            let inner = self.inner.lock().await;
            let _profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
            let overlay = inner.overlay.as_ref().ok_or(Error::NetworkDisabled)?;
            overlay.node.public()?
        };
        let theirs = mesh_pairing::join(&self.gateway, secret, address, ours).await?;
        let mut inner = self.inner.lock().await;
        self.add_contact(&mut inner, theirs).await
    }

    //
    // Contacts
    //

    /// Every contact, with what we know about them.
    pub async fn contacts(&self) -> Result<Vec<(Fingerprint, Contact)>> {
        let mut out = Vec::new();
        for fp in Contact::list(&self.store)? {
            if let Some(contact) = Contact::load(&self.store, &fp)? {
                out.push((fp, contact));
            }
        }
        Ok(out)
    }

    /// One contact's record.
    pub async fn contact(&self, fp: &Fingerprint) -> Result<Contact> {
        Contact::load(&self.store, fp)?.ok_or(Error::ContactNotFound)
    }

    /// Remove a contact: revoke their access, rotate our address, and
    /// drop everything stored about them.
    pub async fn remove_contact(&self, fp: &Fingerprint) -> Result<()> {
        let inner = self.inner.lock().await;
        let contact = Contact::load(&self.store, fp)?.ok_or(Error::ContactNotFound)?;

        match inner.overlay.as_ref() {
            Some(overlay) => {
                overlay.node.untrust(fp).await?;
                overlay.scheduler.reinit(
                    Contact::list(&self.store)?
                        .into_iter()
                        .filter(|c| c != fp)
                        .collect(),
                );
            }
            None => {
                // Offline removal mutates the stored ring directly.
                let mut profile =
                    Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
                profile.keyring.untrust(fp)?;
                profile.save(&self.store)?;
            }
        }

        if contact.has_avatar() {
            self.cdn.release(&contact.avatar)?;
        }
        Contact::erase(&self.store, fp)?;
        info!(peer = %fp, "contact removed");
        Ok(())
    }

    //
    // Events
    //

    /// Host a new event, returning its fingerprint.
    pub async fn create_event(&self, name: &str, banner: &[u8]) -> Result<Fingerprint> {
        let mut inner = self.inner.lock().await;
        let _profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
        let hash = self.cdn.upload(banner)?;
        let event = HostedEvent::create(name, hash);
        let fp = event.fingerprint();
        save_hosted(&self.store, &event)?;

        if let Some(overlay) = inner.overlay.as_mut() {
            let server = EventServer::start(&self.gateway, event, self.event_host()).await?;
            overlay.hosted.insert(fp, server);
        }
        info!(event = %fp, "event created");
        Ok(fp)
    }

    /// Every hosted event.
    pub async fn hosted_events(&self) -> Result<Vec<Fingerprint>> {
        list_events(&self.store, HOSTED_PREFIX)
    }

    /// Every joined event.
    pub async fn joined_events(&self) -> Result<Vec<Fingerprint>> {
        list_events(&self.store, JOINED_PREFIX)
    }

    /// One hosted event's record, live if the server is running.
    pub async fn hosted_event(&self, fp: &Fingerprint) -> Result<HostedEvent> {
        {
            let inner = self.inner.lock().await;
            if let Some(overlay) = inner.overlay.as_ref() {
                if let Some(server) = overlay.hosted.get(fp) {
                    return Ok(server.snapshot()?);
                }
            }
        }
        load_hosted(&self.store, fp)?.ok_or(Error::EventNotFound)
    }

    /// One joined event's record, live if the client is running.
    pub async fn joined_event(&self, fp: &Fingerprint) -> Result<JoinedEvent> {
        {
            let inner = self.inner.lock().await;
            if let Some(overlay) = inner.overlay.as_ref() {
                if let Some(client) = overlay.joined.get(fp) {
                    return Ok(client.snapshot()?);
                }
            }
        }
        load_joined(&self.store, fp)?.ok_or(Error::EventNotFound)
    }

    /// Conclude a hosted event.
    pub async fn terminate_event(&self, fp: &Fingerprint) -> Result<()> {
        let inner = self.inner.lock().await;
        if let Some(overlay) = inner.overlay.as_ref() {
            if let Some(server) = overlay.hosted.get(fp) {
                return server.terminate().map_err(map_event_err);
            }
        }
        let mut event = load_hosted(&self.store, fp)?.ok_or(Error::EventNotFound)?;
        if event.concluded() {
            return Err(Error::EventConcluded);
        }
        event.end = Timestamp::now();
        event.updated = event.end;
        save_hosted(&self.store, &event)?;
        Ok(())
    }

    /// Open (or re-issue) the checkin session of a hosted event,
    /// returning the credential to hand to the invitee.
    pub async fn init_event_checkin(&self, fp: &Fingerprint) -> Result<CheckinCredential> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.checkins.get(fp) {
            return Ok(session.credential().clone());
        }
        let overlay = inner.overlay.as_ref().ok_or(Error::NetworkDisabled)?;
        let server = overlay.hosted.get(fp).ok_or(Error::EventNotFound)?;
        let session = server.checkin().map_err(map_event_err)?;
        let credential = session.credential().clone();
        inner.checkins.insert(*fp, session);
        Ok(credential)
    }

    /// Wait for the pending checkin of a hosted event to conclude.
    pub async fn wait_event_checkin(&self, fp: &Fingerprint) -> Result<Fingerprint> {
        let mut session = {
            let inner = self.inner.lock().await;
            inner
                .checkins
                .get(fp)
                .cloned()
                .ok_or(Error::CheckinNotInProgress)?
        };
        let outcome = session.wait(&CancellationToken::new()).await;
        let mut inner = self.inner.lock().await;
        inner.checkins.remove(fp);
        outcome.map_err(map_event_err)
    }

    /// Join an event from its checkin credential: persist it, check in,
    /// and start the periodic sync loop.
    pub async fn join_event_checkin(&self, credential: &CheckinCredential) -> Result<Fingerprint> {
        let client = {
            let mut inner = self.inner.lock().await;
            let profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
            let overlay = inner.overlay.as_mut().ok_or(Error::NetworkDisabled)?;
            let fp = credential.identity.fingerprint();
            if load_joined(&self.store, &fp)?.is_some() {
                return Err(Error::EventAlreadyJoined);
            }
            let joined = JoinedEvent::from_invitation(
                credential.identity,
                credential.address,
                credential.session.clone(),
            );
            save_joined(&self.store, &joined)?;
            let client = EventClient::new(
                Arc::clone(&self.gateway),
                joined,
                profile.keyring.identity().clone(),
                self.event_guest(),
            );
            overlay.joined.insert(fp, Arc::clone(&client));
            client
        };
        client.checkin().await.map_err(map_event_err)?;
        client.spawn_loop();
        Ok(client.fingerprint().map_err(map_event_err)?)
    }

    /// Record our own infection status and push it to every joined
    /// event's organizer.
    pub async fn report_infection(&self, status: InfectionStatus) -> Result<()> {
        let inner = self.inner.lock().await;
        let mut profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
        if !mesh_events::valid_transition(profile.status, status) {
            return Err(Error::InvalidTransition);
        }
        profile.status = status;
        profile.save(&self.store)?;

        if let Some(overlay) = inner.overlay.as_ref() {
            for client in overlay.joined.values() {
                let client = Arc::clone(client);
                tokio::spawn(async move {
                    if let Err(e) = client.sync().await {
                        debug!(error = %e, "report delivery failed; loop will retry");
                    }
                });
            }
        }
        info!(status = %status, "infection status recorded");
        Ok(())
    }

    //
    // Internals
    //

    /// Install a freshly paired peer as a contact.
    async fn add_contact(
        &self,
        inner: &mut Inner,
        theirs: PublicKeyRing,
    ) -> Result<Fingerprint> {
        let profile = Profile::load(&self.store)?.ok_or(Error::ProfileNotFound)?;
        let fp = theirs.identity.fingerprint();
        if fp == profile.keyring.identity().fingerprint() {
            return Err(Error::SelfContact);
        }
        if Contact::load(&self.store, &fp)?.is_some() {
            return Err(Error::ContactExists);
        }
        let overlay = inner.overlay.as_ref().ok_or(Error::NetworkDisabled)?;
        overlay.node.trust(theirs)?;
        Contact::empty().save(&self.store, &fp)?;
        overlay.scheduler.reinit(Contact::list(&self.store)?);
        info!(peer = %fp, "contact added");
        Ok(fp)
    }

    /// Send our profile to everyone: live links directly, the rest via
    /// the scheduler at broadcast priority.
    fn broadcast_profile(&self, inner: &Inner, profile: &Profile) {
        let Some(overlay) = inner.overlay.as_ref() else {
            return;
        };
        let envelope = ContactEnvelope::profile(profile.name.clone(), profile.avatar);
        let trusted: Vec<Fingerprint> =
            profile.keyring.trusted().keys().copied().collect();
        broadcast(
            &self.encoders,
            &overlay.scheduler,
            trusted,
            &envelope,
            PROFILE_BROADCAST_PRIORITY,
        );
    }

    /// The node's ring callback: write the mutated ring back into the
    /// persisted profile. A storage failure here is fatal for the
    /// callback, because memory and disk must not diverge.
    fn ring_callback(&self) -> RingCallback {
        let store = Arc::clone(&self.store);
        Box::new(move |ring| {
            let mut profile = Profile::load(&store)
                .map_err(|e| Box::new(e) as BoxError)?
                .ok_or_else(|| Box::<dyn std::error::Error + Send + Sync>::from("profile missing"))?;
            profile.keyring = ring.clone();
            profile.save(&store).map_err(|e| Box::new(e) as BoxError)?;
            Ok(())
        })
    }

    /// Start event servers and clients for every record still in its
    /// maintenance window; archive the ones past retention.
    async fn start_event_tasks(&self, overlay: &mut Overlay, profile: &Profile) -> Result<()> {
        let now = Timestamp::now();
        for fp in list_events(&self.store, HOSTED_PREFIX)? {
            let Some(event) = load_hosted(&self.store, &fp)? else {
                continue;
            };
            if event.concluded() && now > event.end + ARCHIVE_PERIOD {
                debug!(event = %fp, "archiving expired hosted event");
                if event.banner != [0; 32] {
                    self.cdn.release(&event.banner)?;
                }
                self.store.del(&hosted_key(&fp))?;
                continue;
            }
            if event.concluded() && now > event.end + MAINTENANCE_PERIOD {
                continue;
            }
            let server = EventServer::start(&self.gateway, event, self.event_host()).await?;
            overlay.hosted.insert(fp, server);
        }
        for fp in list_events(&self.store, JOINED_PREFIX)? {
            let Some(event) = load_joined(&self.store, &fp)? else {
                continue;
            };
            if !event.end.is_zero() && now > event.end + ARCHIVE_PERIOD {
                debug!(event = %fp, "archiving expired joined event");
                if event.banner != [0; 32] {
                    self.cdn.release(&event.banner)?;
                }
                self.store.del(&joined_key(&fp))?;
                continue;
            }
            if !event.end.is_zero() && now > event.end + MAINTENANCE_PERIOD {
                continue;
            }
            let client = EventClient::new(
                Arc::clone(&self.gateway),
                event,
                profile.keyring.identity().clone(),
                self.event_guest(),
            );
            client.spawn_loop();
            overlay.joined.insert(fp, client);
        }
        Ok(())
    }

    /// Shut the overlay down and clear every live handle.
    fn teardown_overlay(&self, inner: &mut Inner) {
        self.online.store(false, Ordering::SeqCst);
        if let Some(session) = inner.pairing.take() {
            session.close();
        }
        inner.checkins.clear();
        if let Some(overlay) = inner.overlay.take() {
            overlay.scheduler.close();
            for server in overlay.hosted.values() {
                server.close();
            }
            for client in overlay.joined.values() {
                client.close();
            }
            overlay.node.close();
            info!("gateway disabled");
        }
        if let Ok(mut encoders) = self.encoders.lock() {
            encoders.clear();
        }
    }

    /// The organizer-side callbacks, bound to our storage.
    fn event_host(&self) -> Arc<dyn EventHost> {
        Arc::new(HostHooks {
            store: Arc::clone(&self.store),
            cdn: self.cdn.clone(),
        })
    }

    /// The guest-side callbacks, bound to our storage.
    fn event_guest(&self) -> Arc<dyn EventGuest> {
        Arc::new(GuestHooks {
            store: Arc::clone(&self.store),
            cdn: self.cdn.clone(),
        })
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

/// Scheduler plumbing: dial through the node while the overlay is up.
struct SchedulerDial {
    /// The node doing the dialing.
    node: Arc<Node>,
    /// Shared overlay-up flag.
    online: Arc<AtomicBool>,
}

#[async_trait]
impl mesh_sched::Dial for SchedulerDial {
    fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn dial(&self, fp: Fingerprint) -> bool {
        match self.node.dial(&fp).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %fp, error = %e, "scheduled dial failed");
                false
            }
        }
    }
}

/// Organizer-side persistence hooks.
struct HostHooks {
    /// Durable storage.
    store: SharedStore,
    /// Image storage.
    cdn: ContentStore,
}

impl EventHost for HostHooks {
    fn on_update(&self, event: &HostedEvent) -> std::result::Result<(), BoxError> {
        save_hosted(&self.store, event).map_err(|e| Box::new(e) as BoxError)
    }

    fn on_report(&self, event: &Fingerprint, pseudonym: &Fingerprint, status: InfectionStatus) {
        info!(event = %event, participant = %pseudonym, status = %status, "report accepted");
    }

    fn banner(&self, event: &HostedEvent) -> std::result::Result<Vec<u8>, BoxError> {
        self.cdn
            .fetch(&event.banner)
            .map_err(|e| Box::new(e) as BoxError)?
            .ok_or_else(|| Box::<dyn std::error::Error + Send + Sync>::from("banner missing"))
    }
}

/// Guest-side persistence hooks.
struct GuestHooks {
    /// Durable storage.
    store: SharedStore,
    /// Image storage.
    cdn: ContentStore,
}

impl EventGuest for GuestHooks {
    fn profile(&self) -> GuestProfile {
        match Profile::load(&self.store) {
            Ok(Some(profile)) => GuestProfile::new(profile.name, profile.status, String::new()),
            _ => GuestProfile::new(String::new(), InfectionStatus::Unknown, String::new()),
        }
    }

    fn on_update(&self, event: &JoinedEvent) -> std::result::Result<(), BoxError> {
        save_joined(&self.store, event).map_err(|e| Box::new(e) as BoxError)
    }

    fn on_banner(
        &self,
        event: &Fingerprint,
        bytes: &[u8],
    ) -> std::result::Result<(), BoxError> {
        // Replace whatever banner we held before.
        let previous = load_joined(&self.store, event)
            .ok()
            .flatten()
            .map(|e| e.banner)
            .filter(|b| *b != [0; 32]);
        self.cdn.upload(bytes).map_err(|e| Box::new(e) as BoxError)?;
        if let Some(previous) = previous {
            if let Err(e) = self.cdn.release(&previous) {
                warn!(event = %event, error = %e, "stale banner release failed");
            }
        }
        Ok(())
    }
}

/// Storage key prefix of hosted events.
const HOSTED_PREFIX: &str = "hosted-";

/// Storage key prefix of joined events.
const JOINED_PREFIX: &str = "joined-";

/// The storage key of a hosted event.
fn hosted_key(fp: &Fingerprint) -> Vec<u8> {
    format!("{}{}", HOSTED_PREFIX, fp).into_bytes()
}

/// The storage key of a joined event.
fn joined_key(fp: &Fingerprint) -> Vec<u8> {
    format!("{}{}", JOINED_PREFIX, fp).into_bytes()
}

/// Load a hosted event record.
fn load_hosted(store: &SharedStore, fp: &Fingerprint) -> Result<Option<HostedEvent>> {
    match store.get(&hosted_key(fp))? {
        Some(raw) => Ok(Some(
            serde_json::from_slice(&raw).map_err(|e| Error::corrupt(e, "hosted event"))?,
        )),
        None => Ok(None),
    }
}

/// Persist a hosted event record.
fn save_hosted(store: &SharedStore, event: &HostedEvent) -> Result<()> {
    let raw = serde_json::to_vec(event).map_err(|e| Error::corrupt(e, "hosted event"))?;
    Ok(store.put(&hosted_key(&event.fingerprint()), &raw)?)
}

/// Load a joined event record.
fn load_joined(store: &SharedStore, fp: &Fingerprint) -> Result<Option<JoinedEvent>> {
    match store.get(&joined_key(fp))? {
        Some(raw) => Ok(Some(
            serde_json::from_slice(&raw).map_err(|e| Error::corrupt(e, "joined event"))?,
        )),
        None => Ok(None),
    }
}

/// Persist a joined event record.
fn save_joined(store: &SharedStore, event: &JoinedEvent) -> Result<()> {
    let raw = serde_json::to_vec(event).map_err(|e| Error::corrupt(e, "joined event"))?;
    Ok(store.put(&joined_key(&event.fingerprint()), &raw)?)
}

/// Every event fingerprint stored under `prefix`.
fn list_events(store: &SharedStore, prefix: &str) -> Result<Vec<Fingerprint>> {
    let mut out = Vec::new();
    for key in store.keys_with_prefix(prefix.as_bytes())? {
        let Ok(text) = std::str::from_utf8(&key) else {
            continue;
        };
        let Some(fp) = text.strip_prefix(prefix) else {
            continue;
        };
        if let Ok(fp) = fp.parse() {
            out.push(fp);
        }
    }
    Ok(out)
}

/// Translate event-protocol errors into facade errors where the facade
/// has a dedicated kind.
fn map_event_err(e: mesh_events::Error) -> Error {
    match e {
        mesh_events::Error::EventConcluded => Error::EventConcluded,
        mesh_events::Error::CheckinNotInProgress => Error::CheckinNotInProgress,
        mesh_events::Error::ContextCancelled => Error::ContextCancelled,
        other => Error::Events(other),
    }
}
