//! End-to-end tests of the event protocol over the mock network.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use mesh_crypto::{Fingerprint, SecretIdentity};
use mesh_events::{
    CheckinCredential, EventClient, EventGuest, EventHost, EventServer, GuestProfile, HostedEvent,
    JoinedEvent,
};
use mesh_gateway::{Gateway, MockNetwork};
use mesh_net::{exchange_magic, Dialer};
use mesh_proto::event::{self, EventEnvelope, InfectionStatus};
use mesh_proto::{negotiate, split};
use tokio_util::sync::CancellationToken;

/// A host that remembers the last persisted snapshot and accepted
/// reports, and serves a fixed banner.
struct TestHost {
    banner: Vec<u8>,
    updates: Mutex<Vec<HostedEvent>>,
    reports: Mutex<Vec<(Fingerprint, InfectionStatus)>>,
}

impl TestHost {
    fn new(banner: &[u8]) -> Arc<Self> {
        Arc::new(TestHost {
            banner: banner.to_vec(),
            updates: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
        })
    }
}

impl EventHost for TestHost {
    fn on_update(&self, event: &HostedEvent) -> Result<(), mesh_events::CallbackError> {
        self.updates.lock().unwrap().push(event.clone());
        Ok(())
    }
    fn on_report(&self, _event: &Fingerprint, pseudonym: &Fingerprint, status: InfectionStatus) {
        self.reports.lock().unwrap().push((*pseudonym, status));
    }
    fn banner(&self, _event: &HostedEvent) -> Result<Vec<u8>, mesh_events::CallbackError> {
        Ok(self.banner.clone())
    }
}

/// A guest with a mutable profile and recorded banner stores.
struct TestGuest {
    profile: Mutex<GuestProfile>,
    banners: Mutex<Vec<Vec<u8>>>,
}

impl TestGuest {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(TestGuest {
            profile: Mutex::new(GuestProfile::new(
                name.to_owned(),
                InfectionStatus::Unknown,
                String::new(),
            )),
            banners: Mutex::new(Vec::new()),
        })
    }

    fn set_status(&self, status: InfectionStatus) {
        self.profile.lock().unwrap().status = status;
    }
}

impl EventGuest for TestGuest {
    fn profile(&self) -> GuestProfile {
        self.profile.lock().unwrap().clone()
    }
    fn on_update(&self, _event: &JoinedEvent) -> Result<(), mesh_events::CallbackError> {
        Ok(())
    }
    fn on_banner(&self, _event: &Fingerprint, bytes: &[u8]) -> Result<(), mesh_events::CallbackError> {
        self.banners.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
}

/// Spin up an event server plus one checked-in guest client.
async fn checked_in_pair(
    network: &Arc<MockNetwork>,
    host: Arc<TestHost>,
    guest: Arc<TestGuest>,
) -> (Arc<EventServer>, Arc<EventClient>, Fingerprint, SecretIdentity) {
    let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
    let server = EventServer::start(&gateway, HostedEvent::create("Barbecue", [7; 32]), host)
        .await
        .unwrap();

    let mut session = server.checkin().unwrap();
    let credential = session.credential().clone();
    let joined = JoinedEvent::from_invitation(
        credential.identity,
        credential.address,
        credential.session,
    );
    let user = SecretIdentity::generate();
    let client = EventClient::new(gateway, joined, user.clone(), guest);
    client.checkin().await.unwrap();
    let pseudonym = session.wait(&CancellationToken::new()).await.unwrap();
    (server, client, pseudonym, user)
}

#[tokio::test]
async fn checkin_happy_path() {
    let network = MockNetwork::new();
    let host = TestHost::new(b"banner-bytes");
    let (server, client, pseudonym, _user) =
        checked_in_pair(&network, Arc::clone(&host), TestGuest::new("Bob")).await;

    let snapshot = server.snapshot().unwrap();
    assert!(snapshot.participants.contains_key(&pseudonym));
    assert!(!client.snapshot().unwrap().needs_checkin());
    assert!(!host.updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn checkin_credential_is_single_use() {
    let network = MockNetwork::new();
    let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
    let server = EventServer::start(
        &gateway,
        HostedEvent::create("Barbecue", [7; 32]),
        TestHost::new(b"banner"),
    )
    .await
    .unwrap();

    // Re-requesting the session before it is consumed yields the same
    // credential.
    let mut session = server.checkin().unwrap();
    let again = server.checkin().unwrap();
    assert_eq!(
        session.credential().session.seed(),
        again.credential().session.seed()
    );
    let credential = session.credential().clone();

    let join = |credential: CheckinCredential, name: &str| {
        let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
        let joined = JoinedEvent::from_invitation(
            credential.identity,
            credential.address,
            credential.session,
        );
        EventClient::new(
            gateway,
            joined,
            SecretIdentity::generate(),
            TestGuest::new(name),
        )
    };

    join(credential.clone(), "Bob").checkin().await.unwrap();
    let fp = session.wait(&CancellationToken::new()).await.unwrap();

    // The same credential in different hands fails.
    assert!(join(credential, "Mallory").checkin().await.is_err());
    let snapshot = server.snapshot().unwrap();
    assert_eq!(snapshot.participants.len(), 1);
    assert!(snapshot.participants.contains_key(&fp));
}

#[tokio::test]
async fn termination_is_final() {
    let network = MockNetwork::new();
    let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
    let server = EventServer::start(
        &gateway,
        HostedEvent::create("Barbecue", [7; 32]),
        TestHost::new(b"banner"),
    )
    .await
    .unwrap();

    server.terminate().unwrap();
    assert!(matches!(
        server.terminate(),
        Err(mesh_events::Error::EventConcluded)
    ));
    assert!(!server.snapshot().unwrap().end.is_zero());
    assert!(matches!(
        server.checkin(),
        Err(mesh_events::Error::EventConcluded)
    ));
}

#[tokio::test]
async fn metadata_and_stats_flow() {
    let network = MockNetwork::new();
    let host = TestHost::new(b"banner-bytes");
    let guest = TestGuest::new("Bob");
    let (_server, client, _fp, _user) =
        checked_in_pair(&network, Arc::clone(&host), Arc::clone(&guest)).await;

    client.sync().await.unwrap();
    let snapshot = client.snapshot().unwrap();
    assert_eq!(snapshot.name, "Barbecue");
    assert_eq!(snapshot.attendees, 2);
    assert!(!snapshot.synced.is_zero());
    // The banner travelled as bytes and was stored by the guest.
    assert_eq!(guest.banners.lock().unwrap().as_slice(), &[b"banner-bytes".to_vec()]);
    use sha3::Digest as _;
    let expected: [u8; 32] = sha3::Sha3_256::digest(b"banner-bytes").into();
    assert_eq!(snapshot.banner, expected);
}

#[tokio::test]
async fn status_transitions_are_enforced() {
    let network = MockNetwork::new();
    let host = TestHost::new(b"banner");
    let guest = TestGuest::new("Bob");
    let (server, client, pseudonym, _user) =
        checked_in_pair(&network, Arc::clone(&host), Arc::clone(&guest)).await;

    // unknown -> suspected: accepted.
    guest.set_status(InfectionStatus::Suspected);
    client.sync().await.unwrap();
    assert_eq!(client.snapshot().unwrap().status, InfectionStatus::Suspected);
    assert_eq!(
        server.snapshot().unwrap().statuses.get(&pseudonym),
        Some(&InfectionStatus::Suspected)
    );

    // suspected -> negative: accepted and terminal.
    guest.set_status(InfectionStatus::Negative);
    client.sync().await.unwrap();
    assert_eq!(client.snapshot().unwrap().status, InfectionStatus::Negative);

    // negative -> positive: refused, acknowledged with negative; the
    // link survives and nothing changes.
    guest.set_status(InfectionStatus::Positive);
    client.sync().await.unwrap();
    assert_eq!(client.snapshot().unwrap().status, InfectionStatus::Negative);
    assert_eq!(
        server.snapshot().unwrap().statuses.get(&pseudonym),
        Some(&InfectionStatus::Negative)
    );
    let accepted: Vec<InfectionStatus> = host
        .reports
        .lock()
        .unwrap()
        .iter()
        .map(|(_, s)| *s)
        .collect();
    assert_eq!(
        accepted,
        vec![InfectionStatus::Suspected, InfectionStatus::Negative]
    );
}

#[tokio::test]
async fn crafted_unknown_report_is_refused() {
    let network = MockNetwork::new();
    let guest = TestGuest::new("Bob");
    let (server, client, pseudonym, user) =
        checked_in_pair(&network, TestHost::new(b"banner"), Arc::clone(&guest)).await;

    // Establish a negative status first.
    guest.set_status(InfectionStatus::Negative);
    client.sync().await.unwrap();

    // Now speak the protocol by hand and try to move back to unknown.
    let state = client.snapshot().unwrap();
    let gateway = network.gateway();
    let stream = gateway.dial(&state.address.onion()).await.unwrap();
    let dialer = Dialer::new(&state.pseudonym).unwrap();
    let (_id, stream) = dialer.connect(stream).await.unwrap();
    let stream = exchange_magic(stream).await.unwrap();
    let (mut decoder, mut encoder) = split(stream);
    negotiate(&mut decoder, &mut encoder, event::PROTOCOL, &[event::VERSION])
        .await
        .unwrap();

    let payload = event::report_signing_payload(
        state.identity.as_bytes(),
        "Bob",
        "unknown",
        "",
    );
    let report = mesh_proto::event::Report::new(
        "Bob".into(),
        "unknown".into(),
        String::new(),
        *user.public().as_bytes(),
        user.sign(&payload),
    );
    encoder.send(&EventEnvelope::report(report)).await.unwrap();
    let answer: EventEnvelope = decoder.recv().await.unwrap();

    // The organizer keeps the books unchanged and answers with the
    // status on file.
    assert_eq!(answer.report_ack.unwrap().status, "negative");
    assert_eq!(
        server.snapshot().unwrap().statuses.get(&pseudonym),
        Some(&InfectionStatus::Negative)
    );
}

#[tokio::test]
async fn identity_swap_disconnects() {
    let network = MockNetwork::new();
    let guest = TestGuest::new("Bob");
    let (server, client, pseudonym, _user) =
        checked_in_pair(&network, TestHost::new(b"banner"), Arc::clone(&guest)).await;

    // File a legitimate report binding the pseudonym to Bob's identity.
    guest.set_status(InfectionStatus::Suspected);
    client.sync().await.unwrap();

    // A different real identity now reports under the same pseudonym.
    let state = client.snapshot().unwrap();
    let mallory = SecretIdentity::generate();
    let gateway = network.gateway();
    let stream = gateway.dial(&state.address.onion()).await.unwrap();
    let dialer = Dialer::new(&state.pseudonym).unwrap();
    let (_id, stream) = dialer.connect(stream).await.unwrap();
    let stream = exchange_magic(stream).await.unwrap();
    let (mut decoder, mut encoder) = split(stream);
    negotiate(&mut decoder, &mut encoder, event::PROTOCOL, &[event::VERSION])
        .await
        .unwrap();

    let payload =
        event::report_signing_payload(state.identity.as_bytes(), "Bob", "positive", "");
    let report = mesh_proto::event::Report::new(
        "Bob".into(),
        "positive".into(),
        String::new(),
        *mallory.public().as_bytes(),
        mallory.sign(&payload),
    );
    encoder.send(&EventEnvelope::report(report)).await.unwrap();

    // The organizer hangs up instead of answering.
    assert!(decoder.recv::<EventEnvelope>().await.is_err());
    assert_eq!(
        server.snapshot().unwrap().statuses.get(&pseudonym),
        Some(&InfectionStatus::Suspected)
    );
}

#[tokio::test]
async fn wait_is_cancellable() {
    let network = MockNetwork::new();
    let gateway: Arc<dyn Gateway> = Arc::new(network.gateway());
    let server = EventServer::start(
        &gateway,
        HostedEvent::create("Barbecue", [7; 32]),
        TestHost::new(b"banner"),
    )
    .await
    .unwrap();

    let mut session = server.checkin().unwrap();
    let token = CancellationToken::new();
    token.cancel();
    assert!(matches!(
        session.wait(&token).await,
        Err(mesh_events::Error::ContextCancelled)
    ));
}
