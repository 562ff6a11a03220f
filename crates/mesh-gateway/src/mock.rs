//! An in-process gateway for tests and local development.
//!
//! A [`MockNetwork`] is a registry from hidden-address strings to loopback
//! socket addresses. Every [`MockGateway`] cloned off the same network
//! shares the registry, so several nodes can run in one process and reach
//! each other exactly as they would across a real anonymizing network,
//! minus the latency.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mesh_crypto::{OnionAddr, SecretAddress};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::{Error, Gateway, GatewayStream, IncomingStreams, Listener, Result};

/// Registry shared by every gateway of one mock network.
#[derive(Default)]
struct Registry {
    /// Hidden address string → loopback address currently serving it.
    routes: HashMap<String, SocketAddr>,
}

/// A simulated anonymizing network living inside one process.
#[derive(Default)]
pub struct MockNetwork {
    /// The shared routing table.
    registry: Mutex<Registry>,
}

impl MockNetwork {
    /// Create a new, empty mock network.
    pub fn new() -> Arc<Self> {
        Arc::new(MockNetwork::default())
    }

    /// Return a gateway attached to this network.
    pub fn gateway(self: &Arc<Self>) -> MockGateway {
        MockGateway {
            network: Arc::clone(self),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// A [`Gateway`] implementation backed by a [`MockNetwork`].
#[derive(Clone)]
pub struct MockGateway {
    /// The network this gateway belongs to.
    network: Arc<MockNetwork>,
    /// Whether the gateway currently accepts work.
    enabled: Arc<AtomicBool>,
}

impl MockGateway {
    /// Administratively disable the gateway: subsequent listens and dials
    /// fail with [`Error::Disabled`]. Existing streams are unaffected.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Report whether the gateway is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Inbound stream source for one mock listener; deregisters on drop.
struct MockIncoming {
    /// The network we are registered with.
    network: Arc<MockNetwork>,
    /// Our key in the routing table.
    route: String,
    /// The loopback listener behind the hidden address.
    listener: TcpListener,
}

#[async_trait]
impl IncomingStreams for MockIncoming {
    async fn accept(&mut self) -> Result<GatewayStream> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::from_io("accept", e))?;
        Ok(Box::new(stream))
    }
}

impl Drop for MockIncoming {
    fn drop(&mut self) {
        if let Ok(mut reg) = self.network.registry.lock() {
            reg.routes.remove(&self.route);
        }
        debug!(route = %self.route, "mock listener unpublished");
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn listen(&self, address: &SecretAddress) -> Result<Listener> {
        if !self.is_enabled() {
            return Err(Error::Disabled);
        }
        let onion = address.public().onion();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::from_io("bind", e))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::from_io("local_addr", e))?;
        let route = onion.to_string();
        {
            let mut reg = self
                .network
                .registry
                .lock()
                .map_err(|_| Error::ListenerClosed)?;
            reg.routes.insert(route.clone(), local);
        }
        debug!(route = %route, %local, "mock listener published");
        Ok(Listener::new(
            onion,
            Box::new(MockIncoming {
                network: Arc::clone(&self.network),
                route,
                listener,
            }),
        ))
    }

    async fn dial(&self, onion: &OnionAddr) -> Result<GatewayStream> {
        if !self.is_enabled() {
            return Err(Error::Disabled);
        }
        let target = {
            let reg = self
                .network
                .registry
                .lock()
                .map_err(|_| Error::Unreachable(*onion))?;
            reg.routes.get(&onion.to_string()).copied()
        };
        let target = target.ok_or(Error::Unreachable(*onion))?;
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| Error::from_io("connect", e))?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn listen_dial_roundtrip() {
        let network = MockNetwork::new();
        let gw = network.gateway();
        let address = SecretAddress::generate();
        let mut listener = gw.listen(&address).await.unwrap();

        let onion = *listener.onion();
        let dialer = network.gateway();
        let client = tokio::spawn(async move {
            let mut stream = dialer.dial(&onion).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0_u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });

        let mut accepted = listener.accept().await.unwrap();
        let mut buf = [0_u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        accepted.write_all(b"pong").await.unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_address_unreachable() {
        let network = MockNetwork::new();
        let gw = network.gateway();
        let onion = SecretAddress::generate().public().onion();
        assert!(matches!(gw.dial(&onion).await, Err(Error::Unreachable(_))));
    }

    #[tokio::test]
    async fn drop_unpublishes() {
        let network = MockNetwork::new();
        let gw = network.gateway();
        let address = SecretAddress::generate();
        let listener = gw.listen(&address).await.unwrap();
        let onion = *listener.onion();
        drop(listener);
        assert!(matches!(gw.dial(&onion).await, Err(Error::Unreachable(_))));
    }

    #[tokio::test]
    async fn disabled_gateway_refuses() {
        let network = MockNetwork::new();
        let gw = network.gateway();
        gw.set_enabled(false);
        let address = SecretAddress::generate();
        assert!(matches!(gw.listen(&address).await, Err(Error::Disabled)));
        assert!(matches!(
            gw.dial(&address.public().onion()).await,
            Err(Error::Disabled)
        ));
    }

    #[tokio::test]
    async fn gateways_share_one_network() {
        let network = MockNetwork::new();
        let a = network.gateway();
        let b = network.gateway();
        let address = SecretAddress::generate();
        let listener = a.listen(&address).await.unwrap();
        // The other gateway can reach it; a foreign network cannot.
        assert!(b.dial(listener.onion()).await.is_ok());
        let foreign = MockNetwork::new().gateway();
        assert!(foreign.dial(listener.onion()).await.is_err());
    }
}
