//! Dispatching negotiated connections to protocol handlers.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use mesh_crypto::Fingerprint;
use mesh_gateway::GatewayStream;
use tracing::debug;

use crate::record::{split, Decoder, Encoder};
use crate::{negotiate, Error, Result};

/// A handler for one version of one protocol.
///
/// Receives the authenticated peer fingerprint and exclusive ownership of
/// the two directions of the stream; the connection closes when the
/// returned future resolves.
pub type ProtocolHandler =
    Arc<dyn Fn(Fingerprint, Decoder, Encoder) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A registry of handlers for the versions of one protocol.
///
/// The muxer negotiates the version with the peer (see [`negotiate`]) and
/// hands the stream to whatever is registered for the agreed version.
pub struct Muxer {
    /// The protocol this muxer serves.
    protocol: String,
    /// Handler per advertised version.
    handlers: HashMap<u64, ProtocolHandler>,
}

impl Muxer {
    /// Create a muxer for `protocol` with no versions yet.
    pub fn new(protocol: impl Into<String>) -> Self {
        Muxer {
            protocol: protocol.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for one version, replacing any previous one.
    pub fn register(&mut self, version: u64, handler: ProtocolHandler) -> &mut Self {
        self.handlers.insert(version, handler);
        self
    }

    /// The versions this muxer will advertise, ascending.
    pub fn versions(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.handlers.keys().copied().collect();
        v.sort_unstable();
        v
    }

    /// Negotiate on `stream` and run the winning handler to completion.
    pub async fn serve(&self, fp: Fingerprint, stream: GatewayStream) -> Result<()> {
        let (mut decoder, mut encoder) = split(stream);
        let version =
            negotiate(&mut decoder, &mut encoder, &self.protocol, &self.versions()).await?;
        let handler = self
            .handlers
            .get(&version)
            .ok_or_else(|| Error::UnsupportedVersion {
                protocol: self.protocol.clone(),
                version,
            })?;
        debug!(peer = %fp, protocol = %self.protocol, version, "dispatching connection");
        handler(fp, decoder, encoder).await
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("protocol", &self.protocol)
            .field("versions", &self.versions())
            .finish()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use mesh_crypto::SecretIdentity;

    /// Build a boxed duplex pair usable as two peer streams.
    fn stream_pair() -> (GatewayStream, GatewayStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn dispatches_to_highest_common_version() {
        let fp = SecretIdentity::generate().fingerprint();
        let (a, b) = stream_pair();

        let mut old = Muxer::new("demo");
        old.register(1, Arc::new(|_fp, _dec, _enc| Box::pin(async { Ok(()) })));

        let mut new = Muxer::new("demo");
        let (tx, mut rx) = tokio::sync::oneshot::channel::<u64>();
        let tx = std::sync::Mutex::new(Some(tx));
        new.register(1, Arc::new(|_fp, _dec, _enc| Box::pin(async { Ok(()) })));
        new.register(
            2,
            Arc::new(move |_fp, _dec, _enc| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(2);
                }
                Box::pin(async move { Ok(()) })
            }),
        );

        // "old" peer only speaks v1, so v1 must win even though we have v2.
        let (r1, r2) = tokio::join!(old.serve(fp, a), new.serve(fp, b));
        r1.unwrap();
        r2.unwrap();
        assert!(rx.try_recv().is_err(), "v2 handler must not have run");
    }

    #[tokio::test]
    async fn wrong_protocol_is_refused() {
        let fp = SecretIdentity::generate().fingerprint();
        let (a, b) = stream_pair();
        let mut left = Muxer::new("demo");
        left.register(1, Arc::new(|_fp, _dec, _enc| Box::pin(async { Ok(()) })));
        let mut right = Muxer::new("omed");
        right.register(1, Arc::new(|_fp, _dec, _enc| Box::pin(async { Ok(()) })));
        let (r1, r2) = tokio::join!(left.serve(fp, a), right.serve(fp, b));
        assert!(matches!(r1, Err(Error::HandshakeProtocolMismatch { .. })));
        assert!(matches!(r2, Err(Error::HandshakeProtocolMismatch { .. })));
    }
}
