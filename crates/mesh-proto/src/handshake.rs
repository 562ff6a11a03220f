//! The version-negotiation handshake.
//!
//! The first record on any connection, in both directions concurrently, is
//! a [`Handshake`] naming the protocol and the versions the sender can
//! speak. Both sides then settle on the greatest common version, or drop
//! the connection if there is none.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::record::{RecordReader, RecordWriter};
use crate::{Error, Result};

/// Deadline for the whole exchange, both directions included.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// The version-negotiation record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Handshake {
    /// Name of the protocol the sender wants to run.
    pub protocol: String,
    /// Every version of it the sender can speak.
    pub versions: Vec<u64>,
}

/// Run the negotiation: send our handshake while receiving the peer's,
/// then agree on the greatest common version.
pub async fn negotiate<R, W>(
    decoder: &mut RecordReader<R>,
    encoder: &mut RecordWriter<W>,
    protocol: &str,
    versions: &[u64],
) -> Result<u64>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let ours = Handshake {
        protocol: protocol.to_owned(),
        versions: versions.to_vec(),
    };
    let ((), theirs) = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        tokio::try_join!(encoder.send(&ours), decoder.recv::<Handshake>())
    })
    .await
    .map_err(|_| Error::HandshakeTimeout)??;

    if theirs.protocol != protocol {
        return Err(Error::HandshakeProtocolMismatch {
            ours: protocol.to_owned(),
            theirs: theirs.protocol,
        });
    }
    let agreed = versions
        .iter()
        .filter(|v| theirs.versions.contains(v))
        .max()
        .copied()
        .ok_or_else(|| Error::NoCommonVersion(protocol.to_owned()))?;
    trace!(protocol, version = agreed, "protocol negotiated");
    Ok(agreed)
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;

    /// Run `negotiate` on both ends of a duplex pipe.
    async fn run(
        ours: (&'static str, Vec<u64>),
        theirs: (&'static str, Vec<u64>),
    ) -> (Result<u64>, Result<u64>) {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut a_dec = RecordReader::new(ar);
        let mut a_enc = RecordWriter::new(aw);
        let mut b_dec = RecordReader::new(br);
        let mut b_enc = RecordWriter::new(bw);
        tokio::join!(
            negotiate(&mut a_dec, &mut a_enc, ours.0, &ours.1),
            negotiate(&mut b_dec, &mut b_enc, theirs.0, &theirs.1),
        )
    }

    #[tokio::test]
    async fn greatest_common_version_wins() {
        let (a, b) = run(("contact", vec![1, 2, 3]), ("contact", vec![2, 3, 7])).await;
        assert_eq!(a.unwrap(), 3);
        assert_eq!(b.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_intersection_disconnects() {
        let (a, b) = run(("contact", vec![1]), ("contact", vec![2])).await;
        assert!(matches!(a, Err(Error::NoCommonVersion(_))));
        assert!(matches!(b, Err(Error::NoCommonVersion(_))));
    }

    #[tokio::test]
    async fn protocol_mismatch_disconnects() {
        let (a, _b) = run(("contact", vec![1]), ("event", vec![1])).await;
        assert!(matches!(a, Err(Error::HandshakeProtocolMismatch { .. })));
    }

    #[tokio::test]
    async fn silence_times_out() {
        tokio::time::pause();
        let (a, _b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let mut dec = RecordReader::new(ar);
        let mut enc = RecordWriter::new(aw);
        let result = negotiate(&mut dec, &mut enc, "contact", &[1]).await;
        assert!(matches!(result, Err(Error::HandshakeTimeout)));
    }
}
