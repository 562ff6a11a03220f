//! Length-delimited CBOR record framing.
//!
//! Every record on the wire is a 4-byte big-endian length followed by one
//! self-describing CBOR value. The reader and writer each own one
//! direction of a stream, so one task may send while another receives on
//! the same connection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::{Error, Result};

/// Upper bound on a single record, enough for a full-size avatar image
/// with framing to spare.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// The writing half of a record stream.
pub struct RecordWriter<W> {
    /// The underlying byte sink.
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> RecordWriter<W> {
    /// Wrap a byte sink in a record writer.
    pub fn new(inner: W) -> Self {
        RecordWriter { inner }
    }

    /// Encode `record` and send it as one frame.
    pub async fn send<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut body = Vec::new();
        ciborium::into_writer(record, &mut body).map_err(|e| Error::Encode(Arc::new(e)))?;
        if body.len() > MAX_RECORD_LEN {
            return Err(Error::TooLarge(body.len()));
        }
        let len = u32::try_from(body.len()).map_err(|_| Error::TooLarge(body.len()))?;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Recover the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// The reading half of a record stream.
pub struct RecordReader<R> {
    /// The underlying byte source.
    inner: R,
}

impl<R: AsyncRead + Unpin + Send> RecordReader<R> {
    /// Wrap a byte source in a record reader.
    pub fn new(inner: R) -> Self {
        RecordReader { inner }
    }

    /// Receive one frame and decode it as a `T`.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut len = [0_u8; 4];
        self.inner.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_RECORD_LEN {
            return Err(Error::TooLarge(len));
        }
        let mut body = vec![0_u8; len];
        self.inner.read_exact(&mut body).await?;
        ciborium::from_reader(&body[..]).map_err(|e| Error::Decode(Arc::new(e)))
    }

    /// Recover the underlying source.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// The decoder half of a peer connection, as handed to protocol handlers.
pub type Decoder = RecordReader<tokio::io::ReadHalf<mesh_gateway::GatewayStream>>;

/// The encoder half of a peer connection, as handed to protocol handlers.
pub type Encoder = RecordWriter<tokio::io::WriteHalf<mesh_gateway::GatewayStream>>;

/// Split a peer stream into a decoder/encoder pair.
///
/// Protocol clients use this directly; servers get their halves from the
/// [`Muxer`](crate::Muxer).
pub fn split(stream: mesh_gateway::GatewayStream) -> (Decoder, Encoder) {
    let (r, w) = tokio::io::split(stream);
    (RecordReader::new(r), RecordWriter::new(w))
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use serde::Deserialize;
    use serde_with::{serde_as, Bytes};
    use std::collections::BTreeMap;

    #[serde_as]
    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Everything {
        int: u64,
        #[serde_as(as = "Bytes")]
        fixed: [u8; 32],
        #[serde_as(as = "Bytes")]
        blob: Vec<u8>,
        text: String,
        map: BTreeMap<String, u64>,
        set: Vec<String>,
        when: crate::Timestamp,
        maybe: Option<String>,
    }

    #[tokio::test]
    async fn roundtrip_all_wire_types() {
        let value = Everything {
            int: u64::MAX,
            fixed: [7; 32],
            blob: vec![1, 2, 3],
            text: "snälla".into(),
            map: [("a".to_string(), 1_u64)].into_iter().collect(),
            set: vec!["x".into(), "y".into()],
            when: crate::Timestamp::from_nanos(1_234_567_890_123_456_789),
            maybe: None,
        };
        let (client, server) = tokio::io::duplex(1024);
        let mut w = RecordWriter::new(client);
        let mut r = RecordReader::new(server);
        w.send(&value).await.unwrap();
        let back: Everything = r.recv().await.unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn unknown_fields_tolerated() {
        #[derive(Serialize)]
        struct V2 {
            name: String,
            novelty: u64,
        }
        #[derive(Deserialize)]
        struct V1 {
            name: String,
        }
        let (client, server) = tokio::io::duplex(1024);
        let mut w = RecordWriter::new(client);
        let mut r = RecordReader::new(server);
        w.send(&V2 {
            name: "n".into(),
            novelty: 9,
        })
        .await
        .unwrap();
        let v1: V1 = r.recv().await.unwrap();
        assert_eq!(v1.name, "n");
    }

    #[tokio::test]
    async fn oversized_record_refused() {
        let (client, server) = tokio::io::duplex(64);
        let mut w = RecordWriter::new(client);
        drop(server);
        #[derive(Serialize)]
        struct Big {
            blob: Vec<u8>,
        }
        let huge = Big {
            blob: vec![0; MAX_RECORD_LEN + 1],
        };
        assert!(matches!(w.send(&huge).await, Err(Error::TooLarge(_))));
    }

    #[tokio::test]
    async fn lying_length_prefix_refused() {
        let (mut client, server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &u32::MAX.to_be_bytes())
            .await
            .unwrap();
        let mut r = RecordReader::new(server);
        let got: Result<u64> = r.recv().await;
        assert!(matches!(got, Err(Error::TooLarge(_))));
    }
}
