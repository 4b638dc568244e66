//! Wire frames and message payloads.
//!
//! Every frame is a length-prefixed postcard value: a 4-byte big-endian
//! length followed by the encoded [`Frame`]. A frame is either a request,
//! carrying a [`Profile`] plus short ASCII properties and an opaque body, or
//! a response echoing the request id with an optional structured error.
//! Request bodies are postcard payloads; the checkpoint body is JSON, which
//! is part of the external contract.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use drift_base::{Domain, Error, Result};
use drift_docs::{DocId, RevId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Frames above this size indicate a broken or hostile peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The request kinds of the replication protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum Profile {
    /// Ask the peer to start streaming change notifications.
    #[display("subChanges")]
    SubChanges,
    /// Offer a batch of changes; the reply says which to send.
    #[display("changes")]
    Changes,
    /// Deliver one revision with its history.
    #[display("rev")]
    Rev,
    /// Read a named checkpoint blob.
    #[display("getCheckpoint")]
    GetCheckpoint,
    /// Write a named checkpoint blob.
    #[display("setCheckpoint")]
    SetCheckpoint,
}

/// Short ASCII key=value pairs attached to a frame.
pub type Properties = Vec<(String, String)>;

/// Look up a property by key.
pub fn property<'a>(properties: &'a Properties, key: &str) -> Option<&'a str> {
    properties
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// A `(domain, code, message)` failure as it travels the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Error domain.
    pub domain: Domain,
    /// Numeric code within the domain.
    pub code: u32,
    /// Human-readable description. Not stable.
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        let (domain, code) = err.domain_code();
        WireError {
            domain,
            code,
            message: err.to_string(),
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::from_wire(err.domain, err.code, err.message)
    }
}

/// One frame of the replication protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// A request; expects exactly one response with the same id.
    Request {
        /// Sender-scoped request number.
        id: u64,
        /// What is being asked.
        profile: Profile,
        /// Frame properties.
        properties: Properties,
        /// Opaque payload.
        body: Bytes,
    },
    /// The response to a request.
    Response {
        /// Id of the request being answered.
        id: u64,
        /// Present when the request failed.
        error: Option<WireError>,
        /// Frame properties.
        properties: Properties,
        /// Opaque payload.
        body: Bytes,
    },
}

/// Length-prefixed postcard codec for [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> anyhow::Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let bytes: [u8; 4] = src[..4].try_into().expect("checked length");
        let frame_len = u32::from_be_bytes(bytes) as usize;
        anyhow::ensure!(
            frame_len <= MAX_FRAME_SIZE,
            "received frame that is too large: {frame_len}"
        );
        if src.len() < 4 + frame_len {
            return Ok(None);
        }
        let frame: Frame = postcard::from_bytes(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> anyhow::Result<()> {
        let encoded = postcard::to_stdvec(&item)?;
        anyhow::ensure!(
            encoded.len() <= MAX_FRAME_SIZE,
            "attempted to send frame that is too large: {}",
            encoded.len()
        );
        dst.reserve(4 + encoded.len());
        dst.put_u32(u32::try_from(encoded.len()).expect("already checked"));
        dst.put_slice(&encoded);
        Ok(())
    }
}

/// One entry of a `changes` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// The sender's sequence for this change.
    pub sequence: u64,
    /// The document that changed.
    pub doc_id: DocId,
    /// Its winning revision.
    pub rev_id: RevId,
    /// Whether that revision is a tombstone.
    pub deleted: bool,
}

/// The receiver's verdict on one offered change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeAnswer {
    /// Already known; do not send.
    Skip,
    /// Unknown; send it, truncating history at any of these ancestors.
    Send {
        /// Revisions the receiver already has for this document.
        ancestors: Vec<RevId>,
    },
}

/// Body of a `rev` request: one revision and its ancestry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevMessage {
    /// Target document.
    pub doc_id: DocId,
    /// Tombstone flag.
    pub deleted: bool,
    /// Whether the body references stored blobs.
    pub has_attachments: bool,
    /// The revision id followed by its ancestors, newest first.
    pub history: Vec<RevId>,
    /// The revision body.
    pub body: Bytes,
}

impl RevMessage {
    /// The id of the revision being delivered.
    pub fn rev_id(&self) -> Option<&RevId> {
        self.history.first()
    }
}

/// The durable record of replication progress in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last fully pushed local sequence.
    pub local: u64,
    /// Last fully pulled remote sequence.
    pub remote: u64,
}

impl Checkpoint {
    /// Encode as the JSON object stored under the checkpoint key.
    pub fn to_json(&self) -> Bytes {
        serde_json::to_vec(self)
            .expect("checkpoint serialization is infallible")
            .into()
    }

    /// Decode from the stored JSON object.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|_| Error::CorruptData)
    }
}

/// Encode a postcard request body.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Bytes> {
    postcard::to_stdvec(value)
        .map(Bytes::from)
        .map_err(|err| Error::Internal(format!("body encode failed: {err}")))
}

/// Decode a postcard request body. Undecodable bodies are a peer bug.
pub fn decode_body<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    postcard::from_bytes(data).map_err(|_| Error::CorruptData)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();

        let frame = Frame::Request {
            id: 42,
            profile: Profile::Changes,
            properties: vec![("since".into(), "7".into())],
            body: Bytes::from_static(b"payload"),
        };
        codec.encode(frame, &mut buf).unwrap();

        // A partial frame decodes to nothing and consumes nothing.
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), buf.len() - 1);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Frame::Request {
                id,
                profile,
                properties,
                body,
            } => {
                assert_eq!(id, 42);
                assert_eq!(profile, Profile::Changes);
                assert_eq!(property(&properties, "since"), Some("7"));
                assert_eq!(body.as_ref(), b"payload");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        buf.put_slice(b"garbage");
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn change_bodies_roundtrip() {
        let entries = vec![ChangeEntry {
            sequence: 9,
            doc_id: "doc-1".parse().unwrap(),
            rev_id: "1-abc".parse().unwrap(),
            deleted: false,
        }];
        let body = encode_body(&entries).unwrap();
        let decoded: Vec<ChangeEntry> = decode_body(&body).unwrap();
        assert_eq!(decoded, entries);

        let answers = vec![
            ChangeAnswer::Skip,
            ChangeAnswer::Send {
                ancestors: vec!["1-abc".parse().unwrap()],
            },
        ];
        let body = encode_body(&answers).unwrap();
        let decoded: Vec<ChangeAnswer> = decode_body(&body).unwrap();
        assert_eq!(decoded, answers);

        assert!(matches!(
            decode_body::<Vec<ChangeEntry>>(b"\xff\xff\xff"),
            Err(Error::CorruptData)
        ));
    }

    #[test]
    fn checkpoint_json_shape() {
        let checkpoint = Checkpoint {
            local: 100,
            remote: 3,
        };
        let json = checkpoint.to_json();
        assert_eq!(json.as_ref(), br#"{"local":100,"remote":3}"#);
        assert_eq!(Checkpoint::from_json(&json).unwrap(), checkpoint);
        assert!(Checkpoint::from_json(b"not json").is_err());
    }

    #[test]
    fn wire_error_conversion() {
        let wire = WireError::from(&Error::Conflict);
        assert_eq!(wire.domain, Domain::Database);
        let back: Error = wire.into();
        assert!(matches!(back, Error::Conflict));
    }
}
