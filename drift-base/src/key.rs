//! The SHA-1 content key used by the blob store.

use std::fmt;
use std::str::FromStr;

use postcard::experimental::max_size::MaxSize;
use serde::{
    de::{self, SeqAccess},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};
use sha1::{Digest, Sha1};

use crate::error::Error;

const KEY_LEN: usize = 20;
const PREFIX: &str = "sha1-";
/// Base64 of 20 bytes, including the trailing `=` pad.
const BASE64_LEN: usize = 28;
const EXTENSION: &str = ".blob";

/// The raw SHA-1 digest identifying a blob.
///
/// The canonical string form is `sha1-<base64>`; the on-disk filename form is
/// `<base64url><ext>` so the key survives being a path component.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct BlobKey([u8; KEY_LEN]);

impl BlobKey {
    /// Digest `data` into its key.
    pub fn compute(data: impl AsRef<[u8]>) -> Self {
        let mut sha1 = Sha1::new();
        sha1.update(data.as_ref());
        BlobKey(sha1.finalize().into())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Build a key from raw digest bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The digest as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The file name this blob occupies inside a store directory.
    pub fn filename(&self) -> String {
        let mut name = data_encoding::BASE64URL.encode(&self.0);
        name.push_str(EXTENSION);
        name
    }

    /// Parse a store file name back into its key.
    pub fn from_filename(name: &str) -> Result<Self, Error> {
        let encoded = name.strip_suffix(EXTENSION).ok_or(Error::BadBlobKey)?;
        decode_base64(&data_encoding::BASE64URL, encoded)
    }
}

fn decode_base64(encoding: &data_encoding::Encoding, s: &str) -> Result<BlobKey, Error> {
    if s.len() != BASE64_LEN {
        return Err(Error::BadBlobKey);
    }
    let decoded = encoding
        .decode(s.as_bytes())
        .map_err(|_| Error::BadBlobKey)?;
    let bytes: [u8; KEY_LEN] = decoded.try_into().map_err(|_| Error::BadBlobKey)?;
    Ok(BlobKey(bytes))
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", data_encoding::BASE64.encode(&self.0))
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlobKey").field(&self.to_string()).finish()
    }
}

impl FromStr for BlobKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.strip_prefix(PREFIX).ok_or(Error::BadBlobKey)?;
        decode_base64(&data_encoding::BASE64, encoded)
    }
}

impl AsRef<[u8]> for BlobKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for BlobKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            let mut s = serializer.serialize_tuple(KEY_LEN)?;
            for item in &self.0 {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for BlobKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(KEY_LEN, KeyVisitor)
        }
    }
}

struct KeyVisitor;

impl<'de> de::Visitor<'de> for KeyVisitor {
    type Value = BlobKey;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of 20 bytes containing a SHA-1 digest")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut arr = [0u8; KEY_LEN];
        for (i, slot) in arr.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(BlobKey(arr))
    }
}

impl MaxSize for BlobKey {
    const POSTCARD_MAX_SIZE: usize = KEY_LEN;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let key: BlobKey = "sha1-VVVVVVVVVVVVVVVVVVVVVVVVVVU=".parse().unwrap();
        assert_eq!(key.to_string(), "sha1-VVVVVVVVVVVVVVVVVVVVVVVVVVU=");
    }

    #[test]
    fn reject_malformed() {
        for bad in [
            "",
            "rot13-xxxx",
            "sha1-",
            "sha1-VVVVVVVVVVVVVVVVVVVVVV",
            "sha1-VVVVVVVVVVVVVVVVVVVVVVVVVVVVVVU",
        ] {
            assert!(
                matches!(bad.parse::<BlobKey>(), Err(Error::BadBlobKey)),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn compute_known_digest() {
        let key = BlobKey::compute("This is a blob to store in the store!");
        assert_eq!(key.to_string(), "sha1-QneWo5IYIQ0ZrbCG0hXPGC6jy7E=");
        assert_eq!(key.filename(), "QneWo5IYIQ0ZrbCG0hXPGC6jy7E=.blob");
    }

    #[test]
    fn filename_roundtrip() {
        let key = BlobKey::compute(b"some content");
        let parsed = BlobKey::from_filename(&key.filename()).unwrap();
        assert_eq!(parsed, key);
        assert!(BlobKey::from_filename("incoming_12ab.tmp").is_err());
    }

    #[test]
    fn postcard_is_raw_bytes() {
        let key = BlobKey::compute(b"x");
        let ser = postcard::to_stdvec(&key).unwrap();
        assert_eq!(ser.len(), 20);
        let de: BlobKey = postcard::from_bytes(&ser).unwrap();
        assert_eq!(de, key);
    }

    #[test]
    fn json_is_string() {
        let key = BlobKey::compute(b"x");
        let ser = serde_json::to_string(&key).unwrap();
        assert!(ser.starts_with("\"sha1-"));
        let de: BlobKey = serde_json::from_str(&ser).unwrap();
        assert_eq!(de, key);
    }
}
