//! Parsed revision identifiers.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::Error;

/// Which syntax a revision id was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RevForm {
    /// Classic tree form, `<generation>-<digest>`.
    Tree,
    /// Version-vector form, `<counter>@<peer-id>`.
    Version,
}

impl RevForm {
    fn separator(self) -> char {
        match self {
            RevForm::Tree => '-',
            RevForm::Version => '@',
        }
    }
}

/// A revision identifier, parsed once into a generation and an opaque tail.
///
/// The generation is always positive; an absent revision id is represented as
/// `Option::<RevId>::None`, never as a zero generation. Ids order by
/// generation first, then bytewise on the tail, which makes the id ordering
/// usable as the final tiebreak when picking a winning revision.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RevId {
    gen: u64,
    tail: Bytes,
    form: RevForm,
}

impl RevId {
    /// The generation number (depth in the revision tree, or the vector
    /// counter for version-style ids).
    pub fn gen(&self) -> u64 {
        self.gen
    }

    /// The opaque digest or peer-id portion.
    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    /// The syntax this id uses.
    pub fn form(&self) -> RevForm {
        self.form
    }

    /// Derive the id of a new revision created on top of `parent`.
    ///
    /// The tail is the SHA-1 (hex) of the parent id, the deletion flag and
    /// the body, so identical edits on identical parents produce identical
    /// ids on every node.
    pub fn derive(parent: Option<&RevId>, deleted: bool, body: &[u8]) -> RevId {
        let mut sha1 = Sha1::new();
        if let Some(parent) = parent {
            sha1.update(parent.to_string().as_bytes());
        }
        sha1.update([deleted as u8]);
        sha1.update(body);
        let tail = hex::encode(sha1.finalize());
        RevId {
            gen: parent.map(|p| p.gen + 1).unwrap_or(1),
            tail: Bytes::from(tail.into_bytes()),
            form: RevForm::Tree,
        }
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.gen
            .cmp(&other.gen)
            .then_with(|| self.tail.cmp(&other.tail))
            .then_with(|| self.form.cmp(&other.form))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.gen,
            self.form.separator(),
            // Tails come from parsed UTF-8 input or hex digests.
            String::from_utf8_lossy(&self.tail)
        )
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({self})")
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sep, form) = match (s.find('-'), s.find('@')) {
            (Some(d), Some(a)) if d < a => (d, RevForm::Tree),
            (Some(_), Some(a)) => (a, RevForm::Version),
            (Some(d), None) => (d, RevForm::Tree),
            (None, Some(a)) => (a, RevForm::Version),
            (None, None) => return Err(Error::BadRevId),
        };
        let (gen_str, tail) = (&s[..sep], &s[sep + 1..]);
        if tail.is_empty() {
            return Err(Error::BadRevId);
        }
        let gen: u64 = gen_str.parse().map_err(|_| Error::BadRevId)?;
        if gen == 0 {
            return Err(Error::BadRevId);
        }
        Ok(RevId {
            gen,
            tail: Bytes::copy_from_slice(tail.as_bytes()),
            form,
        })
    }
}

impl Serialize for RevId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RevId {
        s.parse().unwrap()
    }

    #[test]
    fn parse_tree_form() {
        let rev = id("12-f00dcafe");
        assert_eq!(rev.gen(), 12);
        assert_eq!(rev.tail(), b"f00dcafe");
        assert_eq!(rev.form(), RevForm::Tree);
        assert_eq!(rev.to_string(), "12-f00dcafe");
    }

    #[test]
    fn parse_version_form() {
        let rev = id("7@bob");
        assert_eq!(rev.gen(), 7);
        assert_eq!(rev.form(), RevForm::Version);
        assert_eq!(rev.to_string(), "7@bob");
    }

    #[test]
    fn reject_malformed() {
        for bad in [
            "",
            "frog",
            "-abc",
            "1-",
            "0-abc",
            "x-abc",
            "@peer",
            "123456789012345678901234567890-abc",
        ] {
            assert!(
                matches!(bad.parse::<RevId>(), Err(Error::BadRevId)),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn ordering() {
        assert!(id("2-aaa") > id("1-zzz"));
        assert!(id("2-bbb") > id("2-aaa"));
        assert!(id("10-aaa") > id("9-zzz"));
    }

    #[test]
    fn derive_increments_generation() {
        let root = RevId::derive(None, false, b"{}");
        assert_eq!(root.gen(), 1);
        let child = RevId::derive(Some(&root), false, b"{\"a\":1}");
        assert_eq!(child.gen(), 2);
        let again = RevId::derive(Some(&root), false, b"{\"a\":1}");
        assert_eq!(child, again);
        let other = RevId::derive(Some(&root), true, b"{\"a\":1}");
        assert_ne!(child, other);
    }

    #[test]
    fn serde_as_string() {
        let rev = id("3-cafe");
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"3-cafe\"");
        let ser = postcard::to_stdvec(&rev).unwrap();
        let de: RevId = postcard::from_bytes(&ser).unwrap();
        assert_eq!(de, rev);
    }
}
