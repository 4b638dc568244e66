//! The stored byte form of a revision tree.
//!
//! A tree is a concatenation of per-revision records, in arena order, each a
//! postcard struct: varint-length-prefixed body bytes, varint-length-prefixed
//! revision id, varint parent link (0 for none, otherwise 1 + arena index),
//! varint sequence, and one flags byte. Encoding always happens on a sorted
//! tree, which makes the layout stable.

use bytes::Bytes;
use drift_base::{Error, Result, RevId};
use serde::{Deserialize, Serialize};

use crate::rev::{Rev, RevFlags};

// Bits that survive a save. NEW and PURGE are in-memory only.
const PERSISTED_FLAGS: RevFlags = RevFlags::from_bits(
    RevFlags::LEAF.bits()
        | RevFlags::DELETED.bits()
        | RevFlags::HAS_ATTACHMENTS.bits()
        | RevFlags::KEEP_BODY.bits()
        | RevFlags::FOREIGN.bits()
        | RevFlags::CONFLICT.bits(),
);

#[derive(Serialize, Deserialize)]
struct RawRev {
    body: Vec<u8>,
    rev_id: Vec<u8>,
    /// 0 = no parent, otherwise 1 + arena index.
    parent: u64,
    sequence: u64,
    flags: u8,
}

pub(crate) fn encode_tree(revs: &[Rev]) -> Result<Bytes> {
    let mut out = Vec::new();
    for rev in revs {
        let raw = RawRev {
            body: rev.body().map(|b| b.to_vec()).unwrap_or_default(),
            rev_id: rev.rev_id().to_string().into_bytes(),
            parent: rev.parent().map(|p| p as u64 + 1).unwrap_or(0),
            sequence: rev.sequence(),
            flags: (rev.flags() & PERSISTED_FLAGS).bits(),
        };
        out = postcard::to_extend(&raw, out)
            .map_err(|err| Error::Internal(format!("tree encode failed: {err}")))?;
    }
    Ok(out.into())
}

pub(crate) fn decode_tree(mut data: &[u8], sequence: u64) -> Result<Vec<Rev>> {
    let mut revs = Vec::new();
    while !data.is_empty() {
        let (raw, rest) =
            postcard::take_from_bytes::<RawRev>(data).map_err(|_| Error::CorruptData)?;
        data = rest;
        let rev_id: RevId = std::str::from_utf8(&raw.rev_id)
            .map_err(|_| Error::CorruptData)?
            .parse()
            .map_err(|_| Error::CorruptData)?;
        revs.push(Rev {
            rev_id,
            parent: match raw.parent {
                0 => None,
                p => Some(p as usize - 1),
            },
            body: (!raw.body.is_empty()).then(|| Bytes::from(raw.body)),
            sequence: if raw.sequence == 0 {
                sequence
            } else {
                raw.sequence
            },
            flags: RevFlags::from_bits(raw.flags) & PERSISTED_FLAGS,
        });
    }
    // Parent links must stay inside the arena.
    let len = revs.len();
    for rev in &revs {
        if let Some(p) = rev.parent {
            if p >= len {
                return Err(Error::CorruptData);
            }
        }
    }
    Ok(revs)
}
