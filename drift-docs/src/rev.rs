use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use bytes::Bytes;
use drift_base::RevId;

/// Per-revision flag bits.
///
/// `LEAF`, `CONFLICT` and `PURGE` are maintained by the owning tree; the
/// others describe the revision itself and survive encoding (except `NEW`
/// and `PURGE`, which only exist in memory).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RevFlags(u8);

impl RevFlags {
    /// No flags set.
    pub const NONE: RevFlags = RevFlags(0);
    /// No other revision has this one as its parent.
    pub const LEAF: RevFlags = RevFlags(1 << 0);
    /// This revision is a deletion tombstone.
    pub const DELETED: RevFlags = RevFlags(1 << 1);
    /// The body references blobs in the blob store.
    pub const HAS_ATTACHMENTS: RevFlags = RevFlags(1 << 2);
    /// Inserted since the tree was last saved.
    pub const NEW: RevFlags = RevFlags(1 << 3);
    /// Keep the body even when this revision stops being a leaf.
    pub const KEEP_BODY: RevFlags = RevFlags(1 << 4);
    /// Brought in by replication rather than created locally.
    pub const FOREIGN: RevFlags = RevFlags(1 << 5);
    /// Member of a losing branch of a conflict.
    pub const CONFLICT: RevFlags = RevFlags(1 << 6);
    /// Scheduled for removal by the next compaction.
    pub const PURGE: RevFlags = RevFlags(1 << 7);

    /// The raw bit pattern.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct flags from stored bits.
    pub const fn from_bits(bits: u8) -> Self {
        RevFlags(bits)
    }

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: RevFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set in `self`.
    pub fn intersects(self, other: RevFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: RevFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: RevFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for RevFlags {
    type Output = RevFlags;
    fn bitor(self, rhs: RevFlags) -> RevFlags {
        RevFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for RevFlags {
    fn bitor_assign(&mut self, rhs: RevFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RevFlags {
    type Output = RevFlags;
    fn bitand(self, rhs: RevFlags) -> RevFlags {
        RevFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for RevFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(RevFlags, &str); 8] = [
            (RevFlags::LEAF, "LEAF"),
            (RevFlags::DELETED, "DELETED"),
            (RevFlags::HAS_ATTACHMENTS, "HAS_ATTACHMENTS"),
            (RevFlags::NEW, "NEW"),
            (RevFlags::KEEP_BODY, "KEEP_BODY"),
            (RevFlags::FOREIGN, "FOREIGN"),
            (RevFlags::CONFLICT, "CONFLICT"),
            (RevFlags::PURGE, "PURGE"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// One revision inside a [`RevTree`](crate::RevTree).
///
/// Revisions live in the tree's arena; `parent` is an index into that arena
/// rather than a reference, which is what lets the tree be an ordinary owned
/// value.
#[derive(Debug, Clone)]
pub struct Rev {
    pub(crate) rev_id: RevId,
    pub(crate) parent: Option<usize>,
    pub(crate) body: Option<Bytes>,
    pub(crate) sequence: u64,
    pub(crate) flags: RevFlags,
}

impl Rev {
    /// The revision's id.
    pub fn rev_id(&self) -> &RevId {
        &self.rev_id
    }

    /// Arena index of the parent revision, if any.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// The stored body. Elided for historical non-leaf revisions.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Sequence assigned when the owning document was saved; 0 if unsaved.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The flag bits.
    pub fn flags(&self) -> RevFlags {
        self.flags
    }

    /// Whether this revision has no children.
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevFlags::LEAF)
    }

    /// Whether this revision is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }

    /// Whether this revision sits on a losing conflict branch.
    pub fn is_conflict(&self) -> bool {
        self.flags.contains(RevFlags::CONFLICT)
    }

    /// Whether this revision was inserted since the last save.
    pub fn is_new(&self) -> bool {
        self.flags.contains(RevFlags::NEW)
    }

    /// Whether this revision arrived via replication.
    pub fn is_foreign(&self) -> bool {
        self.flags.contains(RevFlags::FOREIGN)
    }

    /// Whether the body is pinned even off the leaf.
    pub fn keeps_body(&self) -> bool {
        self.flags.contains(RevFlags::KEEP_BODY)
    }

    /// Whether the body references stored blobs.
    pub fn has_attachments(&self) -> bool {
        self.flags.contains(RevFlags::HAS_ATTACHMENTS)
    }

    /// A live head: a leaf that is not a tombstone.
    pub fn is_active(&self) -> bool {
        self.is_leaf() && !self.is_deleted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_ops() {
        let mut flags = RevFlags::LEAF | RevFlags::NEW;
        assert!(flags.contains(RevFlags::LEAF));
        assert!(!flags.contains(RevFlags::LEAF | RevFlags::DELETED));
        assert!(flags.intersects(RevFlags::LEAF | RevFlags::DELETED));
        flags.insert(RevFlags::DELETED);
        flags.remove(RevFlags::NEW);
        assert_eq!(flags, RevFlags::LEAF | RevFlags::DELETED);
        assert_eq!(format!("{flags:?}"), "LEAF|DELETED");
        assert_eq!(format!("{:?}", RevFlags::NONE), "NONE");
    }
}
