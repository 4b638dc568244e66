use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use drift_base::{Error, Result, RevId};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::store::Store;
use crate::tree::RevTree;

// Longer ids tend to be misuse (a body smuggled into the key).
const MAX_DOC_ID_LEN: usize = 240;

/// A validated document identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocId(String);

impl DocId {
    /// Validate and wrap a document id. Empty and oversized ids are refused.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_DOC_ID_LEN {
            return Err(Error::BadDocId);
        }
        Ok(DocId(id))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}

impl FromStr for DocId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocId::new(s)
    }
}

impl Serialize for DocId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DocId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DocId::new(s).map_err(de::Error::custom)
    }
}

/// Document-level summary flags, derived from the revision tree on save.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DocFlags(u8);

impl DocFlags {
    /// No flags.
    pub const NONE: DocFlags = DocFlags(0);
    /// A record exists for this document.
    pub const EXISTS: DocFlags = DocFlags(1 << 0);
    /// The winning revision is a tombstone.
    pub const DELETED: DocFlags = DocFlags(1 << 1);
    /// Two or more active leaves coexist.
    pub const CONFLICTED: DocFlags = DocFlags(1 << 2);
    /// Some leaf references stored blobs.
    pub const HAS_ATTACHMENTS: DocFlags = DocFlags(1 << 3);

    /// The raw bit pattern.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct from stored bits.
    pub const fn from_bits(bits: u8) -> Self {
        DocFlags(bits)
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: DocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: DocFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for DocFlags {
    type Output = DocFlags;
    fn bitor(self, rhs: DocFlags) -> DocFlags {
        DocFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for DocFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(DocFlags, &str); 4] = [
            (DocFlags::EXISTS, "EXISTS"),
            (DocFlags::DELETED, "DELETED"),
            (DocFlags::CONFLICTED, "CONFLICTED"),
            (DocFlags::HAS_ATTACHMENTS, "HAS_ATTACHMENTS"),
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

/// The durable form of a document: what the key/value store holds.
#[derive(Debug, Clone)]
pub struct Record {
    /// The document id, the primary key.
    pub doc_id: DocId,
    /// The encoded revision tree.
    pub raw_tree: Bytes,
    /// Winning revision id at save time, readable without decoding the tree.
    pub rev_id: Option<RevId>,
    /// Summary flags at save time.
    pub flags: DocFlags,
    /// Sequence assigned by the store, strictly positive once saved.
    pub sequence: u64,
}

/// A document: a revision tree bound to its durable record.
///
/// A document can be loaded metadata-only, in which case the tree is an
/// [unloaded](RevTree::is_unknown) placeholder and
/// [`ensure_loaded`](Self::ensure_loaded) fetches the record on demand.
#[derive(Debug, Clone)]
pub struct Document {
    id: DocId,
    tree: RevTree,
    sequence: u64,
    // Valid while the tree is unloaded.
    meta_rev_id: Option<RevId>,
    meta_flags: DocFlags,
}

impl Document {
    /// A new, never-saved document.
    pub fn new(id: DocId) -> Self {
        Document {
            id,
            tree: RevTree::new(),
            sequence: 0,
            meta_rev_id: None,
            meta_flags: DocFlags::NONE,
        }
    }

    /// Materialize a document from its stored record.
    pub fn from_record(record: &Record) -> Result<Self> {
        Ok(Document {
            id: record.doc_id.clone(),
            tree: RevTree::decode(&record.raw_tree, record.sequence)?,
            sequence: record.sequence,
            meta_rev_id: record.rev_id.clone(),
            meta_flags: record.flags,
        })
    }

    /// Wrap a record without decoding the tree.
    pub fn from_record_meta(record: &Record) -> Self {
        Document {
            id: record.doc_id.clone(),
            tree: RevTree::unloaded(),
            sequence: record.sequence,
            meta_rev_id: record.rev_id.clone(),
            meta_flags: record.flags,
        }
    }

    /// Load a document by id; `None` when no record exists.
    pub fn load<S: Store + ?Sized>(store: &S, id: &DocId) -> Result<Option<Self>> {
        match store.get(id)? {
            Some(record) => Ok(Some(Self::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// The document id.
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Sequence of the last save, or 0 when unsaved.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The revision tree. Placeholder until
    /// [`ensure_loaded`](Self::ensure_loaded) runs on a metadata-only load.
    pub fn tree(&self) -> &RevTree {
        &self.tree
    }

    /// Mutable access to the revision tree.
    pub fn tree_mut(&mut self) -> &mut RevTree {
        debug_assert!(!self.tree.is_unknown());
        &mut self.tree
    }

    /// Decode the tree from the store if this was a metadata-only load.
    pub fn ensure_loaded<S: Store + ?Sized>(&mut self, store: &S) -> Result<()> {
        if !self.tree.is_unknown() {
            return Ok(());
        }
        let record = store.get(&self.id)?.ok_or(Error::NotFound)?;
        self.tree = RevTree::decode(&record.raw_tree, record.sequence)?;
        self.sequence = record.sequence;
        Ok(())
    }

    /// The current winning revision id.
    pub fn rev_id(&mut self) -> Option<RevId> {
        if self.tree.is_unknown() {
            self.meta_rev_id.clone()
        } else {
            self.tree.current().map(|rev| rev.rev_id().clone())
        }
    }

    /// The document-level flag summary.
    pub fn flags(&mut self) -> DocFlags {
        if self.tree.is_unknown() {
            return self.meta_flags;
        }
        if self.tree.is_empty() {
            return DocFlags::NONE;
        }
        let mut flags = DocFlags::EXISTS;
        if self.tree.has_conflict() {
            flags.insert(DocFlags::CONFLICTED);
        }
        if self
            .tree
            .leaves()
            .any(|rev| rev.has_attachments())
        {
            flags.insert(DocFlags::HAS_ATTACHMENTS);
        }
        if self.tree.current().is_some_and(|rev| rev.is_deleted()) {
            flags.insert(DocFlags::DELETED);
        }
        flags
    }

    /// Persist the document if its tree changed since the last save.
    ///
    /// Returns the newly assigned sequence, or `None` when there was nothing
    /// to write.
    pub fn save<S: Store + ?Sized>(&mut self, store: &mut S) -> Result<Option<u64>> {
        if !self.tree.is_changed() {
            return Ok(None);
        }
        let raw_tree = self.tree.encode()?;
        let flags = self.flags();
        let rev_id = self.tree.current().map(|rev| rev.rev_id().clone());
        let sequence = store.put(&self.id, raw_tree, rev_id, flags)?;
        self.tree.saved(sequence);
        self.tree.clear_changed();
        self.sequence = sequence;
        self.meta_flags = flags;
        Ok(Some(sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rev::RevFlags;
    use crate::store::memory::MemStore;

    fn id(s: &str) -> RevId {
        s.parse().unwrap()
    }

    #[test]
    fn doc_id_validation() {
        assert!(DocId::new("doc-1").is_ok());
        assert!(matches!(DocId::new(""), Err(Error::BadDocId)));
        assert!(matches!(DocId::new("x".repeat(241)), Err(Error::BadDocId)));
    }

    #[test]
    fn save_and_reload() {
        let mut store = MemStore::default();
        let doc_id = DocId::new("doc-1").unwrap();

        let mut doc = Document::new(doc_id.clone());
        doc.tree_mut()
            .insert(id("1-aaa"), Some("{}".into()), RevFlags::NONE, None, false)
            .unwrap();
        let seq = doc.save(&mut store).unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(doc.sequence(), 1);
        // Unchanged: second save writes nothing.
        assert_eq!(doc.save(&mut store).unwrap(), None);

        let mut loaded = Document::load(&store, &doc_id).unwrap().unwrap();
        assert_eq!(loaded.rev_id(), Some(id("1-aaa")));
        assert!(loaded.flags().contains(DocFlags::EXISTS));
        assert_eq!(loaded.tree().get(&id("1-aaa")).unwrap().sequence(), 1);
    }

    #[test]
    fn lazy_load() {
        let mut store = MemStore::default();
        let doc_id = DocId::new("doc-1").unwrap();
        let mut doc = Document::new(doc_id.clone());
        doc.tree_mut()
            .insert(id("1-aaa"), Some("{}".into()), RevFlags::NONE, None, false)
            .unwrap();
        doc.save(&mut store).unwrap();

        let record = store.get(&doc_id).unwrap().unwrap();
        let mut meta = Document::from_record_meta(&record);
        assert!(meta.tree().is_unknown());
        assert_eq!(meta.rev_id(), Some(id("1-aaa")));
        assert!(meta.flags().contains(DocFlags::EXISTS));

        meta.ensure_loaded(&store).unwrap();
        assert!(!meta.tree().is_unknown());
        assert!(meta.tree().get(&id("1-aaa")).unwrap().body().is_some());
    }

    #[test]
    fn tombstone_flags() {
        let mut store = MemStore::default();
        let mut doc = Document::new(DocId::new("doc-1").unwrap());
        doc.tree_mut()
            .insert(id("1-aaa"), Some("{}".into()), RevFlags::NONE, None, false)
            .unwrap();
        doc.tree_mut()
            .insert(
                id("2-bbb"),
                None,
                RevFlags::DELETED,
                Some(&id("1-aaa")),
                false,
            )
            .unwrap();
        doc.save(&mut store).unwrap();
        assert!(doc.flags().contains(DocFlags::EXISTS | DocFlags::DELETED));
    }
}
