//! The persistence contract the document layer runs on.
//!
//! The engine does not prescribe an on-disk format; any ordered key/value
//! store that can scan records by document id and by sequence can implement
//! [`Store`]. The bundled [`memory::MemStore`] keeps everything in
//! `BTreeMap`s and is what the tests run on.
//!
//! Mutations are atomic per call, and the [`actor`](crate::actor) serializes
//! every call through one mailbox, so an implementation never sees
//! concurrent access.

use bytes::Bytes;
use drift_base::{Result, RevId};

use crate::doc::{DocFlags, DocId, Record};

pub mod memory;

/// Ordered record storage for documents and replication metadata.
pub trait Store: Send + 'static {
    /// Fetch the record for a document id.
    fn get(&self, doc_id: &DocId) -> Result<Option<Record>>;

    /// Fetch the record currently holding `sequence`.
    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Record>>;

    /// Write (or replace) a document's record, assigning and returning the
    /// next sequence.
    fn put(
        &mut self,
        doc_id: &DocId,
        raw_tree: Bytes,
        rev_id: Option<RevId>,
        flags: DocFlags,
    ) -> Result<u64>;

    /// The highest sequence ever assigned.
    fn last_sequence(&self) -> u64;

    /// Records with `sequence > since`, in sequence order, at most `limit`.
    fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<Record>>;

    /// All records in document-id order.
    fn all_docs(&self) -> Result<Vec<Record>>;

    /// Read a named metadata blob (checkpoints and the like).
    fn get_meta(&self, name: &str) -> Result<Option<Bytes>>;

    /// Write a named metadata blob.
    fn put_meta(&mut self, name: &str, value: Bytes) -> Result<()>;
}
