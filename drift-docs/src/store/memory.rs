//! In-memory [`Store`] implementation.

use std::collections::BTreeMap;

use bytes::Bytes;
use drift_base::{Result, RevId};

use crate::doc::{DocFlags, DocId, Record};
use crate::store::Store;

/// A [`Store`] backed by ordered maps. The default store for tests and for
/// ephemeral databases.
#[derive(Debug, Default)]
pub struct MemStore {
    docs: BTreeMap<DocId, Record>,
    by_sequence: BTreeMap<u64, DocId>,
    meta: BTreeMap<String, Bytes>,
    last_sequence: u64,
}

impl Store for MemStore {
    fn get(&self, doc_id: &DocId) -> Result<Option<Record>> {
        Ok(self.docs.get(doc_id).cloned())
    }

    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Record>> {
        Ok(self
            .by_sequence
            .get(&sequence)
            .and_then(|id| self.docs.get(id))
            .cloned())
    }

    fn put(
        &mut self,
        doc_id: &DocId,
        raw_tree: Bytes,
        rev_id: Option<RevId>,
        flags: DocFlags,
    ) -> Result<u64> {
        if let Some(old) = self.docs.get(doc_id) {
            self.by_sequence.remove(&old.sequence);
        }
        self.last_sequence += 1;
        let sequence = self.last_sequence;
        self.docs.insert(
            doc_id.clone(),
            Record {
                doc_id: doc_id.clone(),
                raw_tree,
                rev_id,
                flags,
                sequence,
            },
        );
        self.by_sequence.insert(sequence, doc_id.clone());
        Ok(sequence)
    }

    fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<Record>> {
        Ok(self
            .by_sequence
            .range(since + 1..)
            .take(limit)
            .filter_map(|(_, id)| self.docs.get(id))
            .cloned()
            .collect())
    }

    fn all_docs(&self) -> Result<Vec<Record>> {
        Ok(self.docs.values().cloned().collect())
    }

    fn get_meta(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.meta.get(name).cloned())
    }

    fn put_meta(&mut self, name: &str, value: Bytes) -> Result<()> {
        self.meta.insert(name.to_owned(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &mut MemStore, id: &str, rev: &str) -> u64 {
        store
            .put(
                &DocId::new(id).unwrap(),
                Bytes::from_static(b"tree"),
                Some(rev.parse::<RevId>().unwrap()),
                DocFlags::EXISTS,
            )
            .unwrap()
    }

    #[test]
    fn sequences_are_monotonic_and_unique() {
        let mut store = MemStore::default();
        assert_eq!(put(&mut store, "a", "1-x"), 1);
        assert_eq!(put(&mut store, "b", "1-y"), 2);
        // Re-saving a document moves it to a fresh sequence.
        assert_eq!(put(&mut store, "a", "2-x"), 3);

        assert_eq!(store.last_sequence(), 3);
        assert!(store.get_by_sequence(1).unwrap().is_none());
        assert_eq!(
            store.get_by_sequence(3).unwrap().unwrap().doc_id.as_str(),
            "a"
        );
    }

    #[test]
    fn changes_since_scans_in_order() {
        let mut store = MemStore::default();
        for i in 0..10 {
            put(&mut store, &format!("doc-{i}"), "1-a");
        }
        let changes = store.changes_since(4, 3).unwrap();
        let seqs: Vec<u64> = changes.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![5, 6, 7]);
        assert!(store.changes_since(10, 100).unwrap().is_empty());
    }

    #[test]
    fn meta_blobs() {
        let mut store = MemStore::default();
        assert!(store.get_meta("checkpoint/x").unwrap().is_none());
        store
            .put_meta("checkpoint/x", Bytes::from_static(b"{}"))
            .unwrap();
        assert_eq!(
            store.get_meta("checkpoint/x").unwrap().unwrap().as_ref(),
            b"{}"
        );
    }
}
