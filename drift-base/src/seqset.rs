//! Ordered sets of database sequences.

use std::collections::BTreeSet;

/// A set of positive sequence numbers plus a high-water mark.
///
/// The replicator uses this to track which sequences have been read from the
/// database but not yet acknowledged by the peer: the checkpoint may safely
/// advance to just below [`first`](Self::first), or to
/// [`max_ever`](Self::max_ever) once the set drains.
#[derive(Debug, Default, Clone)]
pub struct SequenceSet {
    seqs: BTreeSet<u64>,
    max_ever: u64,
}

impl SequenceSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the set and reset the high-water mark to `max`.
    pub fn clear(&mut self, max: u64) {
        self.seqs.clear();
        self.max_ever = max;
    }

    /// True when no sequences are outstanding.
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    /// Number of outstanding sequences.
    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    /// The lowest outstanding sequence, or 0 when empty.
    pub fn first(&self) -> u64 {
        self.seqs.iter().next().copied().unwrap_or(0)
    }

    /// The largest sequence ever added since the last [`clear`](Self::clear).
    pub fn max_ever(&self) -> u64 {
        self.max_ever
    }

    /// Whether `seq` is outstanding.
    pub fn contains(&self, seq: u64) -> bool {
        self.seqs.contains(&seq)
    }

    /// Add `seq` to the set.
    pub fn add(&mut self, seq: u64) {
        self.seqs.insert(seq);
        self.max_ever = self.max_ever.max(seq);
    }

    /// Remove `seq` from the set.
    pub fn remove(&mut self, seq: u64) {
        self.seqs.remove(&seq);
    }

    /// The sequence below which everything has been acknowledged.
    pub fn checkpoint(&self) -> u64 {
        if self.is_empty() {
            self.max_ever
        } else {
            self.first() - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basics() {
        let mut set = SequenceSet::new();
        assert!(set.is_empty());
        assert_eq!(set.first(), 0);

        for seq in [3, 1, 2] {
            set.add(seq);
        }
        assert_eq!(set.len(), 3);
        assert_eq!(set.first(), 1);
        assert_eq!(set.max_ever(), 3);
        assert!(set.contains(2));

        set.remove(1);
        assert_eq!(set.first(), 2);
        assert_eq!(set.max_ever(), 3);

        set.clear(10);
        assert!(set.is_empty());
        assert_eq!(set.max_ever(), 10);
    }

    #[test]
    fn checkpoint_boundary() {
        let mut set = SequenceSet::new();
        set.add(5);
        set.add(6);
        set.add(7);
        assert_eq!(set.checkpoint(), 4);
        set.remove(5);
        assert_eq!(set.checkpoint(), 5);
        set.remove(7);
        assert_eq!(set.checkpoint(), 5);
        set.remove(6);
        assert_eq!(set.checkpoint(), 7);
    }
}
