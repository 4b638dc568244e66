use std::cmp::Ordering;
use std::collections::HashSet;

use bytes::Bytes;
use drift_base::{Error, Result, RevId};

use crate::raw;
use crate::rev::{Rev, RevFlags};

// Flags a caller may set on an inserted revision; the rest are ours.
const INSERT_FLAGS_MASK: RevFlags = RevFlags::from_bits(
    RevFlags::DELETED.bits()
        | RevFlags::HAS_ATTACHMENTS.bits()
        | RevFlags::KEEP_BODY.bits()
        | RevFlags::FOREIGN.bits(),
);

/// The ordered collection of all revisions of one document.
///
/// Revisions are stored in an arena and reference their parent by index.
/// After [`sort`](Self::sort) the arena is ordered by the winning order:
/// leaves before ancestors, live before tombstones, non-conflicting before
/// conflicting, higher revision id as the tiebreak. Index 0 of a sorted tree
/// is the current revision.
#[derive(Debug, Clone)]
pub struct RevTree {
    revs: Vec<Rev>,
    sorted: bool,
    changed: bool,
    unknown: bool,
}

impl Default for RevTree {
    fn default() -> Self {
        RevTree {
            revs: Vec::new(),
            sorted: true,
            changed: false,
            unknown: false,
        }
    }
}

impl RevTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a tree from its stored form.
    ///
    /// `sequence` is the sequence of the record the tree was read from; it is
    /// assigned to any stored revision that predates per-revision sequences.
    pub fn decode(data: &[u8], sequence: u64) -> Result<Self> {
        Ok(RevTree {
            revs: raw::decode_tree(data, sequence)?,
            sorted: true,
            changed: false,
            unknown: false,
        })
    }

    /// Encode the tree to its stored form, sorting it first.
    pub fn encode(&mut self) -> Result<Bytes> {
        self.sort();
        raw::encode_tree(&self.revs)
    }

    /// A placeholder for a tree whose record has not been read yet.
    ///
    /// Only metadata-level operations are meaningful on an unloaded tree;
    /// [`Document`](crate::Document) swaps in the decoded tree on demand.
    pub fn unloaded() -> Self {
        RevTree {
            unknown: true,
            ..Self::default()
        }
    }

    /// Whether this tree is a metadata-only placeholder.
    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    /// Whether the tree has been mutated since it was decoded or saved.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn clear_changed(&mut self) {
        self.changed = false;
    }

    /// Number of revisions.
    pub fn len(&self) -> usize {
        self.revs.len()
    }

    /// True when the tree holds no revisions.
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// The revision at `index`.
    pub fn rev(&self, index: usize) -> &Rev {
        &self.revs[index]
    }

    /// Look up a revision by id.
    pub fn get(&self, rev_id: &RevId) -> Option<&Rev> {
        self.index_of(rev_id).map(|i| &self.revs[i])
    }

    /// Arena index of a revision id.
    pub fn index_of(&self, rev_id: &RevId) -> Option<usize> {
        self.revs.iter().position(|rev| rev.rev_id == *rev_id)
    }

    /// Look up a revision by its saved sequence.
    pub fn get_by_sequence(&self, sequence: u64) -> Option<&Rev> {
        debug_assert!(!self.unknown);
        self.revs.iter().find(|rev| rev.sequence == sequence)
    }

    /// The winning revision. Sorts the tree.
    pub fn current(&mut self) -> Option<&Rev> {
        debug_assert!(!self.unknown);
        self.sort();
        self.revs.first()
    }

    /// Iterate a revision's ancestry, starting at the revision itself and
    /// ending at its root.
    pub fn history(&self, index: usize) -> impl Iterator<Item = &Rev> + '_ {
        let mut next = Some(index);
        std::iter::from_fn(move || {
            let i = next?;
            let rev = &self.revs[i];
            next = rev.parent;
            Some(rev)
        })
    }

    /// Iterate the leaves of the tree.
    pub fn leaves(&self) -> impl Iterator<Item = &Rev> + '_ {
        self.revs.iter().filter(|rev| rev.is_leaf())
    }

    /// Whether two or more active revisions coexist.
    pub fn has_conflict(&self) -> bool {
        if self.revs.len() < 2 {
            false
        } else if self.sorted {
            self.revs[1].is_active()
        } else {
            self.revs.iter().filter(|rev| rev.is_active()).count() > 1
        }
    }

    /// Insert a new revision created locally.
    ///
    /// `parent` must name an existing revision, or be `None` for a root.
    /// Returns the arena index of the inserted revision, `Ok(None)` if the id
    /// is already present, [`Error::Conflict`] if the insert would create a
    /// branch without `allow_conflict`, and [`Error::BadRevId`] if the id's
    /// generation is not exactly one above its parent's.
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        flags: RevFlags,
        parent: Option<&RevId>,
        allow_conflict: bool,
    ) -> Result<Option<usize>> {
        debug_assert!(!self.unknown);
        let parent_idx = match parent {
            Some(id) => Some(self.index_of(id).ok_or(Error::NotFound)?),
            None => None,
        };
        if self.index_of(&rev_id).is_some() {
            return Ok(None);
        }
        let parent_gen = match parent_idx {
            Some(p) => {
                if !allow_conflict && !self.revs[p].is_leaf() {
                    return Err(Error::Conflict);
                }
                self.revs[p].rev_id.gen()
            }
            None => {
                if !allow_conflict && !self.revs.is_empty() {
                    return Err(Error::Conflict);
                }
                0
            }
        };
        if rev_id.gen() != parent_gen + 1 {
            return Err(Error::BadRevId);
        }
        Ok(Some(self.raw_insert(rev_id, body, parent_idx, flags)))
    }

    /// Insert a revision received from a peer along with its ancestry.
    ///
    /// `history` is newest-first; `history[0]` is the revision carrying
    /// `body`. Ancestors missing from the tree are inserted as body-less
    /// foreign revisions. Returns the index within `history` of the first
    /// revision that was already present, or `history.len()` if none was.
    /// Generation numbers that do not decrease by exactly one are malformed.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Option<Bytes>,
        flags: RevFlags,
    ) -> Result<usize> {
        debug_assert!(!self.unknown);
        if history.is_empty() {
            return Err(Error::BadRevId);
        }
        // Find the common ancestor, validating ids along the way.
        let mut common = history.len();
        let mut parent = None;
        let mut last_gen = 0;
        for (i, rev_id) in history.iter().enumerate() {
            let gen = rev_id.gen();
            if last_gen > 0 && gen != last_gen - 1 {
                return Err(Error::BadRevId);
            }
            last_gen = gen;
            if let Some(idx) = self.index_of(rev_id) {
                common = i;
                parent = Some(idx);
                break;
            }
        }
        if common > 0 {
            // Insert the missing ancestors in chronological order, then the
            // revision itself.
            let ancestor_flags = flags & RevFlags::FOREIGN;
            for i in (1..common).rev() {
                parent = Some(self.raw_insert(history[i].clone(), None, parent, ancestor_flags));
            }
            self.raw_insert(history[0].clone(), body, parent, flags);
        }
        Ok(common)
    }

    // Lowest-level insert. Does no validation, always appends.
    fn raw_insert(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        parent: Option<usize>,
        flags: RevFlags,
    ) -> usize {
        let mut new_flags = (flags & INSERT_FLAGS_MASK) | RevFlags::LEAF | RevFlags::NEW;
        if let Some(p) = parent {
            let conflict = !self.revs[p].is_leaf() || self.revs[p].is_conflict();
            if conflict {
                // Creating or extending a side branch.
                new_flags |= RevFlags::CONFLICT;
            }
            self.revs[p].flags.remove(RevFlags::LEAF);
            if flags.contains(RevFlags::KEEP_BODY) {
                // Only one revision per branch keeps its body.
                let mut ancestor = Some(p);
                while let Some(i) = ancestor {
                    if conflict && !self.revs[i].is_conflict() {
                        break;
                    }
                    self.revs[i].flags.remove(RevFlags::KEEP_BODY);
                    ancestor = self.revs[i].parent;
                }
            }
        } else if !self.revs.is_empty() {
            // A second root is a conflict by construction.
            new_flags |= RevFlags::CONFLICT;
        }

        self.changed = true;
        if !self.revs.is_empty() {
            self.sorted = false;
        }
        self.revs.push(Rev {
            rev_id,
            parent,
            body,
            sequence: 0,
            flags: new_flags,
        });
        self.revs.len() - 1
    }

    /// Mark every revision deeper than `max_depth` below its leaf for purge
    /// and compact the tree. Returns the number of revisions removed.
    pub fn prune(&mut self, max_depth: usize) -> usize {
        if max_depth == 0 || self.revs.len() <= max_depth {
            return 0;
        }
        let mut pruned = 0;
        for i in 0..self.revs.len() {
            if !self.revs[i].is_leaf() {
                if self.sorted {
                    // Sorted trees keep their leaves at the front.
                    break;
                }
                continue;
            }
            let mut depth = 0;
            let mut ancestor = Some(i);
            while let Some(a) = ancestor {
                depth += 1;
                if depth > max_depth && !self.revs[a].flags.contains(RevFlags::PURGE) {
                    self.revs[a].flags.insert(RevFlags::PURGE);
                    pruned += 1;
                }
                ancestor = self.revs[a].parent;
            }
        }
        if pruned == 0 {
            return 0;
        }
        // Detach survivors from parents that are going away.
        for i in 0..self.revs.len() {
            if let Some(p) = self.revs[i].parent {
                if self.revs[p].flags.contains(RevFlags::PURGE) {
                    self.revs[i].parent = None;
                }
            }
        }
        self.compact();
        pruned
    }

    /// Remove a leaf revision and every ancestor that only existed to
    /// support it. Returns the number of revisions removed.
    pub fn purge(&mut self, leaf_id: &RevId) -> usize {
        let Some(mut idx) = self.index_of(leaf_id) else {
            return 0;
        };
        if !self.revs[idx].is_leaf() {
            return 0;
        }
        let mut purged = 0;
        loop {
            purged += 1;
            self.revs[idx].flags.insert(RevFlags::PURGE);
            match self.revs[idx].parent.take() {
                Some(p) if self.confirm_leaf(p) => idx = p,
                _ => break,
            }
        }
        self.compact();
        self.check_for_resolved_conflict();
        purged
    }

    /// Empty the tree. Returns the number of revisions removed.
    pub fn purge_all(&mut self) -> usize {
        let purged = self.revs.len();
        self.revs.clear();
        self.changed = true;
        self.sorted = true;
        purged
    }

    // True if no revision names `index` as its parent; marks it a leaf.
    fn confirm_leaf(&mut self, index: usize) -> bool {
        if self.revs.iter().any(|rev| rev.parent == Some(index)) {
            return false;
        }
        self.revs[index].flags.insert(RevFlags::LEAF);
        // The promotion changes the winning order.
        self.sorted = false;
        true
    }

    // Remove every purge-marked revision, keeping relative order and
    // rewriting parent indices.
    fn compact(&mut self) {
        let mut new_index = vec![usize::MAX; self.revs.len()];
        let mut kept = 0;
        for (i, rev) in self.revs.iter().enumerate() {
            if !rev.flags.contains(RevFlags::PURGE) {
                new_index[i] = kept;
                kept += 1;
            }
        }
        for rev in &mut self.revs {
            if let Some(p) = rev.parent {
                rev.parent = if new_index[p] == usize::MAX {
                    None
                } else {
                    Some(new_index[p])
                };
            }
        }
        self.revs.retain(|rev| !rev.flags.contains(RevFlags::PURGE));
        self.changed = true;
    }

    /// Drop the body of a revision that was pinned with
    /// [`RevFlags::KEEP_BODY`].
    pub fn remove_body(&mut self, rev_id: &RevId) {
        if let Some(i) = self.index_of(rev_id) {
            if self.revs[i].keeps_body() {
                self.revs[i].flags.remove(RevFlags::KEEP_BODY);
                self.revs[i].body = None;
                self.changed = true;
            }
        }
    }

    /// Drop the bodies of saved revisions that are no longer leaves and are
    /// not pinned, keeping storage bounded.
    pub fn remove_non_leaf_bodies(&mut self) {
        let mut changed = false;
        for rev in &mut self.revs {
            if rev.body.is_some()
                && !rev
                    .flags
                    .intersects(RevFlags::LEAF | RevFlags::NEW | RevFlags::KEEP_BODY)
            {
                rev.body = None;
                changed = true;
            }
        }
        self.changed |= changed;
    }

    /// Record that the tree was persisted under `new_sequence`: clears the
    /// NEW flag everywhere and assigns the sequence to unsaved revisions.
    pub fn saved(&mut self, new_sequence: u64) {
        for rev in &mut self.revs {
            rev.flags.remove(RevFlags::NEW);
            if rev.sequence == 0 {
                rev.sequence = new_sequence;
            }
        }
    }

    /// Sort into the winning order and clear stale conflict markers.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        let mut order: Vec<usize> = (0..self.revs.len()).collect();
        order.sort_by(|&a, &b| winning_order(&self.revs[a], &self.revs[b]));
        let mut new_index = vec![0usize; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }
        let mut slots: Vec<Option<Rev>> = std::mem::take(&mut self.revs)
            .into_iter()
            .map(Some)
            .collect();
        self.revs = order
            .iter()
            .map(|&old| slots[old].take().expect("order is a permutation"))
            .collect();
        for rev in &mut self.revs {
            if let Some(p) = rev.parent {
                rev.parent = Some(new_index[p]);
            }
        }
        self.sorted = true;
        self.check_for_resolved_conflict();
    }

    // If the winner itself carries the conflict marker, the conflict has
    // been resolved; clear the marker down its lineage.
    fn check_for_resolved_conflict(&mut self) {
        if self.sorted && !self.revs.is_empty() && self.revs[0].is_conflict() {
            let mut i = Some(0);
            while let Some(idx) = i {
                self.revs[idx].flags.remove(RevFlags::CONFLICT);
                i = self.revs[idx].parent;
            }
        }
    }

    /// The closest revision that is an ancestor of (or equal to) both `a`
    /// and `b`.
    pub fn common_ancestor(&self, a: &RevId, b: &RevId) -> Option<&RevId> {
        let ai = self.index_of(a)?;
        let bi = self.index_of(b)?;
        let mut seen = HashSet::new();
        let mut i = Some(ai);
        while let Some(idx) = i {
            seen.insert(idx);
            i = self.revs[idx].parent;
        }
        let mut i = Some(bi);
        while let Some(idx) = i {
            if seen.contains(&idx) {
                return Some(&self.revs[idx].rev_id);
            }
            i = self.revs[idx].parent;
        }
        None
    }

    /// Resolve a conflict between two leaves.
    ///
    /// The losing branch is purged, and a new revision holding `merged_body`
    /// (or a tombstone, when `None`) is created over the winner. Returns the
    /// id of the new current revision.
    pub fn resolve_conflict(
        &mut self,
        winner: &RevId,
        loser: &RevId,
        merged_body: Option<Bytes>,
    ) -> Result<RevId> {
        if winner == loser {
            return Err(Error::Conflict);
        }
        let w = self.index_of(winner).ok_or(Error::NotFound)?;
        let l = self.index_of(loser).ok_or(Error::NotFound)?;
        if !self.revs[w].is_leaf() || !self.revs[l].is_leaf() {
            return Err(Error::Conflict);
        }
        let deleted = merged_body.is_none();
        let flags = if deleted {
            RevFlags::DELETED
        } else {
            RevFlags::NONE
        };
        let body_bytes = merged_body.clone().unwrap_or_default();
        let new_id = RevId::derive(Some(winner), deleted, &body_bytes);
        self.insert(new_id.clone(), merged_body, flags, Some(winner), true)?;
        self.purge(loser);
        self.sort();
        Ok(new_id)
    }
}

// Descending priority: the best revision sorts first.
pub(crate) fn winning_order(r1: &Rev, r2: &Rev) -> Ordering {
    // Leaves before ancestors.
    r2.is_leaf()
        .cmp(&r1.is_leaf())
        // Live before tombstones.
        .then_with(|| r1.is_deleted().cmp(&r2.is_deleted()))
        // Conflicting branches never win outright.
        .then_with(|| r1.is_conflict().cmp(&r2.is_conflict()))
        // Higher revision id as the final tiebreak.
        .then_with(|| r2.rev_id.cmp(&r1.rev_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RevId {
        s.parse().unwrap()
    }

    fn body(s: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(s.as_bytes()))
    }

    // Every parented revision must sit exactly one generation above its
    // parent, and only a conflicted tree may have two active leaves.
    fn check_invariants(tree: &RevTree) {
        for rev in &tree.revs {
            if let Some(p) = rev.parent {
                assert_eq!(tree.revs[p].rev_id.gen() + 1, rev.rev_id.gen());
            }
        }
        for (i, rev) in tree.revs.iter().enumerate() {
            let has_child = tree.revs.iter().any(|r| r.parent == Some(i));
            assert_eq!(rev.is_leaf(), !has_child);
        }
        let active = tree.revs.iter().filter(|r| r.is_active()).count();
        assert!(active <= 1 || tree.has_conflict());
    }

    #[test]
    fn insert_and_get() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap()
            .unwrap();
        tree.insert(
            id("2-bbb"),
            body("{\"ok\":\"go\"}"),
            RevFlags::NONE,
            Some(&id("1-aaa")),
            false,
        )
        .unwrap()
        .unwrap();

        assert_eq!(tree.len(), 2);
        let rev = tree.get(&id("2-bbb")).unwrap();
        assert!(rev.is_leaf() && rev.is_new());
        assert!(!tree.get(&id("1-aaa")).unwrap().is_leaf());
        assert_eq!(tree.current().unwrap().rev_id(), &id("2-bbb"));
        assert!(!tree.has_conflict());
        check_invariants(&tree);

        // Inserting an existing id is a no-op.
        assert_eq!(
            tree.insert(id("2-bbb"), None, RevFlags::NONE, Some(&id("1-aaa")), false)
                .unwrap(),
            None
        );
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn insert_rejections() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();

        // Generation must be parent + 1.
        assert!(matches!(
            tree.insert(id("3-ccc"), None, RevFlags::NONE, Some(&id("1-aaa")), false),
            Err(Error::BadRevId)
        ));
        // A second root without permission is a conflict.
        assert!(matches!(
            tree.insert(id("1-zzz"), None, RevFlags::NONE, None, false),
            Err(Error::Conflict)
        ));
        // Unknown parent.
        assert!(matches!(
            tree.insert(id("2-ccc"), None, RevFlags::NONE, Some(&id("1-nope")), false),
            Err(Error::NotFound)
        ));

        tree.insert(id("2-bbb"), None, RevFlags::NONE, Some(&id("1-aaa")), false)
            .unwrap();
        // Extending a non-leaf without permission is a conflict.
        assert!(matches!(
            tree.insert(id("2-ccc"), None, RevFlags::NONE, Some(&id("1-aaa")), false),
            Err(Error::Conflict)
        ));
        check_invariants(&tree);
    }

    #[test]
    fn tombstone_winner_loses_to_live_branch() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();
        tree.insert(id("2-del"), None, RevFlags::DELETED, Some(&id("1-aaa")), false)
            .unwrap();
        tree.insert(id("2-abc"), body("{}"), RevFlags::NONE, Some(&id("1-aaa")), true)
            .unwrap();

        // The live leaf wins over the higher-sorting tombstone.
        assert_eq!(tree.current().unwrap().rev_id(), &id("2-abc"));
        check_invariants(&tree);
    }

    #[test]
    fn conflict_then_resolve() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();
        tree.insert(
            id("2-bbb"),
            body("{\"ok\":\"go\"}"),
            RevFlags::NONE,
            Some(&id("1-aaa")),
            false,
        )
        .unwrap();
        tree.insert(
            id("3-aaaaaa"),
            body("{\"loser\":true}"),
            RevFlags::NONE,
            Some(&id("2-bbb")),
            false,
        )
        .unwrap();

        // A pulled branch creates the conflict.
        let history = [id("4-dddd"), id("3-ababab"), id("2-bbb")];
        let common = tree
            .insert_history(&history, body("{\"ubu\":\"roi\"}"), RevFlags::FOREIGN)
            .unwrap();
        assert_eq!(common, 2);
        assert!(tree.get(&id("3-ababab")).unwrap().is_foreign());
        assert!(tree.get(&id("4-dddd")).unwrap().is_conflict());
        assert!(tree.has_conflict());
        check_invariants(&tree);

        assert_eq!(
            tree.common_ancestor(&id("3-aaaaaa"), &id("4-dddd")),
            Some(&id("2-bbb"))
        );

        let merged = tree
            .resolve_conflict(&id("4-dddd"), &id("3-aaaaaa"), body("{\"merged\":true}"))
            .unwrap();
        assert_eq!(merged.gen(), 5);
        assert!(!tree.has_conflict());
        let winner = tree.current().unwrap();
        assert_eq!(winner.rev_id(), &merged);
        assert_eq!(winner.body().unwrap().as_ref(), b"{\"merged\":true}");
        assert!(!winner.is_conflict());
        let parent = winner.parent().unwrap();
        assert_eq!(tree.rev(parent).rev_id(), &id("4-dddd"));
        assert!(tree.get(&id("3-aaaaaa")).is_none());
        check_invariants(&tree);
    }

    #[test]
    fn insert_history_validation() {
        let mut tree = RevTree::new();
        assert!(matches!(
            tree.insert_history(&[], None, RevFlags::NONE),
            Err(Error::BadRevId)
        ));
        // Generations must decrease by exactly one.
        assert!(matches!(
            tree.insert_history(&[id("4-a"), id("2-b")], body("{}"), RevFlags::NONE),
            Err(Error::BadRevId)
        ));

        // No common ancestor: the whole chain is inserted.
        let history = [id("3-ccc"), id("2-bbb"), id("1-aaa")];
        let common = tree
            .insert_history(&history, body("{}"), RevFlags::FOREIGN)
            .unwrap();
        assert_eq!(common, history.len());
        assert_eq!(tree.len(), 3);
        assert!(tree.get(&id("2-bbb")).unwrap().body().is_none());

        // Replaying the same chain finds the head immediately.
        let common = tree
            .insert_history(&history, body("{}"), RevFlags::FOREIGN)
            .unwrap();
        assert_eq!(common, 0);
        assert_eq!(tree.len(), 3);
        check_invariants(&tree);
    }

    #[test]
    fn keep_body_moves_along_branch() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::KEEP_BODY, None, false)
            .unwrap();
        tree.insert(
            id("2-bbb"),
            body("{}"),
            RevFlags::KEEP_BODY,
            Some(&id("1-aaa")),
            false,
        )
        .unwrap();

        assert!(!tree.get(&id("1-aaa")).unwrap().keeps_body());
        assert!(tree.get(&id("2-bbb")).unwrap().keeps_body());

        tree.remove_body(&id("2-bbb"));
        let rev = tree.get(&id("2-bbb")).unwrap();
        assert!(!rev.keeps_body());
        assert!(rev.body().is_none());
    }

    #[test]
    fn prune_to_depth() {
        let mut tree = RevTree::new();
        let mut parent: Option<RevId> = None;
        for gen in 1..=10_000u64 {
            let rev_id = id(&format!("{gen}-{gen:08x}"));
            tree.insert(
                rev_id.clone(),
                body("{}"),
                RevFlags::NONE,
                parent.as_ref(),
                false,
            )
            .unwrap()
            .unwrap();
            parent = Some(rev_id);
        }

        assert_eq!(tree.prune(30), 9_970);
        assert_eq!(tree.len(), 30);

        let winner_index = tree
            .index_of(&id(&format!("10000-{:08x}", 10_000u64)))
            .unwrap();
        let history: Vec<u64> = tree.history(winner_index).map(|r| r.rev_id().gen()).collect();
        assert_eq!(history.len(), 30);
        assert_eq!(*history.last().unwrap(), 9_971);
        check_invariants(&tree);

        // Already within bounds: nothing to do.
        assert_eq!(tree.prune(30), 0);
    }

    #[test]
    fn prune_keeps_every_branch() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();
        let mut parent = id("1-aaa");
        for gen in 2..=6u64 {
            let rev_id = id(&format!("{gen}-main"));
            tree.insert(rev_id.clone(), body("{}"), RevFlags::NONE, Some(&parent), false)
                .unwrap();
            parent = rev_id;
        }
        tree.insert(id("2-side"), body("{}"), RevFlags::NONE, Some(&id("1-aaa")), true)
            .unwrap();

        tree.prune(3);
        // Both leaves survive with their histories bounded.
        for leaf in ["6-main", "2-side"] {
            let idx = tree.index_of(&id(leaf)).unwrap();
            assert!(tree.history(idx).count() <= 3);
        }
        check_invariants(&tree);
    }

    #[test]
    fn purge_branch() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();
        tree.insert(id("2-bbb"), body("{}"), RevFlags::NONE, Some(&id("1-aaa")), false)
            .unwrap();
        tree.insert(id("2-ccc"), body("{}"), RevFlags::NONE, Some(&id("1-aaa")), true)
            .unwrap();
        assert!(tree.has_conflict());

        // 2-ccc sorts above 2-bbb, so the conflict marker sits on 2-bbb.
        assert_eq!(tree.current().unwrap().rev_id(), &id("2-ccc"));

        // Purging the winning branch leaves a clean single-branch tree.
        assert_eq!(tree.purge(&id("2-ccc")), 1);
        assert!(!tree.has_conflict());
        assert_eq!(tree.current().unwrap().rev_id(), &id("2-bbb"));
        assert!(!tree.current().unwrap().is_conflict());
        check_invariants(&tree);

        // Purging the only leaf empties the tree.
        assert_eq!(tree.purge(&id("2-bbb")), 2);
        assert!(tree.is_empty());
    }

    #[test]
    fn purge_all() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();
        tree.insert(id("2-bbb"), body("{}"), RevFlags::NONE, Some(&id("1-aaa")), false)
            .unwrap();
        assert_eq!(tree.purge_all(), 2);
        assert!(tree.is_empty());
        assert!(tree.is_changed());
    }

    #[test]
    fn saved_assigns_sequences() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();
        tree.saved(7);
        tree.insert(id("2-bbb"), body("{}"), RevFlags::NONE, Some(&id("1-aaa")), false)
            .unwrap();
        tree.saved(9);

        assert_eq!(tree.get(&id("1-aaa")).unwrap().sequence(), 7);
        assert_eq!(tree.get(&id("2-bbb")).unwrap().sequence(), 9);
        assert!(!tree.get(&id("2-bbb")).unwrap().is_new());
        assert_eq!(tree.get_by_sequence(9).unwrap().rev_id(), &id("2-bbb"));
    }

    #[test]
    fn remove_non_leaf_bodies() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();
        tree.insert(id("2-bbb"), body("{}"), RevFlags::NONE, Some(&id("1-aaa")), false)
            .unwrap();
        tree.saved(1);
        tree.remove_non_leaf_bodies();

        assert!(tree.get(&id("1-aaa")).unwrap().body().is_none());
        assert!(tree.get(&id("2-bbb")).unwrap().body().is_some());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut tree = RevTree::new();
        tree.insert(id("1-aaa"), body("{}"), RevFlags::NONE, None, false)
            .unwrap();
        tree.insert(
            id("2-bbb"),
            body("{\"v\":2}"),
            RevFlags::HAS_ATTACHMENTS,
            Some(&id("1-aaa")),
            false,
        )
        .unwrap();
        tree.insert(id("2-ccc"), body("{\"v\":3}"), RevFlags::NONE, Some(&id("1-aaa")), true)
            .unwrap();
        tree.saved(4);

        let encoded = tree.encode().unwrap();
        let mut decoded = RevTree::decode(&encoded, 4).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.current().unwrap().rev_id(), tree.current().unwrap().rev_id());
        assert!(decoded.has_conflict());
        assert!(decoded
            .get(&id("2-bbb"))
            .unwrap()
            .flags()
            .contains(RevFlags::HAS_ATTACHMENTS));
        assert_eq!(decoded.get(&id("2-ccc")).unwrap().sequence(), 4);
        assert!(!decoded.is_changed());
        check_invariants(&decoded);

        // Encoding a sorted tree is stable.
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn decode_garbage_is_corrupt() {
        assert!(matches!(
            RevTree::decode(&[0xff, 0xff, 0xff, 0xff, 0x01], 1),
            Err(Error::CorruptData)
        ));
    }
}
