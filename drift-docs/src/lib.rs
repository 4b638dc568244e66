//! The revision-tree document store.
//!
//! A document is a tree of immutable [revisions](Rev): each revision points
//! at its parent, and the set of childless ("leaf") revisions are the live
//! heads of the document. At most one leaf is active unless the document is
//! in conflict; sorting the tree by the winning order makes index 0 the
//! current revision. [`RevTree`] implements insertion (local edits and
//! pulled remote histories), conflict detection and resolution, bounded-depth
//! pruning and purging; [`Document`] binds a tree to a durable [`Record`]
//! with a monotonic sequence.
//!
//! Storage goes through the [`store::Store`] contract, an ordered key/value
//! record store scannable by document id and by sequence. All access to a
//! store is serialized through the [`actor::DocsHandle`] mailbox actor,
//! which also publishes a feed of committed changes for the replicator.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod actor;
mod doc;
mod raw;
mod rev;
pub mod store;
mod tree;

pub use self::doc::{DocFlags, DocId, Document, Record};
pub use self::rev::{Rev, RevFlags};
pub use self::tree::RevTree;

pub use drift_base::{RevForm, RevId};
