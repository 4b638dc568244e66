//! Base types shared by the drift document engine.
//!
//! This crate carries the small, widely shared vocabulary of the engine: the
//! [`Error`] taxonomy every public API reports through, the content-addressed
//! [`BlobKey`], parsed [revision ids](RevId), the [`SequenceSet`] used by the
//! replicator to track unacknowledged sequences, and the [`LocalPool`] that
//! hosts actor futures on dedicated threads.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod error;
mod key;
mod pool;
mod revid;
mod seqset;

pub use self::error::{Domain, Error, Result};
pub use self::key::BlobKey;
pub use self::pool::{LocalPool, LocalPoolHandle};
pub use self::revid::{RevForm, RevId};
pub use self::seqset::SequenceSet;
