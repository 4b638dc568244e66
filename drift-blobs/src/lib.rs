//! A content-addressed blob store backed by a flat directory.
//!
//! # File format
//!
//! The store is a single directory of regular files. A complete blob
//! occupies one file named after the url-safe base64 form of the SHA-1 of
//! its content, with the extension `.blob`. A blob file never changes after
//! it is installed, but it may be deleted by garbage collection.
//!
//! While a blob is being written it lives in a temporary file named
//! `incoming_<random>.tmp` in the same directory, so the final step of an
//! install is always a rename within one filesystem. Several writers may
//! race to install the same content; whoever renames first wins and the
//! others discard their temp file, so at most one file ever exists per key.
//! Temp files left behind by a crash are reaped the next time the store is
//! opened.
//!
//! Reading verifies: [`BlobStore::get_contents`] re-digests the bytes and
//! fails with [`drift_base::Error::CorruptData`] if the file no longer
//! matches its name.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod store;

pub use self::store::{BlobReadStream, BlobStore, BlobWriteStream, StoreOptions};

pub use drift_base::BlobKey;
