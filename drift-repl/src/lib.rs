//! The drift replicator.
//!
//! Replication runs over any framed bidirectional byte channel (the socket
//! is dialed or accepted by the embedder and injected into the session). A
//! session drives up to two directions: a pusher offering local changes and
//! sending the revisions the peer asks for, and a puller subscribing to the
//! peer's changes and applying the revisions it delivers. Progress is
//! recorded as a `{local, remote}` checkpoint, debounced while revisions
//! flow and flushed on shutdown, so an interrupted session resumes where it
//! durably left off and idempotent inserts suppress any replayed tail.
//!
//! See [`Replicator::spawn`] for the entry point and [`proto`] for the wire
//! format.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod checkpoint;
mod conn;
pub mod proto;
mod puller;
mod pusher;
mod session;

pub use self::proto::Checkpoint;
pub use self::session::{checkpoint_key, Mode, Replicator, SessionOptions};
