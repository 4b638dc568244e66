//! Debounced checkpoint persistence.
//!
//! Progress updates arrive continuously while revisions flow; writing every
//! one of them would double the write load. The checkpointer coalesces them:
//! each update re-arms a save timer, and the state is written when the timer
//! fires, on an explicit flush, and once more on shutdown. Losing the tail
//! between saves is safe because inserts are idempotent on restart.
//!
//! The checkpoint is written twice: into the local store's metadata and onto
//! the peer via `setCheckpoint`, both under the same peer-derived key.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use drift_docs::actor::DocsHandle;

use crate::conn::ConnectionHandle;
use crate::proto::{Checkpoint, Profile};

enum Msg {
    Local(u64),
    Remote(u64),
    Flush(oneshot::Sender<()>),
}

/// Handle used by the pusher and puller to report progress.
#[derive(Debug, Clone)]
pub(crate) struct CheckpointerHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl CheckpointerHandle {
    /// Everything up to `sequence` has been pushed and acknowledged.
    pub fn update_local(&self, sequence: u64) {
        self.tx.send(Msg::Local(sequence)).ok();
    }

    /// Everything up to the peer's `sequence` has been pulled and stored.
    pub fn update_remote(&self, sequence: u64) {
        self.tx.send(Msg::Remote(sequence)).ok();
    }

    /// Write the current state now. Resolves once the save completed.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Msg::Flush(done)).is_ok() {
            rx.await.ok();
        }
    }
}

/// The checkpoint saver task.
pub(crate) struct Checkpointer {
    rx: mpsc::UnboundedReceiver<Msg>,
    docs: DocsHandle,
    conn: ConnectionHandle,
    key: String,
    state: Checkpoint,
    dirty: bool,
    delay: Duration,
    cancel: CancellationToken,
}

impl Checkpointer {
    pub fn new(
        docs: DocsHandle,
        conn: ConnectionHandle,
        key: String,
        start: Checkpoint,
        delay: Duration,
        cancel: CancellationToken,
    ) -> (CheckpointerHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CheckpointerHandle { tx };
        let checkpointer = Checkpointer {
            rx,
            docs,
            conn,
            key,
            state: start,
            dirty: false,
            delay,
            cancel,
        };
        (handle, checkpointer)
    }

    pub async fn run(mut self) {
        let mut deadline = Instant::now();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(Msg::Local(sequence)) => {
                        if sequence > self.state.local {
                            trace!(sequence, "local checkpoint advanced");
                            self.state.local = sequence;
                            self.dirty = true;
                            deadline = Instant::now() + self.delay;
                        }
                    }
                    Some(Msg::Remote(sequence)) => {
                        if sequence > self.state.remote {
                            trace!(sequence, "remote checkpoint advanced");
                            self.state.remote = sequence;
                            self.dirty = true;
                            deadline = Instant::now() + self.delay;
                        }
                    }
                    Some(Msg::Flush(done)) => {
                        self.save().await;
                        done.send(()).ok();
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if self.dirty => {
                    self.save().await;
                    if self.dirty {
                        // Save failed; try again after another delay.
                        deadline = Instant::now() + self.delay;
                    }
                }
            }
        }
        // Final flush on the way out; restart resumes from whatever made it
        // out of here.
        self.save().await;
    }

    async fn save(&mut self) {
        if !self.dirty {
            return;
        }
        debug!(local = self.state.local, remote = self.state.remote, "saving checkpoint");
        let body = self.state.to_json();
        if let Err(err) = self
            .docs
            .put_meta(format!("checkpoint/{}", self.key), body.clone())
            .await
        {
            warn!("local checkpoint save failed: {err}");
            return;
        }
        let properties = vec![("client".to_owned(), self.key.clone())];
        if let Err(err) = self
            .conn
            .request(Profile::SetCheckpoint, properties, body)
            .await
        {
            // The peer's copy is an optimization; ours is authoritative.
            debug!("remote checkpoint save failed: {err}");
        }
        self.dirty = false;
    }
}
