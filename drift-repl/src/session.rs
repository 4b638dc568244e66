//! Replication sessions.
//!
//! A [`Replicator`] owns one connection to one peer plus the actors serving
//! it: the connection loop, an active pusher and/or puller for the
//! directions this side initiates, passive pushers started on demand when
//! the peer subscribes, a checkpointer for active directions, and the
//! handlers serving the peer's checkpoint reads and writes. Everything runs
//! on a small local pool; the session supervisor watches for completion and
//! tears the lot down.

use std::future::Future;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use data_encoding::BASE64URL_NOPAD;
use drift_base::{Error, LocalPool, LocalPoolHandle, Result};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, warn, Instrument};

use drift_docs::actor::DocsHandle;

use crate::checkpoint::{Checkpointer, CheckpointerHandle};
use crate::conn::{Connection, ConnectionHandle, HandlerMap, IncomingRequest};
use crate::proto::{self, Checkpoint, Profile};
use crate::puller::Puller;
use crate::pusher::{Pusher, DEFAULT_CHANGES_BATCH_SIZE};

/// What a session does in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Nothing; requests for this direction are refused.
    #[default]
    Disabled,
    /// Serve the direction when the peer initiates it.
    Passive,
    /// Drive the direction until caught up, then stop.
    OneShot,
    /// Drive the direction and keep following new changes.
    Continuous,
}

impl Mode {
    /// Whether this side initiates the direction.
    pub fn is_active(self) -> bool {
        matches!(self, Mode::OneShot | Mode::Continuous)
    }

    /// Whether the direction follows new changes indefinitely.
    pub fn is_continuous(self) -> bool {
        matches!(self, Mode::Continuous)
    }
}

/// Configuration of a replication session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Push direction mode.
    pub push: Mode,
    /// Pull direction mode.
    pub pull: Mode,
    /// Debounce window for checkpoint saves.
    pub checkpoint_save_delay: Duration,
    /// Changes fetched from the database per batch.
    pub changes_batch_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            push: Mode::Disabled,
            pull: Mode::Disabled,
            checkpoint_save_delay: Duration::from_secs(5),
            changes_batch_size: DEFAULT_CHANGES_BATCH_SIZE,
        }
    }
}

impl SessionOptions {
    /// A session that pushes.
    pub fn pushing(mode: Mode) -> Self {
        SessionOptions {
            push: mode,
            ..Default::default()
        }
    }

    /// A session that pulls.
    pub fn pulling(mode: Mode) -> Self {
        SessionOptions {
            pull: mode,
            ..Default::default()
        }
    }

    /// A session that serves whatever the peer initiates.
    pub fn passive() -> Self {
        SessionOptions {
            push: Mode::Passive,
            pull: Mode::Passive,
            ..Default::default()
        }
    }

    /// Override the checkpoint debounce window.
    pub fn with_checkpoint_save_delay(mut self, delay: Duration) -> Self {
        self.checkpoint_save_delay = delay;
        self
    }

    fn has_passive_role(&self) -> bool {
        self.push == Mode::Passive || self.pull == Mode::Passive
    }
}

/// The key checkpoints are stored under, locally and on the peer.
///
/// Derived from the peer's identity and which directions we drive, so two
/// differently-configured sessions against the same peer never clobber each
/// other's progress.
pub fn checkpoint_key(peer_id: &str, options: &SessionOptions) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(peer_id.as_bytes());
    sha1.update([
        options.push.is_active() as u8,
        options.pull.is_active() as u8,
    ]);
    BASE64URL_NOPAD.encode(&sha1.finalize())
}

/// A running replication session.
pub struct Replicator {
    cancel: CancellationToken,
    conn: ConnectionHandle,
    checkpointer: Option<CheckpointerHandle>,
    pool: Option<LocalPool>,
    done: Option<oneshot::Receiver<Result<()>>>,
}

impl Replicator {
    /// Start a session over `io` against the peer identified by `peer_id`.
    ///
    /// The transport is injected; whoever dialed or accepted the socket owns
    /// its lifecycle up to here.
    pub fn spawn<T>(io: T, peer_id: &str, docs: DocsHandle, options: SessionOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let key = checkpoint_key(peer_id, &options);
        let cancel = CancellationToken::new();
        let pool = LocalPool::new(2);

        let mut handlers = HandlerMap::new();
        let subchanges_rx = handlers.register(Profile::SubChanges, 4);
        let changes_rx = handlers.register(Profile::Changes, 16);
        let revs_rx = handlers.register(Profile::Rev, 16);
        let get_checkpoint_rx = handlers.register(Profile::GetCheckpoint, 4);
        let set_checkpoint_rx = handlers.register(Profile::SetCheckpoint, 4);

        let (conn, connection) = Connection::new(io, handlers);
        let span = error_span!("repl", peer = peer_id);
        {
            let span = span.clone();
            pool.spawn_detached(move || connection.run().instrument(span));
        }

        let checkpointer = if options.push.is_active() || options.pull.is_active() {
            let (handle, task) = Checkpointer::new(
                docs.clone(),
                conn.clone(),
                key.clone(),
                Checkpoint::default(),
                options.checkpoint_save_delay,
                cancel.child_token(),
            );
            let span = span.clone();
            pool.spawn_detached(move || task.run().instrument(span));
            Some(handle)
        } else {
            None
        };

        let (done_tx, done_rx) = oneshot::channel();
        let supervisor = Supervisor {
            docs,
            conn: conn.clone(),
            pool: pool.handle().clone(),
            options,
            cancel: cancel.clone(),
            checkpointer: checkpointer.clone(),
            key,
            subchanges_rx,
            changes_rx: Some(changes_rx),
            revs_rx: Some(revs_rx),
            get_checkpoint_rx,
            set_checkpoint_rx,
            push_done: None,
            pull_done: None,
            first_error: None,
        };
        pool.spawn_detached(move || {
            async move {
                done_tx.send(supervisor.run().await).ok();
            }
            .instrument(span)
        });

        Replicator {
            cancel,
            conn,
            checkpointer,
            pool: Some(pool),
            done: Some(done_rx),
        }
    }

    /// Wait for the session to finish.
    ///
    /// A one-shot session finishes when its active directions are caught up
    /// and checkpointed; passive and continuous sessions finish when the
    /// connection closes or [`stop`](Self::stop) is called.
    pub async fn join(&mut self) -> Result<()> {
        match self.done.take() {
            Some(done) => done.await.map_err(|_| Error::Disconnected)?,
            None => Ok(()),
        }
    }

    /// Flush the checkpoint, close the connection, and release resources.
    pub async fn stop(mut self) -> Result<()> {
        debug!("stopping replicator");
        if let Some(checkpointer) = &self.checkpointer {
            checkpointer.flush().await;
        }
        self.cancel.cancel();
        self.conn.close();
        if let Some(done) = self.done.take() {
            done.await.ok();
        }
        if let Some(pool) = self.pool.take() {
            tokio::task::spawn_blocking(move || pool.shutdown())
                .await
                .map_err(|_| Error::Internal("pool shutdown failed".into()))?;
        }
        Ok(())
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.conn.close();
        // Dropping the pool joins the workers once their tasks notice the
        // cancellation.
    }
}

struct Supervisor {
    docs: DocsHandle,
    conn: ConnectionHandle,
    pool: LocalPoolHandle,
    options: SessionOptions,
    cancel: CancellationToken,
    checkpointer: Option<CheckpointerHandle>,
    key: String,
    subchanges_rx: mpsc::Receiver<IncomingRequest>,
    changes_rx: Option<mpsc::Receiver<IncomingRequest>>,
    revs_rx: Option<mpsc::Receiver<IncomingRequest>>,
    get_checkpoint_rx: mpsc::Receiver<IncomingRequest>,
    set_checkpoint_rx: mpsc::Receiver<IncomingRequest>,
    push_done: Option<oneshot::Receiver<Result<()>>>,
    pull_done: Option<oneshot::Receiver<Result<()>>>,
    first_error: Option<Error>,
}

impl Supervisor {
    async fn run(mut self) -> Result<()> {
        match self.start_directions().await {
            Ok(()) => self.serve().await,
            Err(err) => self.first_error = Some(err),
        }

        if let Some(checkpointer) = &self.checkpointer {
            checkpointer.flush().await;
        }
        self.cancel.cancel();
        self.conn.close();
        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn serve(&mut self) {
        let closed = self.conn.closed();
        loop {
            // Finished (or failed) active directions end the session unless
            // a passive role keeps it alive for the peer.
            if self.push_done.is_none()
                && self.pull_done.is_none()
                && !self.options.has_passive_role()
            {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = closed.cancelled() => {
                    debug!("connection closed");
                    break;
                }
                result = recv_done(&mut self.push_done) => self.note_result("push", result),
                result = recv_done(&mut self.pull_done) => self.note_result("pull", result),
                Some(request) = self.subchanges_rx.recv() => self.handle_subchanges(request).await,
                Some(request) = self.get_checkpoint_rx.recv() => self.handle_get_checkpoint(request).await,
                Some(request) = self.set_checkpoint_rx.recv() => self.handle_set_checkpoint(request).await,
            }
        }
    }

    async fn start_directions(&mut self) -> Result<()> {
        let start = if self.options.push.is_active() || self.options.pull.is_active() {
            // Keep answering the peer's checkpoint requests while fetching
            // ours, or two mutually active peers would wait on each other.
            let load = load_checkpoint(&self.docs, &self.conn, &self.key);
            tokio::pin!(load);
            let start = loop {
                tokio::select! {
                    start = &mut load => break start,
                    _ = self.cancel.cancelled() => break Checkpoint::default(),
                    Some(request) = self.get_checkpoint_rx.recv() => self.handle_get_checkpoint(request).await,
                    Some(request) = self.set_checkpoint_rx.recv() => self.handle_set_checkpoint(request).await,
                }
            };
            debug!(local = start.local, remote = start.remote, "resuming from checkpoint");
            start
        } else {
            Checkpoint::default()
        };

        if self.options.push.is_active() {
            let feed = self.docs.subscribe().await?;
            let pusher = Pusher::new(
                self.docs.clone(),
                self.conn.clone(),
                self.checkpointer.clone(),
                self.cancel.child_token(),
                self.options.push.is_continuous(),
                self.options.changes_batch_size,
                feed,
            );
            let (tx, rx) = oneshot::channel();
            let since = start.local;
            self.pool.spawn_detached(move || async move {
                tx.send(pusher.run(since).await).ok();
            });
            self.push_done = Some(rx);
        }

        match self.options.pull {
            Mode::Disabled => {
                // Dropping the receivers makes the connection refuse pushes.
                self.changes_rx = None;
                self.revs_rx = None;
            }
            pull => {
                let puller = Puller::new(
                    self.docs.clone(),
                    self.checkpointer.clone(),
                    self.cancel.child_token(),
                    self.changes_rx.take().expect("taken once"),
                    self.revs_rx.take().expect("taken once"),
                    pull.is_continuous(),
                );
                let conn = self.conn.clone();
                let since = pull.is_active().then_some(start.remote);
                let (tx, rx) = oneshot::channel();
                self.pool.spawn_detached(move || async move {
                    tx.send(puller.run(conn, since).await).ok();
                });
                if pull.is_active() {
                    self.pull_done = Some(rx);
                }
            }
        }
        Ok(())
    }

    fn note_result(&mut self, direction: &str, result: Result<()>) {
        match result {
            Ok(()) => debug!("{direction} finished"),
            Err(err) => {
                warn!("{direction} failed: {err}");
                if self.first_error.is_none() {
                    self.first_error = Some(err);
                }
            }
        }
    }

    async fn handle_subchanges(&mut self, request: IncomingRequest) {
        if self.options.push != Mode::Passive {
            debug!("refusing subChanges, push is not passive here");
            request.responder.err(&Error::Unimplemented).ok();
            return;
        }
        let since = proto::property(&request.properties, "since")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let continuous = proto::property(&request.properties, "continuous")
            .map(|value| value == "true")
            .unwrap_or(false);
        debug!(since, continuous, "peer subscribed to our changes");
        let feed = match self.docs.subscribe().await {
            Ok(feed) => feed,
            Err(err) => {
                request.responder.err(&err).ok();
                return;
            }
        };
        request.responder.ok(Bytes::new()).ok();
        let pusher = Pusher::new(
            self.docs.clone(),
            self.conn.clone(),
            None,
            self.cancel.child_token(),
            continuous,
            self.options.changes_batch_size,
            feed,
        );
        self.pool.spawn_detached(move || async move {
            if let Err(err) = pusher.run(since).await {
                warn!("passive push failed: {err}");
            }
        });
    }

    async fn handle_get_checkpoint(&self, request: IncomingRequest) {
        let Some(client) = proto::property(&request.properties, "client").map(str::to_owned)
        else {
            request.responder.err(&Error::NotFound).ok();
            return;
        };
        match self.docs.get_meta(format!("checkpoint/{client}")).await {
            Ok(Some(body)) => request.responder.ok(body).ok(),
            Ok(None) => request.responder.err(&Error::NotFound).ok(),
            Err(err) => request.responder.err(&err).ok(),
        };
    }

    async fn handle_set_checkpoint(&self, request: IncomingRequest) {
        let Some(client) = proto::property(&request.properties, "client").map(str::to_owned)
        else {
            request.responder.err(&Error::NotFound).ok();
            return;
        };
        match self
            .docs
            .put_meta(format!("checkpoint/{client}"), request.body.clone())
            .await
        {
            Ok(()) => request.responder.ok(Bytes::new()).ok(),
            Err(err) => request.responder.err(&err).ok(),
        };
    }
}

// Prefer a matching pair; on mismatch fall back to the smaller one so no
// sequence is ever skipped.
async fn load_checkpoint(docs: &DocsHandle, conn: &ConnectionHandle, key: &str) -> Checkpoint {
    let local = match docs.get_meta(format!("checkpoint/{key}")).await {
        Ok(Some(body)) => Checkpoint::from_json(&body).ok(),
        _ => None,
    };
    let properties = vec![("client".to_owned(), key.to_owned())];
    let remote = match conn
        .request(Profile::GetCheckpoint, properties, Bytes::new())
        .await
    {
        Ok(reply) => Checkpoint::from_json(&reply.body).ok(),
        Err(err) => {
            debug!("no remote checkpoint: {err}");
            None
        }
    };
    match (local, remote) {
        (Some(local), Some(remote)) if local == remote => local,
        (Some(local), Some(remote)) => {
            warn!(?local, ?remote, "checkpoint mismatch, using the safe pair");
            Checkpoint {
                local: local.local.min(remote.local),
                remote: local.remote.min(remote.remote),
            }
        }
        (Some(local), None) => local,
        (None, Some(remote)) => remote,
        (None, None) => Checkpoint::default(),
    }
}

fn recv_done<'a>(
    slot: &'a mut Option<oneshot::Receiver<Result<()>>>,
) -> impl std::future::Future<Output = Result<()>> + 'a {
    futures::future::poll_fn(move |cx| match slot.as_mut() {
        Some(rx) => match Pin::new(rx).poll(cx) {
            Poll::Ready(result) => {
                *slot = None;
                Poll::Ready(result.unwrap_or(Err(Error::Disconnected)))
            }
            Poll::Pending => Poll::Pending,
        },
        None => Poll::Pending,
    })
}
