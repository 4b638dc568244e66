//! The push side of a replication session.
//!
//! The pusher reads change batches from the database, offers them to the
//! peer as `changes` requests, and sends the revisions the peer asked for as
//! `rev` requests. Two bounds throttle memory and pipeline depth: at most
//! [`MAX_CHANGE_LISTS_IN_FLIGHT`] unanswered change batches and at most
//! [`MAX_REVS_IN_FLIGHT`] revisions being sent. Completed sequences leave
//! the pending set and the checkpoint advances to just below the oldest
//! still-pending one.
//!
//! An empty change batch is sent as the caught-up marker. A continuous
//! pusher then switches to the database change feed; a one-shot pusher
//! drains its in-flight work and stops.

use std::collections::VecDeque;
use std::task::Poll;
use std::time::Duration;

use drift_base::{Error, Result, SequenceSet};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use drift_docs::actor::{DocChange, DocsHandle};
use drift_docs::RevId;

use crate::checkpoint::CheckpointerHandle;
use crate::conn::{ConnectionHandle, Reply};
use crate::proto::{self, ChangeAnswer, ChangeEntry, Profile, RevMessage};

/// Changes fetched from the database per batch.
pub(crate) const DEFAULT_CHANGES_BATCH_SIZE: usize = 200;
/// Unanswered `changes` requests allowed at once.
const MAX_CHANGE_LISTS_IN_FLIGHT: usize = 4;
/// `rev` requests allowed in flight at once.
const MAX_REVS_IN_FLIGHT: usize = 5;
const MAX_REV_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One revision the peer asked for.
#[derive(Debug)]
struct RevRequest {
    change: DocChange,
    /// Revisions the peer already has; history is truncated there.
    ancestors: Vec<RevId>,
    retries: u32,
}

pub(crate) struct Pusher {
    docs: DocsHandle,
    conn: ConnectionHandle,
    checkpointer: Option<CheckpointerHandle>,
    cancel: CancellationToken,
    continuous: bool,
    batch_size: usize,
    /// Sequences read from the database but not yet acknowledged.
    pending: SequenceSet,
    last_read: u64,
    caught_up: bool,
    change_lists_in_flight: usize,
    revs_in_flight: usize,
    revs_to_send: VecDeque<RevRequest>,
    get_changes: Option<BoxFuture<'static, Result<Vec<DocChange>>>>,
    change_replies: FuturesUnordered<BoxFuture<'static, (Vec<DocChange>, Result<Reply>)>>,
    rev_replies: FuturesUnordered<BoxFuture<'static, (RevRequest, Result<Reply>)>>,
    retry_queue: FuturesUnordered<BoxFuture<'static, RevRequest>>,
    feed: flume::Receiver<DocChange>,
    /// Feed changes waiting for a free change-list slot.
    feed_buffer: Vec<DocChange>,
    failed_revs: usize,
}

impl Pusher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        docs: DocsHandle,
        conn: ConnectionHandle,
        checkpointer: Option<CheckpointerHandle>,
        cancel: CancellationToken,
        continuous: bool,
        batch_size: usize,
        feed: flume::Receiver<DocChange>,
    ) -> Self {
        Pusher {
            docs,
            conn,
            checkpointer,
            cancel,
            continuous,
            batch_size,
            pending: SequenceSet::new(),
            last_read: 0,
            caught_up: false,
            change_lists_in_flight: 0,
            revs_in_flight: 0,
            revs_to_send: VecDeque::new(),
            get_changes: None,
            change_replies: FuturesUnordered::new(),
            rev_replies: FuturesUnordered::new(),
            retry_queue: FuturesUnordered::new(),
            feed,
            feed_buffer: Vec::new(),
            failed_revs: 0,
        }
    }

    /// Push everything after `since`, and keep going in continuous mode.
    pub async fn run(mut self, since: u64) -> Result<()> {
        debug!(since, continuous = self.continuous, "pusher starting");
        self.pending.clear(since);
        self.last_read = since;
        self.request_changes();
        loop {
            self.pump();
            if self.is_done() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("pusher cancelled");
                    return Ok(());
                }
                changes = next_slot(&mut self.get_changes) => {
                    match changes {
                        Ok(changes) => self.got_changes(changes),
                        Err(err) => {
                            warn!("reading changes failed: {err}");
                            return Err(err);
                        }
                    }
                }
                Some((changes, result)) = self.change_replies.next(), if !self.change_replies.is_empty() => {
                    self.on_changes_reply(changes, result)?;
                }
                Some((request, result)) = self.rev_replies.next(), if !self.rev_replies.is_empty() => {
                    self.on_rev_reply(request, result);
                }
                Some(request) = self.retry_queue.next(), if !self.retry_queue.is_empty() => {
                    self.revs_to_send.push_back(request);
                }
                change = self.feed.recv_async(), if self.caught_up && self.continuous => {
                    match change {
                        Ok(change) if change.sequence > self.last_read => {
                            self.pending.add(change.sequence);
                            self.last_read = change.sequence;
                            self.feed_buffer.push(change);
                        }
                        Ok(_) => {} // already covered by the backlog scan
                        Err(_) => {
                            debug!("change feed closed, stopping");
                            return Ok(());
                        }
                    }
                }
            }
        }
        debug!(failed = self.failed_revs, "pusher caught up and drained");
        Ok(())
    }

    fn got_changes(&mut self, changes: Vec<DocChange>) {
        if changes.is_empty() {
            if !self.caught_up {
                debug!(last_read = self.last_read, "caught up");
                self.caught_up = true;
                // An empty batch is the caught-up marker for the peer.
                self.send_changes(Vec::new());
            }
            return;
        }
        trace!(
            first = changes[0].sequence,
            count = changes.len(),
            "got changes from db"
        );
        for change in &changes {
            self.pending.add(change.sequence);
        }
        self.last_read = self
            .last_read
            .max(changes.last().expect("non-empty").sequence);
        self.send_changes(changes);
    }

    fn send_changes(&mut self, changes: Vec<DocChange>) {
        self.change_lists_in_flight += 1;
        let conn = self.conn.clone();
        self.change_replies.push(
            async move {
                let entries: Vec<ChangeEntry> = changes
                    .iter()
                    .map(|change| ChangeEntry {
                        sequence: change.sequence,
                        doc_id: change.doc_id.clone(),
                        rev_id: change.rev_id.clone(),
                        deleted: change.deleted,
                    })
                    .collect();
                let result = match proto::encode_body(&entries) {
                    Ok(body) => conn.request(Profile::Changes, Vec::new(), body).await,
                    Err(err) => Err(err),
                };
                (changes, result)
            }
            .boxed(),
        );
    }

    fn on_changes_reply(&mut self, changes: Vec<DocChange>, result: Result<Reply>) -> Result<()> {
        self.change_lists_in_flight -= 1;
        let reply = result?;
        let answers: Vec<ChangeAnswer> = proto::decode_body(&reply.body)?;
        if answers.len() != changes.len() {
            return Err(Error::Internal(format!(
                "peer answered {} of {} offered changes",
                answers.len(),
                changes.len()
            )));
        }
        for (change, answer) in changes.into_iter().zip(answers) {
            match answer {
                ChangeAnswer::Skip => {
                    trace!(seq = change.sequence, "peer skipped change");
                    self.mark_complete(change.sequence);
                }
                ChangeAnswer::Send { ancestors } => {
                    self.revs_to_send.push_back(RevRequest {
                        change,
                        ancestors,
                        retries: 0,
                    });
                }
            }
        }
        Ok(())
    }

    fn send_rev(&mut self, request: RevRequest) {
        self.revs_in_flight += 1;
        let docs = self.docs.clone();
        let conn = self.conn.clone();
        self.rev_replies.push(
            async move {
                let result = send_one_rev(&docs, &conn, &request).await;
                (request, result)
            }
            .boxed(),
        );
    }

    fn on_rev_reply(&mut self, mut request: RevRequest, result: Result<Reply>) {
        self.revs_in_flight -= 1;
        match result {
            Ok(_) => {
                trace!(doc = %request.change.doc_id, seq = request.change.sequence, "revision accepted");
                self.mark_complete(request.change.sequence);
            }
            Err(err) if err.is_transient() && request.retries < MAX_REV_RETRIES => {
                let delay = INITIAL_RETRY_DELAY * 2u32.pow(request.retries);
                debug!(
                    doc = %request.change.doc_id,
                    retries = request.retries,
                    "revision send failed, will retry: {err}"
                );
                if matches!(err, Error::NotFound) {
                    // The peer wants deeper history than its hints allowed.
                    request.ancestors.clear();
                }
                request.retries += 1;
                self.retry_queue.push(
                    async move {
                        tokio::time::sleep(delay).await;
                        request
                    }
                    .boxed(),
                );
            }
            Err(err) => {
                warn!(doc = %request.change.doc_id, "giving up on revision: {err}");
                self.failed_revs += 1;
                self.mark_complete(request.change.sequence);
            }
        }
    }

    fn mark_complete(&mut self, sequence: u64) {
        self.pending.remove(sequence);
        if let Some(checkpointer) = &self.checkpointer {
            checkpointer.update_local(self.pending.checkpoint());
        }
    }

    // Keep the pipelines full within their bounds.
    fn pump(&mut self) {
        if !self.caught_up
            && self.get_changes.is_none()
            && self.change_lists_in_flight < MAX_CHANGE_LISTS_IN_FLIGHT
        {
            self.request_changes();
        }
        if !self.feed_buffer.is_empty() && self.change_lists_in_flight < MAX_CHANGE_LISTS_IN_FLIGHT
        {
            let batch = std::mem::take(&mut self.feed_buffer);
            self.send_changes(batch);
        }
        while self.revs_in_flight < MAX_REVS_IN_FLIGHT {
            let Some(request) = self.revs_to_send.pop_front() else {
                break;
            };
            self.send_rev(request);
        }
    }

    fn request_changes(&mut self) {
        let docs = self.docs.clone();
        let since = self.last_read;
        let limit = self.batch_size;
        trace!(since, "requesting next change batch");
        self.get_changes = Some(async move { docs.changes_since(since, limit).await }.boxed());
    }

    fn is_done(&self) -> bool {
        !self.continuous
            && self.caught_up
            && self.get_changes.is_none()
            && self.change_lists_in_flight == 0
            && self.revs_in_flight == 0
            && self.revs_to_send.is_empty()
            && self.retry_queue.is_empty()
            && self.pending.is_empty()
    }
}

async fn send_one_rev(
    docs: &DocsHandle,
    conn: &ConnectionHandle,
    request: &RevRequest,
) -> Result<Reply> {
    let payload = docs
        .rev_to_send(
            request.change.doc_id.clone(),
            request.change.rev_id.clone(),
            request.ancestors.clone(),
        )
        .await?;
    let message = RevMessage {
        doc_id: request.change.doc_id.clone(),
        deleted: payload.deleted,
        has_attachments: payload.has_attachments,
        history: payload.history,
        body: payload.body,
    };
    let properties = vec![("sequence".to_owned(), request.change.sequence.to_string())];
    conn.request(Profile::Rev, properties, proto::encode_body(&message)?)
        .await
}

// Poll an optional in-flight future; pending while the slot is empty. The
// slot is cleared when the future resolves.
fn next_slot<'a, T>(
    slot: &'a mut Option<BoxFuture<'static, T>>,
) -> impl std::future::Future<Output = T> + 'a {
    futures::future::poll_fn(move |cx| match slot.as_mut() {
        Some(fut) => match fut.poll_unpin(cx) {
            Poll::Ready(value) => {
                *slot = None;
                Poll::Ready(value)
            }
            Poll::Pending => Poll::Pending,
        },
        None => Poll::Pending,
    })
}
