//! The pull side of a replication session.
//!
//! An active puller subscribes to the peer's changes with `subChanges`; a
//! passive one just serves whatever the peer pushes. Either way, incoming
//! `changes` batches are answered entry by entry (skip, or send with local
//! ancestor hints) and incoming `rev` messages are applied to the target
//! document's tree. Revisions are applied one at a time; the bounded handler
//! channel is what pushes back on the wire.

use bytes::Bytes;
use drift_base::{Error, Result, SequenceSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use drift_docs::actor::DocsHandle;
use drift_docs::RevFlags;

use crate::checkpoint::CheckpointerHandle;
use crate::conn::{ConnectionHandle, IncomingRequest};
use crate::proto::{self, ChangeAnswer, ChangeEntry, Profile, RevMessage};

pub(crate) struct Puller {
    docs: DocsHandle,
    checkpointer: Option<CheckpointerHandle>,
    cancel: CancellationToken,
    changes_rx: mpsc::Receiver<IncomingRequest>,
    revs_rx: mpsc::Receiver<IncomingRequest>,
    continuous: bool,
    one_shot: bool,
    /// Remote sequences offered but not yet stored.
    pending: SequenceSet,
    caught_up: bool,
}

impl Puller {
    pub fn new(
        docs: DocsHandle,
        checkpointer: Option<CheckpointerHandle>,
        cancel: CancellationToken,
        changes_rx: mpsc::Receiver<IncomingRequest>,
        revs_rx: mpsc::Receiver<IncomingRequest>,
        continuous: bool,
    ) -> Self {
        Puller {
            docs,
            checkpointer,
            cancel,
            changes_rx,
            revs_rx,
            continuous,
            one_shot: false,
            pending: SequenceSet::new(),
            caught_up: false,
        }
    }

    /// Serve the pull direction. `subscribe_since` is set when we initiate
    /// the pull; a passive puller only answers.
    pub async fn run(
        mut self,
        conn: ConnectionHandle,
        subscribe_since: Option<u64>,
    ) -> Result<()> {
        if let Some(since) = subscribe_since {
            debug!(since, continuous = self.continuous, "subscribing to peer changes");
            self.one_shot = !self.continuous;
            self.pending.clear(since);
            let properties = vec![
                ("since".to_owned(), since.to_string()),
                ("continuous".to_owned(), self.continuous.to_string()),
            ];
            conn.request(Profile::SubChanges, properties, Bytes::new())
                .await?;
        }
        loop {
            if self.is_done() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("puller cancelled");
                    return Ok(());
                }
                request = self.changes_rx.recv() => match request {
                    Some(request) => self.handle_changes(request).await,
                    None => break, // connection closed
                },
                request = self.revs_rx.recv() => match request {
                    Some(request) => self.handle_rev(request).await,
                    None => break,
                },
            }
        }
        debug!("puller finished");
        Ok(())
    }

    async fn handle_changes(&mut self, request: IncomingRequest) {
        let entries: Vec<ChangeEntry> = match proto::decode_body(&request.body) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("undecodable changes batch: {err}");
                request.responder.err(&err).ok();
                return;
            }
        };
        if entries.is_empty() {
            debug!("peer is caught up");
            self.caught_up = true;
            match proto::encode_body(&Vec::<ChangeAnswer>::new()) {
                Ok(body) => request.responder.ok(body).ok(),
                Err(err) => request.responder.err(&err).ok(),
            };
            return;
        }
        trace!(count = entries.len(), "peer offered changes");
        let keys = entries
            .iter()
            .map(|entry| (entry.doc_id.clone(), entry.rev_id.clone()))
            .collect();
        let decisions = match self.docs.filter_changes(keys).await {
            Ok(decisions) => decisions,
            Err(err) => {
                warn!("change filtering failed: {err}");
                request.responder.err(&err).ok();
                return;
            }
        };
        let mut answers = Vec::with_capacity(entries.len());
        for (entry, decision) in entries.iter().zip(decisions) {
            if decision.interested {
                self.pending.add(entry.sequence);
                answers.push(ChangeAnswer::Send {
                    ancestors: decision.ancestors,
                });
            } else {
                answers.push(ChangeAnswer::Skip);
                // Count it as received so the checkpoint can move past it.
                self.pending.add(entry.sequence);
                self.mark_complete(entry.sequence);
            }
        }
        match proto::encode_body(&answers) {
            Ok(body) => {
                request.responder.ok(body).ok();
            }
            Err(err) => {
                request.responder.err(&err).ok();
            }
        }
    }

    async fn handle_rev(&mut self, request: IncomingRequest) {
        let message: RevMessage = match proto::decode_body(&request.body) {
            Ok(message) => message,
            Err(err) => {
                warn!("undecodable rev message: {err}");
                request.responder.err(&err).ok();
                return;
            }
        };
        let Some(rev_id) = message.rev_id().cloned() else {
            request.responder.err(&Error::BadRevId).ok();
            return;
        };
        let sequence: Option<u64> = proto::property(&request.properties, "sequence")
            .and_then(|value| value.parse().ok());

        let mut flags = RevFlags::NONE;
        if message.deleted {
            flags |= RevFlags::DELETED;
        }
        if message.has_attachments {
            flags |= RevFlags::HAS_ATTACHMENTS;
        }
        match self
            .docs
            .insert_history(
                message.doc_id.clone(),
                message.history,
                message.body,
                flags,
            )
            .await
        {
            Ok(outcome) => {
                trace!(
                    doc = %message.doc_id,
                    rev = %rev_id,
                    common = outcome.common_ancestor,
                    "stored pulled revision"
                );
                request.responder.ok(Bytes::new()).ok();
                if let Some(sequence) = sequence {
                    self.mark_complete(sequence);
                }
            }
            Err(err) => {
                // NotFound asks the peer to retry with deeper history; the
                // rest are permanent for this revision. Either way this
                // handler keeps serving.
                warn!(doc = %message.doc_id, rev = %rev_id, "failed to store pulled revision: {err}");
                request.responder.err(&err).ok();
            }
        }
    }

    fn mark_complete(&mut self, sequence: u64) {
        self.pending.remove(sequence);
        if let Some(checkpointer) = &self.checkpointer {
            checkpointer.update_remote(self.pending.checkpoint());
        }
    }

    fn is_done(&self) -> bool {
        self.one_shot && self.caught_up && self.pending.is_empty()
    }
}
