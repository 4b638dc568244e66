//! The database actor.
//!
//! All store access is serialized through one mailbox drained by a dedicated
//! thread, so neither the [`Store`] nor a loaded [`Document`] is ever
//! touched concurrently. Callers hold a cloneable [`DocsHandle`] whose async
//! methods enqueue an action and await its oneshot reply. Failures travel
//! back as [`Error`] values; nothing crosses the mailbox as a panic.
//!
//! The actor also publishes every committed write to its subscribers as a
//! [`DocChange`], which is what a continuous push replication listens to.

use bytes::Bytes;
use drift_base::{Error, Result, RevId};
use tokio::sync::oneshot;
use tracing::{error, error_span, trace, warn};

use crate::doc::{DocFlags, DocId, Document};
use crate::rev::RevFlags;
use crate::store::Store;

const ACTION_CAP: usize = 128;

/// One committed write, as seen on the change feed.
#[derive(Debug, Clone)]
pub struct DocChange {
    /// Sequence assigned to the write.
    pub sequence: u64,
    /// The document that changed.
    pub doc_id: DocId,
    /// Its winning revision after the write.
    pub rev_id: RevId,
    /// Whether that revision is a tombstone.
    pub deleted: bool,
}

/// Outcome of [`DocsHandle::put_revision`].
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Id of the inserted (or already present) revision.
    pub rev_id: RevId,
    /// Sequence of the save, or of the last save when nothing changed.
    pub sequence: u64,
}

/// Outcome of [`DocsHandle::insert_history`].
#[derive(Debug, Clone)]
pub struct HistoryResult {
    /// Index into the offered history of the first revision we already had;
    /// the history length when the whole chain was new.
    pub common_ancestor: usize,
    /// Sequence of the save, or `None` when everything was known already.
    pub sequence: Option<u64>,
}

/// Answer for one entry of an offered change batch.
#[derive(Debug, Clone)]
pub struct ChangeDecision {
    /// Whether the revision is unknown here and should be sent.
    pub interested: bool,
    /// Local leaf revisions the sender may truncate its history at.
    pub ancestors: Vec<RevId>,
}

/// A revision read out for sending to a peer.
#[derive(Debug, Clone)]
pub struct RevPayload {
    /// The revision id followed by its ancestry, newest first, truncated at
    /// the first ancestor the peer declared known.
    pub history: Vec<RevId>,
    /// The revision body.
    pub body: Bytes,
    /// Tombstone flag.
    pub deleted: bool,
    /// Whether the body references stored blobs.
    pub has_attachments: bool,
}

/// Tunables for the database actor.
#[derive(Debug, Clone, Copy)]
pub struct DocsOptions {
    /// Revision-tree depth enforced after every insert.
    pub rev_tree_depth: usize,
    /// Most ancestor hints disclosed per change answer, and the history cap
    /// when the peer disclosed nothing useful.
    pub max_ancestors: usize,
}

impl Default for DocsOptions {
    fn default() -> Self {
        Self {
            rev_tree_depth: 20,
            max_ancestors: 20,
        }
    }
}

#[derive(derive_more::Debug, strum::Display)]
enum Action {
    GetDocument {
        id: DocId,
        with_bodies: bool,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Option<Document>>>,
    },
    PutRevision {
        id: DocId,
        rev_id: Option<RevId>,
        parent: Option<RevId>,
        body: Option<Bytes>,
        flags: RevFlags,
        allow_conflict: bool,
        #[debug("reply")]
        reply: oneshot::Sender<Result<PutResult>>,
    },
    InsertHistory {
        id: DocId,
        history: Vec<RevId>,
        body: Bytes,
        flags: RevFlags,
        #[debug("reply")]
        reply: oneshot::Sender<Result<HistoryResult>>,
    },
    ResolveConflict {
        id: DocId,
        winner: RevId,
        loser: RevId,
        merged_body: Option<Bytes>,
        #[debug("reply")]
        reply: oneshot::Sender<Result<RevId>>,
    },
    ChangesSince {
        since: u64,
        limit: usize,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<DocChange>>>,
    },
    FilterChanges {
        changes: Vec<(DocId, RevId)>,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<ChangeDecision>>>,
    },
    RevToSend {
        id: DocId,
        rev_id: RevId,
        known: Vec<RevId>,
        #[debug("reply")]
        reply: oneshot::Sender<Result<RevPayload>>,
    },
    LastSequence {
        #[debug("reply")]
        reply: oneshot::Sender<Result<u64>>,
    },
    GetMeta {
        name: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Option<Bytes>>>,
    },
    PutMeta {
        name: String,
        value: Bytes,
        #[debug("reply")]
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        #[debug("reply")]
        reply: oneshot::Sender<flume::Receiver<DocChange>>,
    },
    Shutdown,
}

/// Cloneable handle to a spawned database actor.
#[derive(Debug, Clone)]
pub struct DocsHandle {
    tx: flume::Sender<Action>,
}

impl DocsHandle {
    /// Spawn the actor thread over `store`.
    pub fn spawn<S: Store>(store: S, options: DocsOptions, name: impl Into<String>) -> Self {
        let (tx, action_rx) = flume::bounded(ACTION_CAP);
        let mut actor = Actor {
            store,
            options,
            action_rx,
            subscribers: Vec::new(),
        };
        let name = name.into();
        std::thread::Builder::new()
            .name("drift-docs".into())
            .spawn(move || {
                let span = error_span!("docs", %name);
                let _enter = span.enter();
                actor.run();
            })
            .expect("failed to spawn docs actor thread");
        DocsHandle { tx }
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// Fetch a document; `with_bodies` false loads metadata only.
    pub async fn get_document(&self, id: DocId, with_bodies: bool) -> Result<Option<Document>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetDocument {
            id,
            with_bodies,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Insert a locally created revision and save the document.
    ///
    /// With `rev_id` `None`, the id is derived from the parent and body.
    pub async fn put_revision(
        &self,
        id: DocId,
        rev_id: Option<RevId>,
        parent: Option<RevId>,
        body: Option<Bytes>,
        flags: RevFlags,
        allow_conflict: bool,
    ) -> Result<PutResult> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::PutRevision {
            id,
            rev_id,
            parent,
            body,
            flags,
            allow_conflict,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Insert a revision pulled from a peer, with its ancestry.
    pub async fn insert_history(
        &self,
        id: DocId,
        history: Vec<RevId>,
        body: Bytes,
        flags: RevFlags,
    ) -> Result<HistoryResult> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::InsertHistory {
            id,
            history,
            body,
            flags,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Resolve a conflict between two leaves of a document.
    pub async fn resolve_conflict(
        &self,
        id: DocId,
        winner: RevId,
        loser: RevId,
        merged_body: Option<Bytes>,
    ) -> Result<RevId> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::ResolveConflict {
            id,
            winner,
            loser,
            merged_body,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Changes with `sequence > since`, in sequence order.
    pub async fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<DocChange>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::ChangesSince {
            since,
            limit,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// For each offered `(doc, rev)`, decide whether we want it.
    pub async fn filter_changes(
        &self,
        changes: Vec<(DocId, RevId)>,
    ) -> Result<Vec<ChangeDecision>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::FilterChanges { changes, reply }).await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Read a revision with its history for sending to a peer.
    pub async fn rev_to_send(
        &self,
        id: DocId,
        rev_id: RevId,
        known: Vec<RevId>,
    ) -> Result<RevPayload> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::RevToSend {
            id,
            rev_id,
            known,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// The store's highest assigned sequence.
    pub async fn last_sequence(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::LastSequence { reply }).await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Read a named metadata blob.
    pub async fn get_meta(&self, name: impl Into<String>) -> Result<Option<Bytes>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetMeta {
            name: name.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Write a named metadata blob.
    pub async fn put_meta(&self, name: impl Into<String>, value: Bytes) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::PutMeta {
            name: name.into(),
            value,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Subscribe to the committed-change feed.
    pub async fn subscribe(&self) -> Result<flume::Receiver<DocChange>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Subscribe { reply }).await?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Stop the actor after it drains the actions already queued.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Action::Shutdown).await
    }
}

struct Actor<S> {
    store: S,
    options: DocsOptions,
    action_rx: flume::Receiver<Action>,
    subscribers: Vec<flume::Sender<DocChange>>,
}

impl<S: Store> Actor<S> {
    fn run(&mut self) {
        while let Ok(action) = self.action_rx.recv() {
            trace!(%action, "handling action");
            if !self.handle(action) {
                break;
            }
        }
        trace!("docs actor stopped");
    }

    fn handle(&mut self, action: Action) -> bool {
        match action {
            Action::GetDocument {
                id,
                with_bodies,
                reply,
            } => send_reply(reply, self.get_document(&id, with_bodies)),
            Action::PutRevision {
                id,
                rev_id,
                parent,
                body,
                flags,
                allow_conflict,
                reply,
            } => send_reply(
                reply,
                self.put_revision(id, rev_id, parent, body, flags, allow_conflict),
            ),
            Action::InsertHistory {
                id,
                history,
                body,
                flags,
                reply,
            } => send_reply(reply, self.insert_history(id, history, body, flags)),
            Action::ResolveConflict {
                id,
                winner,
                loser,
                merged_body,
                reply,
            } => send_reply(reply, self.resolve_conflict(id, winner, loser, merged_body)),
            Action::ChangesSince {
                since,
                limit,
                reply,
            } => send_reply(reply, self.changes_since(since, limit)),
            Action::FilterChanges { changes, reply } => {
                send_reply(reply, self.filter_changes(changes))
            }
            Action::RevToSend {
                id,
                rev_id,
                known,
                reply,
            } => send_reply(reply, self.rev_to_send(&id, &rev_id, &known)),
            Action::LastSequence { reply } => {
                send_reply(reply, Ok(self.store.last_sequence()))
            }
            Action::GetMeta { name, reply } => send_reply(reply, self.store.get_meta(&name)),
            Action::PutMeta { name, value, reply } => {
                send_reply(reply, self.store.put_meta(&name, value))
            }
            Action::Subscribe { reply } => {
                let (tx, rx) = flume::unbounded();
                self.subscribers.push(tx);
                reply.send(rx).ok();
                true
            }
            Action::Shutdown => false,
        }
    }

    fn get_document(&self, id: &DocId, with_bodies: bool) -> Result<Option<Document>> {
        let Some(record) = self.store.get(id)? else {
            return Ok(None);
        };
        if with_bodies {
            Ok(Some(Document::from_record(&record)?))
        } else {
            Ok(Some(Document::from_record_meta(&record)))
        }
    }

    fn put_revision(
        &mut self,
        id: DocId,
        rev_id: Option<RevId>,
        parent: Option<RevId>,
        body: Option<Bytes>,
        flags: RevFlags,
        allow_conflict: bool,
    ) -> Result<PutResult> {
        let mut doc =
            Document::load(&self.store, &id)?.unwrap_or_else(|| Document::new(id.clone()));
        let deleted = flags.contains(RevFlags::DELETED);
        let rev_id = match rev_id {
            Some(rev_id) => rev_id,
            None => RevId::derive(
                parent.as_ref(),
                deleted,
                body.as_deref().unwrap_or_default(),
            ),
        };
        let inserted =
            doc.tree_mut()
                .insert(rev_id.clone(), body, flags, parent.as_ref(), allow_conflict)?;
        if inserted.is_none() {
            return Ok(PutResult {
                rev_id,
                sequence: doc.sequence(),
            });
        }
        doc.tree_mut().prune(self.options.rev_tree_depth);
        let sequence = match doc.save(&mut self.store)? {
            Some(sequence) => sequence,
            None => doc.sequence(),
        };
        self.publish(DocChange {
            sequence,
            doc_id: id,
            rev_id: rev_id.clone(),
            deleted,
        });
        Ok(PutResult { rev_id, sequence })
    }

    fn insert_history(
        &mut self,
        id: DocId,
        history: Vec<RevId>,
        body: Bytes,
        flags: RevFlags,
    ) -> Result<HistoryResult> {
        if history.is_empty() {
            return Err(Error::BadRevId);
        }
        let mut doc =
            Document::load(&self.store, &id)?.unwrap_or_else(|| Document::new(id.clone()));
        {
            let tree = doc.tree();
            let connects = history.iter().any(|rev_id| tree.get(rev_id).is_some());
            let reaches_root = history.last().map(|r| r.gen() == 1).unwrap_or(false);
            // A non-empty tree needs the chain to connect somewhere; if it
            // doesn't, the peer has to retry with deeper history.
            if !tree.is_empty() && !connects && !reaches_root {
                return Err(Error::NotFound);
            }
        }
        let flags = flags | RevFlags::FOREIGN;
        let common_ancestor = doc
            .tree_mut()
            .insert_history(&history, Some(body), flags)?;
        doc.tree_mut().prune(self.options.rev_tree_depth);
        let sequence = doc.save(&mut self.store)?;
        if let Some(sequence) = sequence {
            self.publish(DocChange {
                sequence,
                doc_id: id,
                rev_id: history[0].clone(),
                deleted: flags.contains(RevFlags::DELETED),
            });
        }
        Ok(HistoryResult {
            common_ancestor,
            sequence,
        })
    }

    fn resolve_conflict(
        &mut self,
        id: DocId,
        winner: RevId,
        loser: RevId,
        merged_body: Option<Bytes>,
    ) -> Result<RevId> {
        let mut doc = Document::load(&self.store, &id)?.ok_or(Error::NotFound)?;
        let deleted = merged_body.is_none();
        let merged = doc
            .tree_mut()
            .resolve_conflict(&winner, &loser, merged_body)?;
        let sequence = doc.save(&mut self.store)?;
        if let Some(sequence) = sequence {
            self.publish(DocChange {
                sequence,
                doc_id: id,
                rev_id: merged.clone(),
                deleted,
            });
        }
        Ok(merged)
    }

    fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<DocChange>> {
        let records = self.store.changes_since(since, limit)?;
        let mut changes = Vec::with_capacity(records.len());
        for record in records {
            let Some(rev_id) = record.rev_id else {
                warn!(doc = %record.doc_id, "record without a winning revision, skipping");
                continue;
            };
            changes.push(DocChange {
                sequence: record.sequence,
                doc_id: record.doc_id,
                rev_id,
                deleted: record.flags.contains(DocFlags::DELETED),
            });
        }
        Ok(changes)
    }

    fn filter_changes(&self, changes: Vec<(DocId, RevId)>) -> Result<Vec<ChangeDecision>> {
        let mut decisions = Vec::with_capacity(changes.len());
        for (doc_id, rev_id) in changes {
            let decision = match self.store.get(&doc_id)? {
                None => ChangeDecision {
                    interested: true,
                    ancestors: Vec::new(),
                },
                Some(record) => {
                    let doc = Document::from_record(&record)?;
                    if doc.tree().get(&rev_id).is_some() {
                        ChangeDecision {
                            interested: false,
                            ancestors: Vec::new(),
                        }
                    } else {
                        let ancestors = doc
                            .tree()
                            .leaves()
                            .map(|rev| rev.rev_id().clone())
                            .take(self.options.max_ancestors)
                            .collect();
                        ChangeDecision {
                            interested: true,
                            ancestors,
                        }
                    }
                }
            };
            decisions.push(decision);
        }
        Ok(decisions)
    }

    fn rev_to_send(&self, id: &DocId, rev_id: &RevId, known: &[RevId]) -> Result<RevPayload> {
        let record = self.store.get(id)?.ok_or(Error::NotFound)?;
        let mut doc = Document::from_record_meta(&record);
        doc.ensure_loaded(&self.store)?;
        let tree = doc.tree();
        let index = tree.index_of(rev_id).ok_or(Error::NotFound)?;
        let rev = tree.rev(index);
        let body = rev.body().cloned().ok_or(Error::NotFound)?;
        let deleted = rev.is_deleted();
        let has_attachments = rev.has_attachments();

        // Send the ancestry only as far as the peer needs it.
        let mut history = Vec::new();
        for ancestor in tree.history(index) {
            history.push(ancestor.rev_id().clone());
            if known.contains(ancestor.rev_id()) {
                break;
            }
            if history.len() >= self.options.max_ancestors {
                break;
            }
        }
        Ok(RevPayload {
            history,
            body,
            deleted,
            has_attachments,
        })
    }

    fn publish(&mut self, change: DocChange) {
        self.subscribers
            .retain(|subscriber| match subscriber.send(change.clone()) {
                Ok(()) => true,
                Err(_) => {
                    trace!("dropping dead change subscriber");
                    false
                }
            });
    }
}

fn send_reply<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> bool {
    if let Err(result) = reply.send(result) {
        if let Err(err) = result {
            error!("docs actor reply dropped, failure was: {err:?}");
        }
    }
    true
}
