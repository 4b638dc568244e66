//! The connection actor: owns the framed transport.
//!
//! Outbound requests are allocated an id and a pending oneshot; inbound
//! responses complete them. Inbound requests are dispatched by profile to
//! the handler channel registered for it, carrying a single-use
//! [`Responder`]. Closing the connection completes every pending request
//! with [`Error::Disconnected`] and closes the handler channels.
//!
//! The command channel is unbounded so a handler can always enqueue its
//! response without waiting on the connection loop; reading frames is where
//! backpressure applies (a full handler channel stops the read side).

use std::collections::HashMap;

use bytes::Bytes;
use drift_base::{Error, Result};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::proto::{Frame, FrameCodec, Profile, Properties, WireError};

/// A successful response to a request.
#[derive(Debug)]
pub(crate) struct Reply {
    /// Response properties.
    #[allow(dead_code)]
    pub properties: Properties,
    /// Response body.
    pub body: Bytes,
}

/// An inbound request routed to a registered handler.
#[derive(Debug)]
pub(crate) struct IncomingRequest {
    pub properties: Properties,
    pub body: Bytes,
    pub responder: Responder,
}

/// Replies exactly once to one inbound request.
#[derive(Debug)]
pub(crate) struct Responder {
    id: u64,
    cmd: mpsc::UnboundedSender<Command>,
}

impl Responder {
    /// Answer with a successful body.
    pub fn ok(self, body: Bytes) -> Result<()> {
        self.respond(None, Vec::new(), body)
    }

    /// Answer with a structured error.
    pub fn err(self, error: &Error) -> Result<()> {
        self.respond(Some(WireError::from(error)), Vec::new(), Bytes::new())
    }

    fn respond(
        self,
        error: Option<WireError>,
        properties: Properties,
        body: Bytes,
    ) -> Result<()> {
        self.cmd
            .send(Command::Respond {
                id: self.id,
                error,
                properties,
                body,
            })
            .map_err(|_| Error::Disconnected)
    }
}

enum Command {
    Request {
        profile: Profile,
        properties: Properties,
        body: Bytes,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Respond {
        id: u64,
        error: Option<WireError>,
        properties: Properties,
        body: Bytes,
    },
    Close,
}

/// Registry of inbound-request handlers, keyed by profile.
#[derive(Debug, Default)]
pub(crate) struct HandlerMap {
    inner: HashMap<Profile, mpsc::Sender<IncomingRequest>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler channel for `profile` and return its receiver.
    pub fn register(
        &mut self,
        profile: Profile,
        capacity: usize,
    ) -> mpsc::Receiver<IncomingRequest> {
        let (tx, rx) = mpsc::channel(capacity);
        self.inner.insert(profile, tx);
        rx
    }
}

/// Cloneable handle to a running [`Connection`].
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    cmd: mpsc::UnboundedSender<Command>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Send a request and await its reply.
    pub async fn request(
        &self,
        profile: Profile,
        properties: Properties,
        body: Bytes,
    ) -> Result<Reply> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Command::Request {
                profile,
                properties,
                body,
                reply,
            })
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Ask the connection to shut down.
    pub fn close(&self) {
        self.cmd.send(Command::Close).ok();
    }

    /// A token cancelled when the connection loop exits.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// The actor driving one framed bidirectional transport.
pub(crate) struct Connection<T> {
    read: FramedRead<tokio::io::ReadHalf<T>, FrameCodec>,
    write: FramedWrite<tokio::io::WriteHalf<T>, FrameCodec>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    handlers: HashMap<Profile, mpsc::Sender<IncomingRequest>>,
    pending: HashMap<u64, oneshot::Sender<Result<Reply>>>,
    next_id: u64,
    closed: CancellationToken,
}

impl<T: AsyncRead + AsyncWrite> Connection<T> {
    /// Wrap a transport. The returned future must be spawned to drive it.
    pub fn new(io: T, handlers: HandlerMap) -> (ConnectionHandle, Self) {
        let (read_half, write_half) = tokio::io::split(io);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let handle = ConnectionHandle {
            cmd: cmd_tx.clone(),
            closed: closed.clone(),
        };
        let conn = Connection {
            read: FramedRead::new(read_half, FrameCodec),
            write: FramedWrite::new(write_half, FrameCodec),
            cmd_tx,
            cmd_rx,
            handlers: handlers.inner,
            pending: HashMap::new(),
            next_id: 1,
            closed,
        };
        (handle, conn)
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Request { profile, properties, body, reply }) => {
                        let id = self.next_id;
                        self.next_id += 1;
                        trace!(%profile, id, "sending request");
                        self.pending.insert(id, reply);
                        let frame = Frame::Request { id, profile, properties, body };
                        if let Err(err) = self.write.send(frame).await {
                            warn!("write failed, closing connection: {err:#}");
                            break;
                        }
                    }
                    Some(Command::Respond { id, error, properties, body }) => {
                        trace!(id, failed = error.is_some(), "sending response");
                        let frame = Frame::Response { id, error, properties, body };
                        if let Err(err) = self.write.send(frame).await {
                            warn!("write failed, closing connection: {err:#}");
                            break;
                        }
                    }
                    Some(Command::Close) | None => break,
                },
                frame = self.read.next() => match frame {
                    Some(Ok(frame)) => {
                        if !self.handle_frame(frame).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("closing connection on undecodable frame: {err:#}");
                        break;
                    }
                    None => {
                        debug!("peer closed the connection");
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
    }

    async fn handle_frame(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Request {
                id,
                profile,
                properties,
                body,
            } => {
                trace!(%profile, id, "incoming request");
                let Some(handler) = self.handlers.get(&profile) else {
                    // Unknown profile: answer, then drop the connection.
                    warn!(%profile, "peer sent a request we do not serve");
                    self.respond_error(id, &Error::Unimplemented).await;
                    return false;
                };
                let request = IncomingRequest {
                    properties,
                    body,
                    responder: Responder {
                        id,
                        cmd: self.cmd_tx.clone(),
                    },
                };
                if handler.send(request).await.is_err() {
                    // Registered but no longer served (direction disabled or
                    // actor gone). Not fatal for the session.
                    debug!(%profile, "handler gone, refusing request");
                    self.respond_error(id, &Error::Unimplemented).await;
                }
                true
            }
            Frame::Response {
                id,
                error,
                properties,
                body,
            } => {
                let Some(reply) = self.pending.remove(&id) else {
                    warn!(id, "response for unknown request");
                    return false;
                };
                let result = match error {
                    Some(wire) => Err(Error::from(wire)),
                    None => Ok(Reply { properties, body }),
                };
                reply.send(result).ok();
                true
            }
        }
    }

    async fn respond_error(&mut self, id: u64, error: &Error) {
        let frame = Frame::Response {
            id,
            error: Some(WireError::from(error)),
            properties: Vec::new(),
            body: Bytes::new(),
        };
        if let Err(err) = self.write.send(frame).await {
            debug!("failed to send error response: {err:#}");
        }
    }

    async fn shutdown(mut self) {
        self.closed.cancel();
        for (_, reply) in self.pending.drain() {
            reply.send(Err(Error::Disconnected)).ok();
        }
        // Dropping the handler senders closes the inbound streams.
        self.handlers.clear();
        if let Err(err) = self.write.close().await {
            trace!("transport close failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{decode_body, encode_body};

    fn spawn_pair() -> (
        ConnectionHandle,
        ConnectionHandle,
        mpsc::Receiver<IncomingRequest>,
    ) {
        let (a_io, b_io) = tokio::io::duplex(4096);
        let (a_handle, a_conn) = Connection::new(a_io, HandlerMap::new());
        let mut handlers = HandlerMap::new();
        let changes_rx = handlers.register(Profile::Changes, 4);
        let (b_handle, b_conn) = Connection::new(b_io, handlers);
        tokio::spawn(a_conn.run());
        tokio::spawn(b_conn.run());
        (a_handle, b_handle, changes_rx)
    }

    #[tokio::test]
    async fn request_reply() {
        let (a, _b, mut changes_rx) = spawn_pair();

        let server = tokio::spawn(async move {
            let request = changes_rx.recv().await.unwrap();
            let n: u64 = decode_body(&request.body).unwrap();
            request
                .responder
                .ok(encode_body(&(n * 2)).unwrap())
                .unwrap();
        });

        let reply = a
            .request(Profile::Changes, Vec::new(), encode_body(&21u64).unwrap())
            .await
            .unwrap();
        assert_eq!(decode_body::<u64>(&reply.body).unwrap(), 42);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_reply() {
        let (a, _b, mut changes_rx) = spawn_pair();

        tokio::spawn(async move {
            let request = changes_rx.recv().await.unwrap();
            request.responder.err(&Error::NotFound).unwrap();
        });

        let err = a
            .request(Profile::Changes, Vec::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn unknown_profile_closes_connection() {
        let (a, _b, _changes_rx) = spawn_pair();

        let err = a
            .request(Profile::Rev, Vec::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unimplemented | Error::Disconnected));
        a.closed().cancelled().await;
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (a, b, mut changes_rx) = spawn_pair();

        let pending = tokio::spawn({
            let a = a.clone();
            async move { a.request(Profile::Changes, Vec::new(), Bytes::new()).await }
        });
        // Request arrives but is never answered.
        let _held = changes_rx.recv().await.unwrap();
        b.close();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Disconnected));
        a.closed().cancelled().await;
    }
}
