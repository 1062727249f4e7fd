use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::codec::ClientCodec;
use crate::command::{Command, Connect};
use crate::config::Config;
use crate::correlation::{IdGenerator, SequentialIds};
use crate::error::Error;
use crate::frame::{self, Request, Response, Value, HANDSHAKE_ID};
use crate::pending::PendingRequests;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", state)
    }
}

#[derive(Clone, Debug)]
struct Status {
    state: ConnectionState,
    /// Outcome of the handshake, set exactly once when the connection leaves `Connecting`.
    started: Option<Result<(), Error>>,
    /// First error that brought the connection down, if any.
    reason: Option<Error>,
}

struct Inner {
    id: Uuid,
    address: String,
    /// Sent in the handshake on both sockets; the peer pairs them by it.
    handshake_key: String,
    status: watch::Sender<Status>,
    pending: PendingRequests,
    ids: Box<dyn IdGenerator>,
    outgoing: mpsc::Sender<Request>,
    request_timeout: Option<Duration>,
    max_payload_length: usize,
}

/// One logical connection to the peer: a read stream for responses and a write stream for
/// requests, shared by any number of concurrent callers.
///
/// A `Connection` is a cheap handle; clones refer to the same connection. The I/O itself is done
/// by the [`Driver`] returned alongside it, which must be run (usually on a spawned task) for the
/// connection to make progress.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Drives the I/O of a [`Connection`]: handshake, read loop and writer task.
pub struct Driver {
    connection: Connection,
    outgoing: mpsc::Receiver<Request>,
}

impl Connection {
    /// Creates a connection in the `Connecting` state.
    pub fn new(config: &Config) -> (Connection, Driver) {
        Self::with_id_generator(config, SequentialIds::new())
    }

    pub fn with_id_generator(
        config: &Config,
        ids: impl IdGenerator + 'static,
    ) -> (Connection, Driver) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.write_queue_capacity.max(1));
        let (status, _) = watch::channel(Status {
            state: ConnectionState::Connecting,
            started: None,
            reason: None,
        });

        let id = Uuid::new_v4();
        let connection = Connection {
            inner: Arc::new(Inner {
                id,
                address: config.connection_address.clone(),
                handshake_key: format!("{}/{}", config.connection_address, id),
                status,
                pending: PendingRequests::new(),
                ids: Box::new(ids),
                outgoing: outgoing_tx,
                request_timeout: config.request_timeout,
                max_payload_length: config.max_payload_length,
            }),
        };

        let driver = Driver {
            connection: connection.clone(),
            outgoing: outgoing_rx,
        };

        (connection, driver)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Connection address qualified with the connection id, unique to this connection.
    pub fn handshake_key(&self) -> &str {
        &self.inner.handshake_key
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Resolves once the handshake finished, with its outcome.
    pub async fn started(&self) -> Result<(), Error> {
        let mut status = self.inner.status.subscribe();
        let started = match status.wait_for(|status| status.started.is_some()).await {
            Ok(status) => status.started.clone(),
            Err(_) => None,
        };
        started.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Resolves once the connection reached `Closed`, with the error that closed it, or `None` for
    /// a clean shutdown. If the handshake failed this is the handshake error.
    pub async fn closed(&self) -> Option<Error> {
        let mut status = self.inner.status.subscribe();
        let reason = match status
            .wait_for(|status| status.state == ConnectionState::Closed)
            .await
        {
            Ok(status) => status.reason.clone(),
            Err(_) => None,
        };
        reason
    }

    /// Sends `command` and waits for its response.
    ///
    /// Fails with [`Error::NotConnected`] unless the connection is open. Responses are matched by
    /// correlation id, so concurrent calls may complete in any order. A request the peer would
    /// refuse for its size, or a second handshake, fails this call with [`Error::Protocol`] and
    /// never reaches the wire.
    pub async fn send(&self, command: impl Into<Command>) -> Result<Response, Error> {
        let inner = &self.inner;
        if inner.state() != ConnectionState::Open {
            return Err(Error::NotConnected);
        }

        let command = command.into();
        if let Command::Connect(_) = command {
            return Err(Error::Protocol("connect is only sent by the handshake".to_string()));
        }
        let length = command.payload_length();
        if length > inner.max_payload_length {
            return Err(frame::Error::PayloadTooLarge {
                length,
                max: inner.max_payload_length,
            }
            .into());
        }

        let id = inner.ids.next_id();
        let mut receiver = match inner.pending.register(id) {
            Ok(receiver) => receiver,
            Err(err) => {
                error!(connection_id = %inner.id, id, "correlation id collision");
                inner.begin_close(Some(err.clone()));
                return Err(err);
            }
        };
        let registration = inner.pending.guard(id);

        // A close that started before the entry was registered will not drain it.
        if inner.state() != ConnectionState::Open {
            return Err(Error::ConnectionClosed);
        }

        let exchange = async {
            // If the writer is gone the connection is closing and the drain settles the entry.
            let _ = inner.outgoing.send(Request::new(id, command)).await;
            (&mut receiver).await
        };

        let reply = match inner.request_timeout {
            Some(timeout) => {
                let outcome = tokio::time::timeout(timeout, exchange).await;
                match outcome {
                    Ok(reply) => reply,
                    Err(_) => {
                        if inner.pending.remove(id) {
                            warn!(connection_id = %inner.id, id, "request timed out");
                            return Err(Error::Timeout(id));
                        }
                        // Settled right at the deadline.
                        receiver.await
                    }
                }
            }
            None => exchange.await,
        };
        registration.disarm();

        reply.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Shuts the connection down and waits until it is closed. Requests still waiting for a
    /// response fail with [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        self.inner.begin_close(None);
        self.closed().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// `Connecting -> Open`. Returns false if a close was requested in the meantime.
    fn open(&self) -> bool {
        self.status.send_if_modified(|status| {
            if status.state != ConnectionState::Connecting {
                return false;
            }
            status.state = ConnectionState::Open;
            status.started = Some(Ok(()));
            true
        })
    }

    /// `Connecting | Open -> Closing`. The first reason recorded wins.
    fn begin_close(&self, reason: Option<Error>) {
        self.status.send_if_modified(|status| {
            if !matches!(
                status.state,
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                return false;
            }
            status.state = ConnectionState::Closing;
            if status.reason.is_none() {
                status.reason = reason;
            }
            true
        });
    }

    /// `Connecting | Closing -> Closed` without ever having been open.
    fn fail_start(&self, err: Error) {
        warn!(connection_id = %self.id, %err, "failed to start connection");
        self.status.send_modify(|status| {
            status.state = ConnectionState::Closed;
            if status.started.is_none() {
                status.started = Some(Err(err.clone()));
            }
            if status.reason.is_none() {
                status.reason = Some(err);
            }
        });
        self.pending.drain_all_with_error(Error::ConnectionClosed);
    }

    /// `-> Closed`, rejecting every request still waiting.
    fn finish(&self) {
        let mut reason = None;
        self.status.send_modify(|status| {
            status.state = ConnectionState::Closed;
            reason = status.reason.clone();
        });

        match &reason {
            Some(err) => warn!(connection_id = %self.id, %err, "connection closed with error"),
            None => info!(connection_id = %self.id, "connection closed"),
        }

        self.pending
            .drain_all_with_error(reason.unwrap_or(Error::ConnectionClosed));
    }
}

impl Driver {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Gives up on a connection whose streams could not be opened.
    pub fn fail(self, err: Error) {
        self.connection.inner.fail_start(err);
    }

    /// Performs the handshake, then reads responses until the stream ends, an error occurs or
    /// the connection is closed.
    #[instrument(
        name = "connection",
        skip_all,
        fields(connection_id = %self.connection.id())
    )]
    pub async fn run<R, W>(self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Driver {
            connection,
            outgoing,
        } = self;
        let inner = &connection.inner;

        let mut frames = FramedRead::new(reader, ClientCodec::new(inner.max_payload_length));
        let mut sink = FramedWrite::new(writer, ClientCodec::new(inner.max_payload_length));
        let mut status = inner.status.subscribe();

        let exchange = async {
            let exchange = handshake(&mut frames, &mut sink, &inner.handshake_key);
            match inner.request_timeout {
                Some(timeout) => tokio::time::timeout(timeout, exchange)
                    .await
                    .unwrap_or(Err(Error::Timeout(HANDSHAKE_ID))),
                None => exchange.await,
            }
        };
        let started = tokio::select! {
            result = exchange => result,
            _ = wait_until_closing(&mut status) => Err(Error::ConnectionClosed),
        };

        if let Err(err) = started {
            inner.fail_start(err);
            return;
        }
        if !inner.open() {
            inner.fail_start(Error::ConnectionClosed);
            return;
        }
        info!(address = %inner.address, "connection open");

        let writer = tokio::spawn(
            write_loop(sink, outgoing, connection.clone()).instrument(tracing::Span::current()),
        );
        let reason = read_loop(&mut frames, &inner.pending, &mut status).await;

        inner.begin_close(reason);
        writer.abort();
        inner.finish();
    }
}

async fn handshake<R, W>(
    frames: &mut FramedRead<R, ClientCodec>,
    sink: &mut FramedWrite<W, ClientCodec>,
    handshake_key: &str,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let connect = Connect {
        address: handshake_key.to_string(),
    };
    sink.send(Request::new(HANDSHAKE_ID, connect)).await?;

    match frames.next().await {
        Some(Ok(Response {
            id: HANDSHAKE_ID,
            value: Value::Null,
        })) => Ok(()),
        Some(Ok(response)) => Err(Error::Protocol(format!(
            "unexpected handshake response {}",
            response
        ))),
        Some(Err(err)) => Err(err.into()),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection during the handshake",
        )
        .into()),
    }
}

/// Single consumer of the read stream. Returns the error that ended it, if any.
async fn read_loop<R>(
    frames: &mut FramedRead<R, ClientCodec>,
    pending: &PendingRequests,
    status: &mut watch::Receiver<Status>,
) -> Option<Error>
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(response)) => {
                    debug!(%response, "received response");
                    pending.resolve(response);
                }
                Some(Err(err)) => {
                    error!(%err, "failed to read response");
                    return Some(err.into());
                }
                None => {
                    info!("peer closed the connection");
                    return None;
                }
            },
            _ = wait_until_closing(status) => return None,
        }
    }
}

/// Single writer of the write stream, so frames are written one after the other in queue order.
async fn write_loop<W>(
    mut sink: FramedWrite<W, ClientCodec>,
    mut outgoing: mpsc::Receiver<Request>,
    connection: Connection,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = outgoing.recv().await {
        debug!(id = request.id, command = %request.command, "sending request");
        if let Err(err) = sink.send(request).await {
            error!(%err, "failed to write request");
            connection.inner.begin_close(Some(err.into()));
            return;
        }
    }
}

async fn wait_until_closing(status: &mut watch::Receiver<Status>) {
    // The sender lives in the connection, which outlives every receiver polled here.
    let _ = status
        .wait_for(|status| {
            matches!(
                status.state,
                ConnectionState::Closing | ConnectionState::Closed
            )
        })
        .await;
}
