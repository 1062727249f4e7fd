//! A small server speaking the wire protocol on the same socket pair a client connects to.
//!
//! It answers `GetString`/`SetString` from an in-memory [`Store`]. It exists for local runs and
//! tests; it is not a reimplementation of the data-store server.

use std::collections::HashMap;
use std::fs;
use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::PeerCodec;
use crate::command::{Command, Get, Set};
use crate::config::Config;
use crate::error::Error;
use crate::frame::{Request, Response, Value, HANDSHAKE_ID};
use crate::store::Store;

/// A command the peer knows how to run against its store.
pub trait Executable {
    fn exec(self, store: &Store) -> Value;
}

impl Executable for Get {
    fn exec(self, store: &Store) -> Value {
        match store.lock().get(&self.key) {
            Some(value) => Value::String(Bytes::from(value)),
            None => Value::Null,
        }
    }
}

impl Executable for Set {
    fn exec(self, store: &Store) -> Value {
        store.lock().set(self.key, self.value);
        Value::Null
    }
}

pub struct Peer {
    /// Clients read responses from this socket.
    responses: UnixListener,
    /// Clients write requests to this socket.
    requests: UnixListener,
    store: Store,
    max_payload_length: usize,
}

/// One socket of a client connection, after it sent its handshake key.
enum Half {
    /// The socket requests arrive on. Its handshake has been read but not answered yet.
    Requests(FramedRead<UnixStream, PeerCodec>),
    /// The socket responses are written to.
    Responses(UnixStream),
}

impl Peer {
    /// Binds both sockets of `config`, replacing stale socket files left by a previous run.
    pub fn bind(config: &Config) -> io::Result<Peer> {
        fs::create_dir_all(&config.socket_dir)?;

        let read_path = config.read_socket_path();
        let write_path = config.write_socket_path();
        for path in [&read_path, &write_path] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }

        Ok(Peer {
            responses: UnixListener::bind(&read_path)?,
            requests: UnixListener::bind(&write_path)?,
            store: Store::new(),
            max_payload_length: config.max_payload_length,
        })
    }

    /// Handle to the data served by this peer.
    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// Accepts connections until an accept fails.
    ///
    /// Every socket starts with a `Connect` frame carrying the client's handshake key. The two
    /// sockets of a client are joined by that key, in whatever order they were accepted.
    pub async fn run(self) -> Result<(), Error> {
        info!(
            "peer listening on {:?} and {:?}",
            self.responses.local_addr()?.as_pathname(),
            self.requests.local_addr()?.as_pathname()
        );

        let (announced_tx, mut announced) = mpsc::channel(32);
        let mut unpaired: HashMap<String, Half> = HashMap::new();

        loop {
            tokio::select! {
                accepted = self.responses.accept() => {
                    let (stream, _) = accepted?;
                    tokio::spawn(read_handshake_key(
                        stream,
                        |frames| Half::Responses(frames.into_inner()),
                        self.max_payload_length,
                        announced_tx.clone(),
                    ));
                }
                accepted = self.requests.accept() => {
                    let (stream, _) = accepted?;
                    tokio::spawn(read_handshake_key(
                        stream,
                        Half::Requests,
                        self.max_payload_length,
                        announced_tx.clone(),
                    ));
                }
                Some((key, half)) = announced.recv() => match unpaired.remove(&key) {
                    None => {
                        debug!(%key, "waiting for the other socket");
                        unpaired.insert(key, half);
                    }
                    Some(other) => match (half, other) {
                        (Half::Requests(requests), Half::Responses(responses))
                        | (Half::Responses(responses), Half::Requests(requests)) => {
                            let store = self.store.clone();
                            let max_payload_length = self.max_payload_length;
                            tokio::spawn(async move {
                                let result = handle_connection(
                                    key,
                                    requests,
                                    responses,
                                    store,
                                    max_payload_length,
                                )
                                .await;
                                if let Err(e) = result {
                                    error!(%e, "connection failed");
                                }
                            });
                        }
                        (half, _) => {
                            warn!(%key, "socket announced a key already used on the same side");
                            unpaired.insert(key, half);
                        }
                    },
                },
            }
        }
    }
}

/// Reads the `Connect` frame a freshly accepted socket starts with and hands the socket over,
/// keyed by the handshake key it carries.
async fn read_handshake_key(
    stream: UnixStream,
    into_half: fn(FramedRead<UnixStream, PeerCodec>) -> Half,
    max_payload_length: usize,
    announced: mpsc::Sender<(String, Half)>,
) {
    let mut frames = FramedRead::new(stream, PeerCodec::new(max_payload_length));

    match frames.next().await {
        Some(Ok(Request {
            id: HANDSHAKE_ID,
            command: Command::Connect(connect),
        })) => {
            let _ = announced.send((connect.address, into_half(frames))).await;
        }
        Some(Ok(request)) => {
            warn!(command = %request.command, "socket opened without a handshake")
        }
        Some(Err(err)) => warn!(%err, "failed to read handshake"),
        None => debug!("socket closed before its handshake"),
    }
}

#[instrument(name = "connection", skip_all, fields(connection_id))]
async fn handle_connection(
    key: String,
    requests: FramedRead<UnixStream, PeerCodec>,
    responses: UnixStream,
    store: Store,
    max_payload_length: usize,
) -> Result<(), Error> {
    tracing::Span::current().record("connection_id", Uuid::new_v4().to_string());

    let mut responses = FramedWrite::new(responses, PeerCodec::new(max_payload_length));
    info!(%key, "client connected");
    responses.send(Response::null(HANDSHAKE_ID)).await?;

    answer(requests, responses, store).await
}

/// Serves one client over a single pair of streams: answers its handshake, then every request in
/// arrival order.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    store: Store,
    max_payload_length: usize,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, PeerCodec::new(max_payload_length));
    let mut responses = FramedWrite::new(writer, PeerCodec::new(max_payload_length));

    match requests.next().await {
        Some(Ok(Request {
            id: HANDSHAKE_ID,
            command: Command::Connect(connect),
        })) => {
            info!(key = %connect.address, "client connected");
            responses.send(Response::null(HANDSHAKE_ID)).await?;
        }
        Some(Ok(request)) => {
            return Err(Error::Protocol(format!(
                "expected a handshake, got {}",
                request.command
            )))
        }
        Some(Err(err)) => return Err(err.into()),
        None => return Ok(()),
    }

    answer(requests, responses, store).await
}

async fn answer<R, W>(
    mut requests: FramedRead<R, PeerCodec>,
    mut responses: FramedWrite<W, PeerCodec>,
    store: Store,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(request) = requests.next().await {
        let request = request?;
        info!(id = request.id, command = %request.command, "received request");

        let value = match request.command {
            Command::Get(cmd) => cmd.exec(&store),
            Command::Set(cmd) => cmd.exec(&store),
            Command::Connect(_) => {
                return Err(Error::Protocol("handshake sent twice".to_string()));
            }
        };

        responses
            .send(Response {
                id: request.id,
                value,
            })
            .await?;
    }

    info!("connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ClientCodec;
    use crate::command::Connect;
    use tokio::io::duplex;

    #[test]
    fn get_and_set_execute_against_the_store() {
        let store = Store::new();

        assert_eq!(Get { key: "k".into() }.exec(&store), Value::Null);
        assert_eq!(
            Set {
                key: "k".into(),
                value: "v".into()
            }
            .exec(&store),
            Value::Null
        );
        assert_eq!(
            Get { key: "k".into() }.exec(&store),
            Value::String(Bytes::from("v"))
        );
    }

    #[tokio::test]
    async fn requests_without_a_handshake_are_refused() {
        let (client, peer_reader) = duplex(256);
        let (peer_writer, _client_reader) = duplex(256);
        let mut client = FramedWrite::new(client, ClientCodec::default());

        client
            .send(Request::new(1, Get { key: "k".into() }))
            .await
            .unwrap();

        let result = serve(peer_reader, peer_writer, Store::new(), 1024).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn answers_the_handshake_then_requests() {
        let (client_writer, peer_reader) = duplex(256);
        let (peer_writer, client_reader) = duplex(256);
        let mut requests = FramedWrite::new(client_writer, ClientCodec::default());
        let mut responses = FramedRead::new(client_reader, ClientCodec::default());
        let store = Store::new();
        store.lock().set("k".into(), "v".into());

        let serving = tokio::spawn(serve(peer_reader, peer_writer, store, 1024));

        requests
            .send(Request::new(
                HANDSHAKE_ID,
                Connect {
                    address: "a".into(),
                },
            ))
            .await
            .unwrap();
        requests
            .send(Request::new(4, Get { key: "k".into() }))
            .await
            .unwrap();

        assert_eq!(
            responses.next().await.unwrap().unwrap(),
            Response::null(HANDSHAKE_ID)
        );
        assert_eq!(
            responses.next().await.unwrap().unwrap(),
            Response::string(4, "v")
        );

        drop(requests);
        assert!(serving.await.unwrap().is_ok());
    }
}
