use std::future::Future;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::FramedWrite;
use tracing::error;

use crate::codec::ClientCodec;
use crate::command::{Command, Connect, Get, Set};
use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::error::Error;
use crate::frame::{Request, Response, Value, HANDSHAKE_ID};
use crate::store::Store;

/// The operations a key-value client offers, independent of how requests reach the server.
pub trait KeyValueClient {
    /// Get the value of `key`, `None` if it does not exist.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    /// Set `key` to hold `value`.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Client talking to the server over a read/write socket pair.
///
/// ```no_run
/// # async fn example() -> Result<(), glidewire::Error> {
/// use glidewire::{AsyncClient, Config};
///
/// let client = AsyncClient::create_connection(Config::from_env("localhost:6379"));
/// client.set("key", "value").await?;
/// assert_eq!(client.get("key").await?, Some("value".to_string()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct AsyncClient {
    connection: Connection,
}

impl AsyncClient {
    /// Starts connecting to the sockets named by `config` and returns immediately.
    ///
    /// Whether the connection succeeded shows in the outcome of the first request, or through
    /// [`AsyncClient::started`]. Must be called from within a tokio runtime.
    pub fn create_connection(config: Config) -> AsyncClient {
        let (connection, driver) = Connection::new(&config);
        let handshake_key = connection.handshake_key().to_string();

        tokio::spawn(async move {
            match open_sockets(&config, &handshake_key).await {
                Ok((reader, writer)) => driver.run(reader, writer).await,
                Err(err) => {
                    error!(
                        socket_dir = ?config.socket_dir,
                        %err,
                        "failed to open sockets"
                    );
                    driver.fail(err);
                }
            }
        });

        AsyncClient { connection }
    }

    /// Like [`AsyncClient::create_connection`], over already opened streams.
    pub fn from_streams<R, W>(config: &Config, reader: R, writer: W) -> AsyncClient
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, driver) = Connection::new(config);
        tokio::spawn(driver.run(reader, writer));
        AsyncClient { connection }
    }

    /// Wraps a connection whose [`Driver`](crate::connection::Driver) the caller runs.
    pub fn from_connection(connection: Connection) -> AsyncClient {
        AsyncClient { connection }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let response = self.request(Get {
            key: key.to_string(),
        })
        .await?;

        match response.value {
            Value::Null => Ok(None),
            Value::String(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|_| Error::TypeMismatch {
                    expected: "utf-8 string",
                    actual: "binary payload".to_string(),
                }),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let response = self
            .request(Set {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;

        match response.value {
            Value::Null => Ok(()),
            value => Err(Error::Protocol(format!(
                "unexpected {} response to set",
                value.response_type()
            ))),
        }
    }

    /// Closes the connection. Requests still in flight fail with [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        self.connection.close().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn started(&self) -> Result<(), Error> {
        self.connection.started().await
    }

    pub async fn closed(&self) -> Option<Error> {
        self.connection.closed().await
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    async fn request(&self, command: impl Into<Command>) -> Result<Response, Error> {
        // Requests issued while the handshake is in progress wait for it.
        if self.connection.started().await.is_err() {
            return Err(Error::ConnectionClosed);
        }

        self.connection
            .send(command)
            .await
            .map_err(|err| match err {
                Error::NotConnected => Error::ConnectionClosed,
                err => err,
            })
    }
}

impl KeyValueClient for AsyncClient {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        AsyncClient::get(self, key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        AsyncClient::set(self, key, value).await
    }
}

/// Client keeping its data in memory, for code that wants a [`KeyValueClient`] without a server.
#[derive(Clone, Default)]
pub struct MemoryClient {
    store: Store,
}

impl MemoryClient {
    pub fn new() -> MemoryClient {
        Self::default()
    }
}

impl KeyValueClient for MemoryClient {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.store.lock().get(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.store.lock().set(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Opens the read socket and announces `handshake_key` on it, then opens the write socket. The
/// handshake sent on the write socket carries the same key.
async fn open_sockets(
    config: &Config,
    handshake_key: &str,
) -> Result<(UnixStream, UnixStream), Error> {
    let mut reader = UnixStream::connect(config.read_socket_path()).await?;
    announce(&mut reader, handshake_key).await?;
    let writer = UnixStream::connect(config.write_socket_path()).await?;
    Ok((reader, writer))
}

/// Sends the handshake key on the socket responses are read from, so the peer can join it with
/// the socket requests are written to.
///
/// [`AsyncClient::create_connection`] does this itself; it is only needed when opening the
/// streams by hand.
pub async fn announce<W>(stream: &mut W, handshake_key: &str) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(stream, ClientCodec::default());
    let connect = Connect {
        address: handshake_key.to_string(),
    };
    frames.send(Request::new(HANDSHAKE_ID, connect)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PeerCodec;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    async fn round_trip(client: &impl KeyValueClient) {
        assert_eq!(client.get("k").await.unwrap(), None);
        client.set("k", "v").await.unwrap();
        assert_eq!(client.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn memory_client_behaves_like_a_store() {
        round_trip(&MemoryClient::new()).await;
    }

    #[tokio::test]
    async fn async_client_over_in_memory_streams() {
        let (client_reader, peer_writer) = tokio::io::duplex(1024);
        let (peer_reader, client_writer) = tokio::io::duplex(1024);
        tokio::spawn(crate::peer::serve(
            peer_reader,
            peer_writer,
            Store::new(),
            1024,
        ));

        let client = AsyncClient::from_streams(&Config::new("test"), client_reader, client_writer);

        round_trip(&client).await;
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn announce_writes_a_handshake_frame() {
        let (mut client, peer) = tokio::io::duplex(256);
        let mut frames = FramedRead::new(peer, PeerCodec::default());

        announce(&mut client, "addr/1").await.unwrap();

        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Request::new(
                HANDSHAKE_ID,
                Connect {
                    address: "addr/1".into()
                }
            )
        );
    }

    #[tokio::test]
    async fn missing_sockets_fail_the_start() {
        let dir = std::env::temp_dir().join(format!("glidewire-{}", uuid::Uuid::new_v4()));
        let client = AsyncClient::create_connection(Config::new("test").socket_dir(&dir));

        assert!(matches!(client.started().await, Err(Error::Connection(_))));
        assert!(matches!(client.get("k").await, Err(Error::ConnectionClosed)));
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
