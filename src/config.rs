use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory the socket files live in unless configured otherwise.
pub const SOCKET_FILE_PATH: &str = "/tmp/glidewire";

/// Largest payload accepted in a single frame, 512mb.
pub const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 512 * 1024 * 1024;

pub const DEFAULT_READ_SOCKET_NAME: &str = "read.sock";
pub const DEFAULT_WRITE_SOCKET_NAME: &str = "write.sock";

/// Connection settings.
///
/// The socket directory is an ordinary field rather than a process-wide value, so several
/// connections (and tests) can talk to different peers at once.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Logical address of the server, sent to the peer in the handshake.
    pub connection_address: String,
    pub socket_dir: PathBuf,
    /// Socket the client reads responses from.
    pub read_socket_name: String,
    /// Socket the client writes requests to.
    pub write_socket_name: String,
    pub max_payload_length: usize,
    /// Deadline for a single request. `None` waits until the connection closes.
    pub request_timeout: Option<Duration>,
    /// Capacity of the outgoing frame queue.
    pub write_queue_capacity: usize,
}

impl Config {
    pub fn new(connection_address: impl Into<String>) -> Config {
        Config {
            connection_address: connection_address.into(),
            socket_dir: PathBuf::from(SOCKET_FILE_PATH),
            read_socket_name: DEFAULT_READ_SOCKET_NAME.to_string(),
            write_socket_name: DEFAULT_WRITE_SOCKET_NAME.to_string(),
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            request_timeout: None,
            write_queue_capacity: 1024,
        }
    }

    /// Like [`Config::new`], with overrides taken from the environment:
    ///
    /// * `GLIDEWIRE_SOCKET_DIR`
    /// * `GLIDEWIRE_MAX_PAYLOAD` (bytes)
    /// * `GLIDEWIRE_REQUEST_TIMEOUT_MS`
    ///
    /// Values that fail to parse are ignored.
    pub fn from_env(connection_address: impl Into<String>) -> Config {
        let mut config = Config::new(connection_address);

        if let Ok(dir) = env::var("GLIDEWIRE_SOCKET_DIR") {
            config.socket_dir = PathBuf::from(dir);
        }
        if let Some(max) = parse_env::<usize>("GLIDEWIRE_MAX_PAYLOAD") {
            config.max_payload_length = max;
        }
        if let Some(ms) = parse_env::<u64>("GLIDEWIRE_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Some(Duration::from_millis(ms));
        }

        config
    }

    pub fn socket_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.socket_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn socket_names(mut self, read: impl Into<String>, write: impl Into<String>) -> Self {
        self.read_socket_name = read.into();
        self.write_socket_name = write.into();
        self
    }

    pub fn max_payload_length(mut self, max: usize) -> Self {
        self.max_payload_length = max;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn read_socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.read_socket_name)
    }

    pub fn write_socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.write_socket_name)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}
