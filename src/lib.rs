pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod frame;
pub mod logger;
pub mod peer;
pub mod pending;
pub mod store;

pub use client::{AsyncClient, KeyValueClient, MemoryClient};
pub use config::{Config, SOCKET_FILE_PATH};
pub use connection::{Connection, ConnectionState};
pub use error::Error;
pub use frame::HEADER_LENGTH_IN_BYTES;

pub type Result<T> = std::result::Result<T, Error>;
