use std::path::PathBuf;

use clap::Parser;
use glidewire::config::{
    Config, DEFAULT_MAX_PAYLOAD_LENGTH, DEFAULT_READ_SOCKET_NAME, DEFAULT_WRITE_SOCKET_NAME,
};
use glidewire::logger::{self, Level};
use glidewire::peer::Peer;
use glidewire::{Error, SOCKET_FILE_PATH};

#[derive(Parser, Debug)]
struct Args {
    /// Directory holding the socket files
    #[arg(long, env = "GLIDEWIRE_SOCKET_DIR", default_value = SOCKET_FILE_PATH)]
    socket_dir: PathBuf,

    /// Socket clients read responses from
    #[arg(long, default_value = DEFAULT_READ_SOCKET_NAME)]
    read_socket: String,

    /// Socket clients write requests to
    #[arg(long, default_value = DEFAULT_WRITE_SOCKET_NAME)]
    write_socket: String,

    /// Largest accepted payload, in bytes
    #[arg(long, env = "GLIDEWIRE_MAX_PAYLOAD", default_value_t = DEFAULT_MAX_PAYLOAD_LENGTH)]
    max_payload: usize,

    #[arg(long, default_value_t = Level::Info)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    logger::init(args.log_level);

    let config = Config::new("local")
        .socket_dir(&args.socket_dir)
        .socket_names(args.read_socket, args.write_socket)
        .max_payload_length(args.max_payload);

    Peer::bind(&config)?.run().await
}
