//! Transport module - the socket the host listens on.
//!
//! The host creates the socket before spawning this process and passes its
//! path in the `IPC_PATH` environment variable:
//! - Unix Domain Socket (Linux/macOS)
//! - Named Pipe (Windows)

mod socket;

pub use socket::{
    connect, socket_path_from_env, SocketReader, SocketStream, SocketWriter, IPC_PATH_ENV,
};
