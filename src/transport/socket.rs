//! Platform-specific socket connection.
//!
//! # Example
//!
//! ```ignore
//! use modelwire::transport::{connect, socket_path_from_env};
//!
//! let path = socket_path_from_env()?;
//! let (reader, writer) = connect(&path).await?.into_split();
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{Result, RuntimeError};

/// Environment variable holding the socket path.
pub const IPC_PATH_ENV: &str = "IPC_PATH";

/// Read the socket path from `IPC_PATH`.
pub fn socket_path_from_env() -> Result<PathBuf> {
    socket_path(std::env::var_os(IPC_PATH_ENV))
}

fn socket_path(value: Option<OsString>) -> Result<PathBuf> {
    match value {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(RuntimeError::Config(format!(
            "{} must name the host's socket",
            IPC_PATH_ENV
        ))),
    }
}

/// Connect to the host's socket at `path`.
pub async fn connect(path: &Path) -> Result<SocketStream> {
    SocketStream::connect(path).await
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;

    /// Read half of the host connection.
    pub type SocketReader = OwnedReadHalf;
    /// Write half of the host connection.
    pub type SocketWriter = OwnedWriteHalf;

    /// Connected Unix Domain Socket.
    pub struct SocketStream {
        stream: UnixStream,
    }

    impl SocketStream {
        pub async fn connect(path: &Path) -> Result<Self> {
            let stream = UnixStream::connect(path).await?;
            tracing::debug!(path = %path.display(), "Connected to host socket");
            Ok(Self { stream })
        }

        /// Split into owned read and write halves.
        pub fn into_split(self) -> (SocketReader, SocketWriter) {
            self.stream.into_split()
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::io::{ReadHalf, WriteHalf};
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient};

    pub type SocketReader = ReadHalf<NamedPipeClient>;
    pub type SocketWriter = WriteHalf<NamedPipeClient>;

    /// Connected Named Pipe client.
    pub struct SocketStream {
        pipe: NamedPipeClient,
    }

    impl SocketStream {
        pub async fn connect(path: &Path) -> Result<Self> {
            let pipe = ClientOptions::new().open(path)?;
            tracing::debug!(path = %path.display(), "Connected to host pipe");
            Ok(Self { pipe })
        }

        /// Split into read and write halves.
        pub fn into_split(self) -> (SocketReader, SocketWriter) {
            tokio::io::split(self.pipe)
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{SocketReader, SocketStream, SocketWriter};

#[cfg(windows)]
pub use windows_impl::{SocketReader, SocketStream, SocketWriter};
