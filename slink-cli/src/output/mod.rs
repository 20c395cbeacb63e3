//! Stream outputs: a file or stdout, a spawned player, or a single HTTP client.

pub mod file;
pub mod http;
pub mod player;

use std::io;

pub use file::FileOutput;
pub use http::{HttpOutput, HttpServer};
pub use player::{PlayerMonitor, PlayerOutput};

/// Raw OS codes a write fails with once the reader is gone.
#[cfg(unix)]
const CLOSED_CODES: &[i32] = &[22];
#[cfg(windows)]
const CLOSED_CODES: &[i32] = &[10053];
#[cfg(not(any(unix, windows)))]
const CLOSED_CODES: &[i32] = &[];

/// True for write errors that mean the reading side went away: EPIPE,
/// EINVAL, ECONNRESET and, on Windows, WSAECONNABORTED.
pub fn is_downstream_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    ) || err.raw_os_error().is_some_and(|code| CLOSED_CODES.contains(&code))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    File,
    Player,
    Http,
}

pub enum Output {
    File(FileOutput),
    Player(PlayerOutput),
    Http(HttpOutput),
}

impl Output {
    pub fn kind(&self) -> OutputKind {
        match self {
            Output::File(_) => OutputKind::File,
            Output::Player(_) => OutputKind::Player,
            Output::Http(_) => OutputKind::Http,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Output::File(output) => output.write(data).await,
            Output::Player(output) => output.write(data).await,
            Output::Http(output) => output.write(data).await,
        }
    }

    pub async fn close(&mut self) -> io::Result<()> {
        match self {
            Output::File(output) => output.close().await,
            Output::Player(output) => output.close().await,
            Output::Http(output) => output.close().await,
        }
    }

    /// Exit watcher of a spawned player.
    pub fn player_monitor(&self) -> Option<PlayerMonitor> {
        match self {
            Output::Player(output) => Some(output.monitor()),
            _ => None,
        }
    }
}
