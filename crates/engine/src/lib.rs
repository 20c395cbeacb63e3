//! Streaming engine used by `slink`.
//!
//! The crate provides the shared [`HttpSession`], the bounded [`RingBuffer`]
//! that sits between the network side and the output side, and the HLS
//! pipeline (playlist reloader, segment fetcher and ordered writer) that
//! fills it.

pub mod buffer;
pub mod config;
pub mod error;
pub mod hls;
pub mod http;
pub mod token;

pub use buffer::{ReadItem, RingBuffer};
pub use config::{DEFAULT_USER_AGENT, HttpSessionConfig, TransportOverride};
pub use error::{BufferError, HttpError};
pub use http::{CookieRecord, HttpSession, RequestBody, RequestOptions};
pub use token::{PlaylistSource, StaticPlaylistSource, WatchToken};
