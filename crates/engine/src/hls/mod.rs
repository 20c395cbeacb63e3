// HLS engine: playlist reloader, parallel segment fetcher and ordered writer
// feeding a ring buffer.

pub mod config;
mod coordinator;
pub mod error;
mod fetcher;
pub mod playlist;
pub mod retry;
pub mod segment;
pub mod variant;
mod writer;

pub use config::{HlsConfig, HlsFetcherConfig, HlsOutputConfig, HlsPlaylistConfig, ReloadTime};
pub use coordinator::{HlsReader, HlsStream};
pub use error::HlsError;
pub use segment::{ByteRange, Segment, SegmentClass, SegmentFilter};
pub use variant::{Variant, parse_variant_playlist};
pub use writer::WriterStats;
