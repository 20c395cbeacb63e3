use std::fmt;
use std::sync::Arc;

use url::Url;

/// Byte range of a segment inside a larger resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Value for the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        let end = (self.offset + self.length).saturating_sub(1);
        format!("bytes={}-{}", self.offset, end)
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClass {
    /// Downloaded and written to the buffer
    Playable,
    /// Counted as seen but never downloaded
    Filtered,
}

/// A media segment as scheduled by the playlist reloader.
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub uri: Url,
    pub duration: f64,
    pub title: Option<String>,
    pub byte_range: Option<ByteRange>,
    /// A discontinuity precedes this segment.
    pub discontinuity: bool,
    pub class: SegmentClass,
}

impl Segment {
    pub fn is_filtered(&self) -> bool {
        self.class == SegmentClass::Filtered
    }
}

/// Predicate marking segments that must not be downloaded.
#[derive(Clone)]
pub struct SegmentFilter(Arc<dyn Fn(&Segment) -> bool + Send + Sync>);

impl SegmentFilter {
    pub fn new(predicate: impl Fn(&Segment) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Filters segments whose URI contains `needle`, e.g. `/blank/`.
    pub fn uri_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new(move |segment| segment.uri.as_str().contains(&needle))
    }

    /// Filters segments whose `#EXTINF` title starts with `prefix`.
    pub fn title_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(move |segment| {
            segment
                .title
                .as_deref()
                .is_some_and(|title| title.starts_with(&prefix))
        })
    }

    pub fn matches(&self, segment: &Segment) -> bool {
        (self.0)(segment)
    }
}

impl fmt::Debug for SegmentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SegmentFilter(..)")
    }
}
