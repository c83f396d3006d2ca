//! Stop-sequence truncation of generated text.
//!
//! [`truncate`] cuts a text at the earliest occurrence of any marker in a
//! [`StopSet`]. [`StreamTruncator`] applies the same rule to a growing buffer:
//! every chunk is appended to the whole accumulated text before scanning, so a
//! marker split across chunk boundaries is still found, and once a cut point is
//! found it never moves.

use serde::{Deserialize, Serialize};

/// An ordered list of literal stop markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StopSet {
    markers: Vec<String>,
}

impl StopSet {
    /// Creates a stop set. Empty markers are ignored.
    #[must_use]
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }

    /// Creates a stop set with a single marker.
    #[must_use]
    pub fn single(marker: impl Into<String>) -> Self {
        Self::new([marker.into()])
    }

    /// Returns the markers in order.
    #[must_use]
    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Returns `true` if the set has no markers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Length in bytes of the longest marker.
    #[must_use]
    pub fn longest(&self) -> usize {
        self.markers.iter().map(String::len).max().unwrap_or(0)
    }

    /// Returns the earliest byte index at which any marker starts.
    #[must_use]
    pub fn find(&self, text: &str) -> Option<usize> {
        self.markers.iter().filter_map(|m| text.find(m.as_str())).min()
    }
}

/// Returns the prefix of `text` before the earliest stop marker.
///
/// Returns `text` unchanged when no marker occurs; that is the normal state of
/// a stream that is still arriving.
#[must_use]
pub fn truncate<'a>(text: &'a str, stops: &StopSet) -> &'a str {
    stops.find(text).map_or(text, |cut| &text[..cut])
}

/// Incremental truncator over an accumulating stream buffer.
#[derive(Debug, Clone)]
pub struct StreamTruncator {
    stops: StopSet,
    buffer: String,
    scanned: usize,
    cut: Option<usize>,
}

impl StreamTruncator {
    /// Creates a truncator for `stops`.
    #[must_use]
    pub const fn new(stops: StopSet) -> Self {
        Self {
            stops,
            buffer: String::new(),
            scanned: 0,
            cut: None,
        }
    }

    /// Appends a chunk and returns the visible (truncated) text.
    ///
    /// Chunks arriving after a cut has been found are ignored.
    pub fn push(&mut self, chunk: &str) -> &str {
        if self.cut.is_none() && !chunk.is_empty() {
            self.buffer.push_str(chunk);
            self.rescan();
        }
        self.visible()
    }

    fn rescan(&mut self) {
        // A marker ending in the new data starts at most `longest - 1` bytes
        // before the previously scanned end.
        let mut start = self
            .scanned
            .saturating_sub(self.stops.longest().saturating_sub(1));
        while !self.buffer.is_char_boundary(start) {
            start -= 1;
        }
        self.cut = self.stops.find(&self.buffer[start..]).map(|i| start + i);
        self.scanned = self.buffer.len();
    }

    /// Returns the accumulated text up to the cut point, if any.
    #[must_use]
    pub fn visible(&self) -> &str {
        self.cut.map_or(self.buffer.as_str(), |cut| &self.buffer[..cut])
    }

    /// Returns `true` once a stop marker has been found.
    #[must_use]
    pub const fn is_cut(&self) -> bool {
        self.cut.is_some()
    }

    /// Byte index of the cut, if found.
    #[must_use]
    pub const fn cut_at(&self) -> Option<usize> {
        self.cut
    }

    /// Consumes the truncator and returns the visible text.
    #[must_use]
    pub fn into_visible(mut self) -> String {
        if let Some(cut) = self.cut {
            self.buffer.truncate(cut);
        }
        self.buffer
    }
}
