//! Resolve, download and remux the split DASH streams of a bilibili part.
//!
//! ```text
//! ┌──────────┐  pagelist   ┌───────────┐  playurl   ┌────────────────────┐
//! │  caller  ├────────────►│ BiliClient├───────────►│ ResolvedStreamPair │
//! └────┬─────┘             └───────────┘            └─────────┬──────────┘
//!      │ Pipeline::run                                        │
//!      ▼                                                      ▼
//! ┌──────────┐   <title>_video.m4s   ┌─────────────────┐   ┌──────────────┐
//! │ Pipeline ├──────────────────────►│ ChunkDownloader │   │ merge (mp4)  │
//! │          ├──────────────────────►│                 │   │ <title>.mp4  │
//! └────┬─────┘   <title>_audio.m4s   └─────────────────┘   └──────▲───────┘
//!      └──────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod download;
pub mod error;
pub mod event;
pub mod merge;
pub mod pipeline;
pub mod util;

pub use error::{BdownError, BdownResult, ErrorKind, PipelineError};
pub use util::http::HttpClient;

use std::fmt;

/// One of the two elementary streams of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    /// MIME prefix a track must carry to be picked for this stream.
    pub fn mime_prefix(&self) -> &'static str {
        match self {
            Self::Video => "video/",
            Self::Audio => "audio/",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
