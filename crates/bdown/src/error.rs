use std::fmt;

use thiserror::Error;

use crate::StreamKind;

/// Coarse classification of every failure a pipeline run can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resolution,
    Transfer,
    Io,
    Mux,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolution => "resolution",
            Self::Transfer => "transfer",
            Self::Io => "io",
            Self::Mux => "mux",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BdownError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("empty response body")]
    EmptyBody,

    #[error("server sent {received} bytes, more than the declared {declared}")]
    BodyOverflow { declared: u64, received: u64 },

    #[error("connection closed after {received} of {declared} bytes")]
    BodyTruncated { declared: u64, received: u64 },

    #[error("transfer interrupted: {0}")]
    Interrupted(#[source] std::io::Error),

    #[error("{0}")]
    Resolution(String),

    #[error("{0}")]
    Mux(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    MissingExecutable(#[from] which::Error),

    #[error("blocking task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[cfg(feature = "ffmpeg")]
    #[error(transparent)]
    FfmpegError(#[from] rsmpeg::error::RsmpegError),
}

impl BdownError {
    pub fn resolution(reason: impl Into<String>) -> Self {
        Self::Resolution(reason.into())
    }

    pub fn mux(reason: impl Into<String>) -> Self {
        Self::Mux(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HttpError(_)
            | Self::EmptyBody
            | Self::BodyOverflow { .. }
            | Self::BodyTruncated { .. }
            | Self::Interrupted(_)
            | Self::RequestError(_) => ErrorKind::Transfer,
            Self::Resolution(_) | Self::UrlParseError(_) | Self::JsonError(_) => {
                ErrorKind::Resolution
            }
            Self::Mux(_) | Self::JoinError(_) | Self::MissingExecutable(_) => ErrorKind::Mux,
            #[cfg(feature = "ffmpeg")]
            Self::FfmpegError(_) => ErrorKind::Mux,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::IOError(_) => ErrorKind::Io,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type BdownResult<T> = Result<T, BdownError>;

/// Stage-qualified failure of one pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to prepare output: {0}")]
    Prepare(#[source] BdownError),

    #[error("failed to obtain source URL: {0}")]
    Resolve(#[source] BdownError),

    #[error("{stream} download failed: {source}")]
    Download {
        stream: StreamKind,
        #[source]
        source: BdownError,
    },

    #[error("merge failed: {0}")]
    Merge(#[source] BdownError),
}

impl PipelineError {
    pub fn source_error(&self) -> &BdownError {
        match self {
            Self::Prepare(e) | Self::Resolve(e) | Self::Merge(e) => e,
            Self::Download { source, .. } => source,
        }
    }

    /// The stage decides the kind, unless the stage was interrupted by a
    /// cancellation or failed on local I/O.
    pub fn kind(&self) -> ErrorKind {
        let inner = self.source_error();
        if inner.is_cancelled() {
            return ErrorKind::Cancelled;
        }

        match self {
            Self::Prepare(_) => ErrorKind::Io,
            Self::Resolve(_) => ErrorKind::Resolution,
            Self::Download { source, .. } => match source.kind() {
                ErrorKind::Io => ErrorKind::Io,
                _ => ErrorKind::Transfer,
            },
            Self::Merge(_) => ErrorKind::Mux,
        }
    }
}
