use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use futures::TryStreamExt;
use reqwest::header::REFERER;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
};
use tokio_util::{io::StreamReader, sync::CancellationToken};

use crate::{
    event::{DownloadEvent, EventSender},
    BdownError, BdownResult, HttpClient,
};

/// The CDN rejects requests without an allowed referrer.
pub const DOWNLOAD_REFERER: &str = "https://www.bilibili.com";

const CHUNK_SIZE: usize = 4 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(300);
const MIN_ELAPSED_SECS: f64 = 0.1;

/// Book-keeping of one running transfer.
#[derive(Debug)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination: PathBuf,
    /// `None` when the server did not declare a length.
    pub total_bytes: Option<u64>,
    pub bytes_read: u64,
    pub started_at: Instant,
    last_progress: Option<Instant>,
}

impl DownloadTask {
    pub fn new(source_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            destination: destination.into(),
            total_bytes: None,
            bytes_read: 0,
            started_at: Instant::now(),
            last_progress: None,
        }
    }

    /// Account for `len` more bytes, refusing to go past the declared length.
    pub fn record(&mut self, len: usize) -> BdownResult<()> {
        let received = self.bytes_read + len as u64;
        if let Some(declared) = self.total_bytes {
            if received > declared {
                return Err(BdownError::BodyOverflow { declared, received });
            }
        }

        self.bytes_read = received;
        Ok(())
    }

    /// KiB/s averaged since the start, elapsed time floored at 100ms.
    pub fn speed_kbps(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started_at).as_secs_f64();
        self.bytes_read as f64 / 1024.0 / elapsed.max(MIN_ELAPSED_SECS)
    }

    /// Whether a progress notification may be sent at `now`; marks it sent if so.
    pub fn progress_due(&mut self, now: Instant) -> bool {
        let due = match self.last_progress {
            Some(last) => now.saturating_duration_since(last) > PROGRESS_INTERVAL,
            None => true,
        };
        if due {
            self.last_progress = Some(now);
        }
        due
    }

    pub fn progress_event(&self, now: Instant) -> DownloadEvent {
        DownloadEvent::Progress {
            bytes_read: self.bytes_read,
            total_bytes: self.total_bytes,
            speed_kbps: self.speed_kbps(now),
        }
    }

    fn label(&self) -> String {
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.destination.display().to_string())
    }
}

/// Streams a single HTTP resource into a local file.
#[derive(Clone)]
pub struct ChunkDownloader {
    client: HttpClient,
    referer: String,
}

impl ChunkDownloader {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            referer: DOWNLOAD_REFERER.to_string(),
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = referer.into();
        self
    }

    /// Download `url` into `destination`.
    ///
    /// Exactly one of [DownloadEvent::Completed] or [DownloadEvent::Failed] is
    /// sent. A failed transfer leaves whatever was written at `destination`.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> BdownResult<PathBuf> {
        let mut task = DownloadTask::new(url, destination);
        match self.transfer(&mut task, events, cancel).await {
            Ok(()) => {
                let label = task.label();
                tracing::info!(
                    "Downloaded {label} ({} bytes) in {:.1}s",
                    task.bytes_read,
                    task.started_at.elapsed().as_secs_f64()
                );
                events.send(DownloadEvent::Completed {
                    label,
                    path: task.destination.clone(),
                });
                Ok(task.destination)
            }
            Err(e) => {
                tracing::error!("Download of {} failed: {e}", task.label());
                events.send(DownloadEvent::Failed {
                    kind: e.kind(),
                    message: format!("download failed: {e}"),
                });
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        task: &mut DownloadTask,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> BdownResult<()> {
        let request = self
            .client
            .get(task.source_url.as_str())
            .header(REFERER, self.referer.as_str());
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BdownError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(BdownError::HttpError(status));
        }

        task.total_bytes = response.content_length();
        if task.total_bytes == Some(0) {
            return Err(BdownError::EmptyBody);
        }

        if let Some(parent) = task.destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(&task.destination).await?;
        let mut writer = BufWriter::new(file);

        events.send(DownloadEvent::Started {
            total_bytes: task.total_bytes,
            label: task.label(),
        });

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    writer.flush().await?;
                    return Err(BdownError::Cancelled);
                }
                read = reader.read(&mut buffer) => read.map_err(BdownError::Interrupted)?,
            };
            if read == 0 {
                break;
            }

            task.record(read)?;
            writer.write_all(&buffer[..read]).await?;

            let now = Instant::now();
            if task.progress_due(now) {
                events.send(task.progress_event(now));
            }
        }
        writer.flush().await?;

        if task.bytes_read == 0 {
            return Err(BdownError::EmptyBody);
        }
        if let Some(declared) = task.total_bytes {
            if task.bytes_read < declared {
                return Err(BdownError::BodyTruncated {
                    declared,
                    received: task.bytes_read,
                });
            }
        }

        // the last update always carries the final count
        events.send(task.progress_event(Instant::now()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_refuses_overflow() {
        let mut task = DownloadTask::new("http://example.com/a", "a");
        task.total_bytes = Some(10);
        task.record(6).unwrap();
        task.record(4).unwrap();
        let err = task.record(1).unwrap_err();
        assert!(matches!(
            err,
            BdownError::BodyOverflow {
                declared: 10,
                received: 11
            }
        ));
        assert_eq!(task.bytes_read, 10);
    }

    #[test]
    fn test_record_unknown_length() {
        let mut task = DownloadTask::new("http://example.com/a", "a");
        task.record(usize::MAX >> 8).unwrap();
        assert_eq!(task.bytes_read, (usize::MAX >> 8) as u64);
    }

    #[test]
    fn test_speed_floors_elapsed_time() {
        let mut task = DownloadTask::new("http://example.com/a", "a");
        task.record(1024).unwrap();
        // right after the start the elapsed time is treated as 100ms
        let speed = task.speed_kbps(task.started_at);
        assert!((speed - 10.0).abs() < f64::EPSILON);

        let speed = task.speed_kbps(task.started_at + Duration::from_secs(2));
        assert!((speed - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_throttle() {
        let mut task = DownloadTask::new("http://example.com/a", "a");
        let start = task.started_at;
        assert!(task.progress_due(start));
        assert!(!task.progress_due(start + Duration::from_millis(100)));
        assert!(!task.progress_due(start + Duration::from_millis(300)));
        assert!(task.progress_due(start + Duration::from_millis(301)));
        assert!(!task.progress_due(start + Duration::from_millis(500)));
        assert!(task.progress_due(start + Duration::from_millis(700)));
    }
}
