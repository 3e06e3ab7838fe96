use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::{
    api::{MediaPart, StreamResolver},
    download::ChunkDownloader,
    event::{DownloadEvent, EventSender, PipelineStage},
    merge::{MuxBackend, MuxJob},
    util::path::OutputLayout,
    BdownError, BdownResult, ErrorKind, PipelineError, StreamKind,
};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Keep `<title>_video.m4s` and `<title>_audio.m4s` after a successful mux.
    pub keep_intermediates: bool,
    pub backend: MuxBackend,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            keep_intermediates: true,
            backend: MuxBackend::default(),
        }
    }
}

/// Resolve, download both streams, then mux them, stopping at the first failure.
pub struct Pipeline<R> {
    resolver: R,
    downloader: ChunkDownloader,
    output_dir: PathBuf,
    options: PipelineOptions,
}

impl<R> Pipeline<R>
where
    R: StreamResolver,
{
    pub fn new(resolver: R, downloader: ChunkDownloader, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            resolver,
            downloader,
            output_dir: output_dir.into(),
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the whole pipeline for one part.
    ///
    /// `events` receives stage changes and forwarded download progress, then
    /// exactly one [DownloadEvent::Completed] or [DownloadEvent::Failed].
    pub async fn run(
        &self,
        part: &MediaPart,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        match self.execute(part, events, cancel).await {
            Ok(output) => {
                let label = output
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| part.title.clone());
                events.send(DownloadEvent::Completed {
                    label,
                    path: output.clone(),
                });
                Ok(output)
            }
            Err(e) => {
                if e.kind() == ErrorKind::Cancelled {
                    tracing::info!("Download of {} cancelled", part.title);
                } else {
                    tracing::error!("Download of {} failed: {e}", part.title);
                }
                events.send(DownloadEvent::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        part: &MediaPart,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let layout = OutputLayout::new(&self.output_dir, &part.title);
        tokio::fs::create_dir_all(layout.dir())
            .await
            .map_err(|e| PipelineError::Prepare(e.into()))?;

        check_cancelled(cancel).map_err(PipelineError::Resolve)?;
        events.stage_changed(PipelineStage::Resolving);
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BdownError::Cancelled),
            resolved = self.resolver.resolve(part) => resolved,
        };
        let streams = resolved.map_err(PipelineError::Resolve)?;

        for (stream, stage) in [
            (StreamKind::Video, PipelineStage::DownloadingVideo),
            (StreamKind::Audio, PipelineStage::DownloadingAudio),
        ] {
            let wrap = |source| PipelineError::Download { stream, source };
            check_cancelled(cancel).map_err(wrap)?;
            events.stage_changed(stage);
            self.downloader
                .download(
                    streams.url(stream),
                    &layout.stream_path(stream),
                    &events.stage(stream),
                    cancel,
                )
                .await
                .map_err(wrap)?;
        }

        check_cancelled(cancel).map_err(PipelineError::Merge)?;
        events.stage_changed(PipelineStage::Muxing);
        let job = MuxJob::new(
            layout.stream_path(StreamKind::Video),
            layout.stream_path(StreamKind::Audio),
            layout.output_path(),
        );
        job.run_with(self.options.backend, cancel)
            .await
            .map_err(PipelineError::Merge)?;

        if !self.options.keep_intermediates {
            for path in [&job.video_path, &job.audio_path] {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    tracing::warn!("Failed to remove {}: {e}", path.display());
                }
            }
        }
        Ok(job.output_path)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> BdownResult<()> {
    if cancel.is_cancelled() {
        return Err(BdownError::Cancelled);
    }
    Ok(())
}
