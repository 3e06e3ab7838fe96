#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod ffmpeg_cli;
pub mod mp4;

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{BdownError, BdownResult, StreamKind};

/// Initial capacity of the buffer samples are copied through.
pub const SAMPLE_BUFFER_SIZE: usize = 1024 * 1024;

/// Format of one track in a demuxed source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFormat {
    /// Position in the source's track list.
    pub index: usize,
    pub track_id: u32,
    /// `video/avc`, `audio/mp4a-latm`...
    pub mime: String,
    /// Handler type, `vide` or `soun` for media tracks.
    pub handler: [u8; 4],
    pub timescale: u32,
    /// 16.16 fixed point, zero for audio.
    pub width: u32,
    pub height: u32,
    /// Packed ISO-639-2/T code of `mdhd`.
    pub language: u16,
    /// The whole `stsd` box, header included.
    pub sample_description: Bytes,
    /// Empty time before the first sample is presented, in `timescale` units.
    pub edit_delay: u64,
    /// Media time presentation starts from, in `timescale` units.
    pub edit_media_time: u64,
}

impl TrackFormat {
    pub fn is_kind(&self, kind: StreamKind) -> bool {
        self.mime.starts_with(kind.mime_prefix())
    }
}

/// Timing and flags of one sample, in the track's timescale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleInfo {
    pub size: u32,
    pub dts: u64,
    /// Composition offset, `pts = dts + cts_offset`.
    pub cts_offset: i64,
    pub duration: u32,
    pub sync: bool,
}

pub trait Demuxer {
    fn tracks(&self) -> &[TrackFormat];

    /// Restrict [Demuxer::read_sample] to one track and rewind it.
    fn select_track(&mut self, index: usize) -> BdownResult<()>;

    /// Read the next sample of the selected track into `buf`, replacing its
    /// content. `None` once the track is exhausted.
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> BdownResult<Option<SampleInfo>>;
}

pub trait Muxer {
    /// Register a track, returning the index to write its samples to.
    fn add_track(&mut self, format: &TrackFormat) -> BdownResult<usize>;

    /// Stop accepting tracks and begin writing.
    fn start(&mut self) -> BdownResult<()>;

    fn write_sample(&mut self, track: usize, data: &[u8], info: &SampleInfo) -> BdownResult<()>;

    fn finish(&mut self) -> BdownResult<()>;
}

/// Pick the first track of `demuxer` whose MIME type matches `kind`.
pub fn select_track<D>(demuxer: &mut D, kind: StreamKind) -> BdownResult<TrackFormat>
where
    D: Demuxer + ?Sized,
{
    let format = demuxer
        .tracks()
        .iter()
        .find(|track| track.is_kind(kind))
        .cloned()
        .ok_or_else(|| BdownError::mux(format!("no {kind} track found")))?;
    demuxer.select_track(format.index)?;
    Ok(format)
}

/// Copy every sample of the selected track of `source` into `track` of `muxer`.
///
/// Returns the number of samples copied.
pub fn copy_samples<D, M>(
    source: &mut D,
    muxer: &mut M,
    track: usize,
    buffer: &mut Vec<u8>,
    cancel: &CancellationToken,
) -> BdownResult<u64>
where
    D: Demuxer + ?Sized,
    M: Muxer + ?Sized,
{
    let mut copied = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(BdownError::Cancelled);
        }

        let Some(info) = source.read_sample(buffer)? else {
            break;
        };
        muxer.write_sample(track, &buffer[..], &info)?;
        copied += 1;
    }
    Ok(copied)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuxStats {
    pub video_samples: u64,
    pub audio_samples: u64,
}

/// Interleave-free remux of two already opened sources, video track first.
pub fn remux<V, A, M>(
    video: &mut V,
    audio: &mut A,
    muxer: &mut M,
    cancel: &CancellationToken,
) -> BdownResult<MuxStats>
where
    V: Demuxer + ?Sized,
    A: Demuxer + ?Sized,
    M: Muxer + ?Sized,
{
    let video_format = select_track(video, StreamKind::Video)?;
    let audio_format = select_track(audio, StreamKind::Audio)?;

    let video_track = muxer.add_track(&video_format)?;
    let audio_track = muxer.add_track(&audio_format)?;
    muxer.start()?;

    let mut buffer = Vec::with_capacity(SAMPLE_BUFFER_SIZE);
    let video_samples = copy_samples(video, muxer, video_track, &mut buffer, cancel)?;
    let audio_samples = copy_samples(audio, muxer, audio_track, &mut buffer, cancel)?;
    muxer.finish()?;

    Ok(MuxStats {
        video_samples,
        audio_samples,
    })
}

/// Which implementation performs a [MuxJob].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxBackend {
    /// Built-in MP4 demuxer and muxer.
    #[default]
    Native,
    /// libavformat through rsmpeg.
    #[cfg(feature = "ffmpeg")]
    Ffmpeg,
}

/// Combine a video-only and an audio-only file into one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxJob {
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub output_path: PathBuf,
}

impl MuxJob {
    pub fn new(
        video_path: impl Into<PathBuf>,
        audio_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            video_path: video_path.into(),
            audio_path: audio_path.into(),
            output_path: output_path.into(),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> BdownResult<MuxStats> {
        self.run_with(MuxBackend::Native, cancel).await
    }

    /// Run the job on the blocking pool.
    pub async fn run_with(
        &self,
        backend: MuxBackend,
        cancel: &CancellationToken,
    ) -> BdownResult<MuxStats> {
        let job = self.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || job.run_blocking(backend, &cancel)).await?
    }

    /// Run the job on the current thread. The output is removed if anything
    /// fails after it was created.
    pub fn run_blocking(
        &self,
        backend: MuxBackend,
        cancel: &CancellationToken,
    ) -> BdownResult<MuxStats> {
        tracing::debug!(
            "Muxing {} + {} into {}",
            self.video_path.display(),
            self.audio_path.display(),
            self.output_path.display()
        );

        let result = match backend {
            MuxBackend::Native => self.run_native(cancel),
            #[cfg(feature = "ffmpeg")]
            MuxBackend::Ffmpeg => ffmpeg::ffmpeg_remux(self, cancel),
        };

        match &result {
            Ok(stats) => tracing::info!(
                "Muxed {} video and {} audio samples into {}",
                stats.video_samples,
                stats.audio_samples,
                self.output_path.display()
            ),
            Err(e) => tracing::error!("Failed to mux {}: {e}", self.output_path.display()),
        }
        result
    }

    fn run_native(&self, cancel: &CancellationToken) -> BdownResult<MuxStats> {
        let mut video = mp4::Mp4Demuxer::open(&self.video_path)?;
        let mut audio = mp4::Mp4Demuxer::open(&self.audio_path)?;
        // fail on a missing track before anything is written
        select_track(&mut video, StreamKind::Video)?;
        select_track(&mut audio, StreamKind::Audio)?;

        let mut muxer = mp4::Mp4Muxer::create(&self.output_path)?;
        let result = remux(&mut video, &mut audio, &mut muxer, cancel);
        drop(muxer);
        if result.is_err() {
            remove_partial_output(&self.output_path);
        }
        result
    }
}

pub(crate) fn remove_partial_output(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove partial output {}: {e}", path.display());
        }
    }
}
