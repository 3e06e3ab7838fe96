//! Post-processing through a system `ffmpeg` binary.
//!
//! Unlike [crate::merge::MuxJob] this re-encodes, so it is never part of a
//! pipeline run and only happens when asked for.

use std::path::Path;

use tokio::process::Command;

use crate::{BdownError, BdownResult};

/// Convert an audio stream to MP3 with `libmp3lame`, keeping its metadata.
///
/// An existing `output` is overwritten.
pub async fn extract_audio<I, O>(input: I, output: O) -> BdownResult<()>
where
    I: AsRef<Path>,
    O: AsRef<Path>,
{
    let input = input.as_ref();
    let output = output.as_ref();
    if !input.exists() {
        return Err(BdownError::mux(format!(
            "{} does not exist",
            input.display()
        )));
    }

    let ffmpeg = which::which("ffmpeg")?;
    tracing::debug!(
        "Extracting audio of {} with {}",
        input.display(),
        ffmpeg.display()
    );

    let status = Command::new(ffmpeg)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-vn", "-c:a", "libmp3lame", "-q:a", "9", "-map_metadata", "0"])
        .arg(output)
        .kill_on_drop(true)
        .status()
        .await?;
    if !status.success() {
        return Err(BdownError::mux(format!("ffmpeg exited with {status}")));
    }

    tracing::info!("Extracted audio to {}", output.display());
    Ok(())
}
