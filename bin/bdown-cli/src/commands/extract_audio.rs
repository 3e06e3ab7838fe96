use std::path::PathBuf;

use bdown::{
    merge::ffmpeg_cli::extract_audio,
    util::path::{OutputLayout, DEFAULT_DOWNLOAD_FOLDER},
    StreamKind,
};
use clap::Parser;
use clap_handler::handler;

/// Convert a downloaded `<title>_audio.m4s` to mp3 with the system ffmpeg
#[derive(Parser, Clone, Debug)]
#[clap(name = "extract-audio", visible_alias = "mp3")]
pub struct ExtractAudioCommand {
    #[clap(short, long, default_value = DEFAULT_DOWNLOAD_FOLDER)]
    pub output_dir: PathBuf,

    /// Title of a downloaded part
    pub title: String,
}

#[handler(ExtractAudioCommand)]
pub async fn extract_audio_command(me: ExtractAudioCommand) -> anyhow::Result<()> {
    let layout = OutputLayout::new(me.output_dir, &me.title);
    let output = layout.mp3_path();
    extract_audio(&layout.stream_path(StreamKind::Audio), &output).await?;
    println!("{}", output.display());
    Ok(())
}
