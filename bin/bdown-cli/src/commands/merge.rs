use std::path::PathBuf;

use bdown::merge::MuxJob;
use clap::Parser;
use clap_handler::handler;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Clone, Debug)]
#[clap(name = "merge", short_flag = 'm')]
pub struct MergeCommand {
    /// Video-only mp4 or m4s file
    #[clap(long)]
    pub video: PathBuf,

    /// Audio-only mp4 or m4s file
    #[clap(long)]
    pub audio: PathBuf,

    #[clap(short, long)]
    pub output: PathBuf,
}

#[handler(MergeCommand)]
pub async fn merge_command(me: MergeCommand) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let stats = MuxJob::new(me.video, me.audio, &me.output)
        .run(&cancel)
        .await?;
    println!(
        "{}: {} video samples, {} audio samples",
        me.output.display(),
        stats.video_samples,
        stats.audio_samples
    );
    Ok(())
}
