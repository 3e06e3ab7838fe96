use clap::Subcommand;
use clap_handler::Handler;

mod download;
mod extract_audio;
mod info;
mod merge;

#[derive(Subcommand, Clone, Handler)]
pub enum BdownCommand {
    Info(info::InfoCommand),
    Download(download::DownloadCommand),
    Merge(merge::MergeCommand),
    ExtractAudio(extract_audio::ExtractAudioCommand),
}
