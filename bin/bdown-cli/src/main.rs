use clap::Parser;
use clap_handler::Handler;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod commands;
mod progress;

#[derive(Parser, clap_handler::Handler, Clone)]
#[clap(name = "bdown", version, about)]
struct BdownArgs {
    /// Print debug logs
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: commands::BdownCommand,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = BdownArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    args.run().await
}
