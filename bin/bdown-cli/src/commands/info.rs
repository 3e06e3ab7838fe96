use anyhow::Context;
use bdown::util::parse_bvid;
use clap::Parser;
use clap_handler::handler;

use super::download::{ApiOptions, HttpOptions};

#[derive(Parser, Clone, Debug)]
#[clap(name = "info")]
pub struct InfoCommand {
    #[clap(flatten)]
    pub http: HttpOptions,

    #[clap(flatten)]
    pub api: ApiOptions,

    /// BV id or video URL
    pub input: String,
}

#[handler(InfoCommand)]
pub async fn info(me: InfoCommand) -> anyhow::Result<()> {
    let bvid = parse_bvid(&me.input).with_context(|| format!("no BV id found in {}", me.input))?;

    let client = me.http.into_client()?;
    let info = me.api.into_bili_client(client)?.query_parts(bvid).await?;

    if let Some(cover) = &info.cover_url {
        println!("cover: {cover}");
    }
    for (index, part) in info.parts.iter().enumerate() {
        println!(
            "P{:<3} cid={:<12} {:>10}  {}",
            index + 1,
            part.cid,
            part.format_duration(),
            part.title
        );
    }
    Ok(())
}
