use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use bdown::{
    api::{ApiEndpoints, BiliClient, Credentials, MediaPart, DEFAULT_API_BASE},
    download::ChunkDownloader,
    event::EventSender,
    pipeline::{Pipeline, PipelineOptions},
    util::{parse_bvid, path::DEFAULT_DOWNLOAD_FOLDER},
    HttpClient,
};
use clap::{Args, Parser};
use clap_handler::handler;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::progress;

#[derive(Parser, Clone, Debug)]
#[clap(name = "download", visible_alias = "dl")]
pub struct DownloadCommand {
    #[clap(flatten)]
    pub http: HttpOptions,

    #[clap(flatten)]
    pub api: ApiOptions,

    /// Parts to download, starting from 1. Defaults to the first part
    #[clap(short, long = "part", conflicts_with = "all")]
    pub parts: Vec<usize>,

    /// Download every part
    #[clap(long)]
    pub all: bool,

    /// Folder the streams and the merged file are written to
    #[clap(short, long, default_value = DEFAULT_DOWNLOAD_FOLDER)]
    pub output_dir: PathBuf,

    /// Remove the downloaded streams after merging
    #[clap(long)]
    pub no_keep: bool,

    /// Merge with libavformat instead of the built-in muxer
    #[cfg(feature = "ffmpeg")]
    #[clap(long)]
    pub ffmpeg: bool,

    /// BV id or video URL
    pub input: String,
}

impl DownloadCommand {
    fn select_parts(&self, parts: Vec<MediaPart>) -> anyhow::Result<Vec<MediaPart>> {
        if self.all {
            return Ok(parts);
        }
        if self.parts.is_empty() {
            return Ok(parts.into_iter().take(1).collect());
        }

        self.parts
            .iter()
            .map(|&index| {
                index
                    .checked_sub(1)
                    .and_then(|i| parts.get(i))
                    .cloned()
                    .with_context(|| format!("part {index} out of range 1..={}", parts.len()))
            })
            .collect()
    }

    #[allow(unused_mut)]
    fn options(&self) -> PipelineOptions {
        let mut options = PipelineOptions {
            keep_intermediates: !self.no_keep,
            ..Default::default()
        };
        #[cfg(feature = "ffmpeg")]
        if self.ffmpeg {
            options.backend = bdown::merge::MuxBackend::Ffmpeg;
        }
        options
    }
}

#[handler(DownloadCommand)]
pub async fn download(me: DownloadCommand) -> anyhow::Result<()> {
    let bvid = parse_bvid(&me.input)
        .with_context(|| format!("no BV id found in {}", me.input))?
        .to_string();

    let client = me.http.clone().into_client()?;
    let bili = me.api.clone().into_bili_client(client.clone())?;
    let info = bili.query_parts(&bvid).await?;
    let parts = me.select_parts(info.parts)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling the running download");
                cancel.cancel();
            }
        }
    });

    let pipeline = Pipeline::new(bili, ChunkDownloader::new(client), &me.output_dir)
        .with_options(me.options());

    let mut failed = 0;
    for part in &parts {
        tracing::info!("{} [{}] {}", bvid, part.format_duration(), part.title);

        let (events, rx) = EventSender::channel();
        let renderer = tokio::spawn(progress::render(rx));
        let result = pipeline.run(part, &events, &cancel).await;
        drop(events);
        renderer.await?;

        match result {
            Ok(_) => {}
            Err(e) if e.kind() == bdown::ErrorKind::Cancelled => return Err(e.into()),
            Err(_) => failed += 1,
        }
    }

    if failed > 0 {
        bail!("{failed} of {} parts failed", parts.len());
    }
    Ok(())
}

#[derive(Args, Clone, Debug)]
pub struct HttpOptions {
    /// Additional HTTP headers
    #[clap(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Connect and read timeout, in seconds
    #[clap(short, long, default_value = "600")]
    pub timeout: u64,
}

impl HttpOptions {
    pub fn into_client(self) -> anyhow::Result<HttpClient> {
        let mut headers = HeaderMap::new();

        for header in &self.headers {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("invalid header: {header}"))?;
            headers.insert(
                HeaderName::from_str(key.trim())
                    .with_context(|| format!("invalid header name: {key}"))?,
                HeaderValue::from_str(value.trim())
                    .with_context(|| format!("invalid header value: {value}"))?,
            );
        }

        let timeout = Duration::from_secs(self.timeout);
        Ok(HttpClient::new(
            HttpClient::builder()
                .default_headers(headers)
                .connect_timeout(timeout)
                .read_timeout(timeout),
        )?)
    }
}

#[derive(Args, Clone, Debug)]
pub struct ApiOptions {
    /// Base URL of the web API
    #[clap(long, default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// SESSDATA cookie of a logged in account
    #[clap(long, env = "BDOWN_SESSDATA")]
    pub sessdata: Option<String>,

    /// bili_jct cookie of a logged in account
    #[clap(long, env = "BDOWN_BILI_JCT")]
    pub bili_jct: Option<String>,
}

impl ApiOptions {
    pub fn into_bili_client(self, client: HttpClient) -> anyhow::Result<BiliClient> {
        let mut bili = BiliClient::new(client).with_endpoints(ApiEndpoints::new(&self.api_base)?);
        if self.sessdata.is_some() || self.bili_jct.is_some() {
            bili = bili.with_credentials(Credentials::new(
                self.sessdata.unwrap_or_default(),
                self.bili_jct.unwrap_or_default(),
            ));
        }
        Ok(bili)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> DownloadCommand {
        DownloadCommand::parse_from(std::iter::once("download").chain(args.iter().copied()))
    }

    fn parts(count: u64) -> Vec<MediaPart> {
        (1..=count)
            .map(|cid| MediaPart::new("BV1xx411c7mD", cid, format!("P{cid}"), 10))
            .collect()
    }

    #[test]
    fn test_select_parts() -> anyhow::Result<()> {
        let first = command(&["BV1xx411c7mD"]).select_parts(parts(3))?;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].cid, 1);

        let all = command(&["--all", "BV1xx411c7mD"]).select_parts(parts(3))?;
        assert_eq!(all.len(), 3);

        let picked = command(&["-p", "3", "-p", "2", "BV1xx411c7mD"]).select_parts(parts(3))?;
        assert_eq!(
            picked.iter().map(|p| p.cid).collect::<Vec<_>>(),
            vec![3, 2]
        );

        assert!(command(&["-p", "0", "BV1xx411c7mD"])
            .select_parts(parts(3))
            .is_err());
        assert!(command(&["-p", "4", "BV1xx411c7mD"])
            .select_parts(parts(3))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_header() {
        let options = HttpOptions {
            headers: vec!["no-colon".to_string()],
            timeout: 600,
        };
        assert!(options.into_client().is_err());
    }
}
