mod model;
mod selector;

pub use model::*;
pub use selector::*;

use std::future::Future;

use reqwest::{
    header::{COOKIE, REFERER},
    RequestBuilder,
};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{BdownError, BdownResult, HttpClient};

/// Referer expected by the API endpoints.
pub const API_REFERER: &str = "http://www.bilibili.com";

pub const DEFAULT_API_BASE: &str = "https://api.bilibili.com";

/// Turns a part into the pair of stream URLs to download.
pub trait StreamResolver {
    fn resolve(
        &self,
        part: &MediaPart,
    ) -> impl Future<Output = BdownResult<ResolvedStreamPair>> + Send;
}

#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    base: Url,
}

impl ApiEndpoints {
    /// `base` may carry a path prefix, endpoints are resolved below it.
    pub fn new(base: &str) -> BdownResult<Self> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }

    pub fn pagelist(&self) -> BdownResult<Url> {
        Ok(self.base.join("x/player/pagelist")?)
    }

    pub fn playurl(&self) -> BdownResult<Url> {
        Ok(self.base.join("x/player/wbi/playurl")?)
    }
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            base: Url::parse(DEFAULT_API_BASE).expect("default API base is a valid URL"),
        }
    }
}

/// Login cookies. Both default to empty, which the API treats as a guest.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub sessdata: String,
    pub bili_jct: String,
}

impl Credentials {
    pub fn new(sessdata: impl Into<String>, bili_jct: impl Into<String>) -> Self {
        Self {
            sessdata: sessdata.into(),
            bili_jct: bili_jct.into(),
        }
    }

    pub fn cookie_header(&self) -> String {
        format!("SESSDATA={};bili_jct={}", self.sessdata, self.bili_jct)
    }
}

#[derive(Clone)]
pub struct BiliClient {
    client: HttpClient,
    endpoints: ApiEndpoints,
    credentials: Credentials,
}

impl BiliClient {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            endpoints: ApiEndpoints::default(),
            credentials: Credentials::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: ApiEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// List the parts of a video together with its cover.
    pub async fn query_parts(&self, bvid: &str) -> BdownResult<MediaInfo> {
        let request = self
            .client
            .get(self.endpoints.pagelist()?)
            .query(&[("bvid", bvid)]);
        let pages: Vec<PageEntry> = self.fetch_data(request).await?;
        if pages.is_empty() {
            return Err(BdownError::resolution(format!("no parts found for {bvid}")));
        }

        Ok(MediaInfo::from_pages(bvid, pages))
    }

    /// Fetch the DASH description of a part and pick the best streams.
    pub async fn resolve_streams(&self, part: &MediaPart) -> BdownResult<ResolvedStreamPair> {
        let cid = part.cid.to_string();
        let request = self
            .client
            .get(self.endpoints.playurl()?)
            .query(&[
                ("bvid", part.bvid.as_str()),
                ("cid", cid.as_str()),
                ("qn", "127"),
                ("fnval", "4048"),
                ("fnver", "0"),
                ("fourk", "1"),
                ("voice_balance", "1"),
            ])
            .header(REFERER, API_REFERER)
            .header(COOKIE, self.credentials.cookie_header());

        let data: PlayUrlData = self.fetch_data(request).await?;
        let Some(dash) = data.dash else {
            return Err(BdownError::resolution("response has no dash field"));
        };

        let pair = select_streams(&dash)?;
        tracing::debug!(
            "Resolved {} (cid {}): video={}, audio={}",
            part.bvid,
            part.cid,
            pair.video_url(),
            pair.audio_url()
        );
        Ok(pair)
    }

    /// Send the request and unwrap the `data` of a successful envelope.
    ///
    /// Every failure is reported as [BdownError::Resolution].
    async fn fetch_data<T>(&self, request: RequestBuilder) -> BdownResult<T>
    where
        T: DeserializeOwned,
    {
        let response = request
            .send()
            .await
            .map_err(|e| BdownError::resolution(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BdownError::resolution(format!("HTTP error: {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| BdownError::resolution(format!("failed to read body: {e}")))?;
        if body.trim().is_empty() {
            return Err(BdownError::resolution("empty response body"));
        }

        let envelope: ApiResponse<T> = serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("Malformed response body: {body}");
            BdownError::resolution(format!("malformed response: {e}"))
        })?;
        if envelope.code != 0 {
            return Err(BdownError::resolution(format!(
                "code {}: {}",
                envelope.code, envelope.message
            )));
        }

        envelope
            .data
            .ok_or_else(|| BdownError::resolution("response has no data"))
    }
}

impl StreamResolver for BiliClient {
    fn resolve(
        &self,
        part: &MediaPart,
    ) -> impl Future<Output = BdownResult<ResolvedStreamPair>> + Send {
        self.resolve_streams(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_keep_path_prefix() {
        let endpoints = ApiEndpoints::new("http://127.0.0.1:8080/bili").unwrap();
        assert_eq!(
            endpoints.pagelist().unwrap().as_str(),
            "http://127.0.0.1:8080/bili/x/player/pagelist"
        );

        let endpoints = ApiEndpoints::new("http://127.0.0.1:8080/bili/").unwrap();
        assert_eq!(
            endpoints.playurl().unwrap().as_str(),
            "http://127.0.0.1:8080/bili/x/player/wbi/playurl"
        );

        assert_eq!(
            ApiEndpoints::default().playurl().unwrap().as_str(),
            "https://api.bilibili.com/x/player/wbi/playurl"
        );
    }
}
