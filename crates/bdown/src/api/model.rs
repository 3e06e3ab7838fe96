use serde::Deserialize;

/// Common envelope of every API response.
///
/// `code == 0` means success, anything else comes with a `message`.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ttl: i64,
    pub data: Option<T>,
}

/// One entry of the `pagelist` response.
#[derive(Debug, Clone, Deserialize)]
pub struct PageEntry {
    pub cid: u64,
    /// Title of the part
    #[serde(default)]
    pub part: String,
    /// Seconds
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub first_frame: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlayUrlData {
    pub dash: Option<DashInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DashInfo {
    #[serde(default)]
    pub video: Option<Vec<StreamCandidate>>,
    /// `null` for silent videos
    #[serde(default)]
    pub audio: Option<Vec<StreamCandidate>>,
}

/// One representation of a stream kind.
///
/// The API also repeats the URL as `base_url` next to `baseUrl`; only the
/// latter is read.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamCandidate {
    #[serde(rename = "id")]
    pub quality_id: u32,
    #[serde(rename = "baseUrl")]
    pub source_url: String,
}

/// One downloadable unit of a video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPart {
    pub bvid: String,
    pub cid: u64,
    pub title: String,
    pub duration: u64,
}

impl MediaPart {
    pub fn new(bvid: impl Into<String>, cid: u64, title: impl Into<String>, duration: u64) -> Self {
        Self {
            bvid: bvid.into(),
            cid,
            title: title.into(),
            duration,
        }
    }

    /// `1h 2m 3s`, dropping zero components; `0s` for an empty duration.
    pub fn format_duration(&self) -> String {
        format_compact_duration(self.duration)
    }
}

pub fn format_compact_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::with_capacity(3);
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }
    parts.join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub cover_url: Option<String>,
    pub parts: Vec<MediaPart>,
}

impl MediaInfo {
    pub(crate) fn from_pages(bvid: &str, pages: Vec<PageEntry>) -> Self {
        let cover_url = pages.first().and_then(|p| p.first_frame.clone());
        let parts = pages
            .into_iter()
            .map(|page| MediaPart::new(bvid, page.cid, page.part, page.duration))
            .collect();
        Self { cover_url, parts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_compact_duration() {
        assert_eq!(format_compact_duration(0), "0s");
        assert_eq!(format_compact_duration(59), "59s");
        assert_eq!(format_compact_duration(60), "1m");
        assert_eq!(format_compact_duration(3600), "1h");
        assert_eq!(format_compact_duration(3723), "1h 2m 3s");
        assert_eq!(format_compact_duration(3605), "1h 5s");
    }

    #[test]
    fn test_dash_with_null_audio() {
        let data: PlayUrlData = serde_json::from_str(
            r#"{"dash":{"video":[{"id":80,"baseUrl":"https://a/v","base_url":"https://a/v"}],"audio":null}}"#,
        )
        .unwrap();
        let dash = data.dash.unwrap();
        assert_eq!(dash.video.unwrap().len(), 1);
        assert!(dash.audio.is_none());
    }
}
