use super::model::{DashInfo, StreamCandidate};
use crate::{BdownError, BdownResult, StreamKind};

/// URLs picked for one download, both guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStreamPair {
    video_url: String,
    audio_url: String,
}

impl ResolvedStreamPair {
    pub fn new(video_url: impl Into<String>, audio_url: impl Into<String>) -> BdownResult<Self> {
        let video_url = video_url.into();
        let audio_url = audio_url.into();
        if video_url.is_empty() {
            return Err(BdownError::resolution("empty video URL"));
        }
        if audio_url.is_empty() {
            return Err(BdownError::resolution("empty audio URL"));
        }

        Ok(Self {
            video_url,
            audio_url,
        })
    }

    pub fn url(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Video => &self.video_url,
            StreamKind::Audio => &self.audio_url,
        }
    }

    pub fn video_url(&self) -> &str {
        &self.video_url
    }

    pub fn audio_url(&self) -> &str {
        &self.audio_url
    }
}

/// Pick the candidate with the highest quality id.
///
/// Server ordering is not reliable, so the position in the list only matters
/// between equal ids, where the first one wins.
pub fn best_candidate(candidates: &[StreamCandidate]) -> Option<&StreamCandidate> {
    candidates.iter().fold(None, |best, candidate| match best {
        Some(best) if best.quality_id >= candidate.quality_id => Some(best),
        _ => Some(candidate),
    })
}

/// Source URL of the best candidate, empty when there is none.
pub fn best_url(candidates: Option<&[StreamCandidate]>) -> &str {
    candidates
        .and_then(best_candidate)
        .map(|c| c.source_url.as_str())
        .unwrap_or_default()
}

pub fn select_streams(dash: &DashInfo) -> BdownResult<ResolvedStreamPair> {
    let video_url = best_url(dash.video.as_deref());
    let audio_url = best_url(dash.audio.as_deref());
    ResolvedStreamPair::new(video_url, audio_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u32) -> StreamCandidate {
        StreamCandidate {
            quality_id: id,
            source_url: format!("https://upos.example/{id}.m4s"),
        }
    }

    #[test]
    fn test_highest_id_wins() {
        let dash = DashInfo {
            video: Some(vec![candidate(120), candidate(80)]),
            audio: Some(vec![candidate(30216), candidate(30280)]),
        };

        let pair = select_streams(&dash).unwrap();
        assert_eq!(pair.video_url(), "https://upos.example/120.m4s");
        assert_eq!(pair.audio_url(), "https://upos.example/30280.m4s");
    }

    #[test]
    fn test_order_independent() {
        let ids = [16, 116, 32, 64, 80];
        for rotation in 0..ids.len() {
            let mut rotated = ids.to_vec();
            rotated.rotate_left(rotation);
            let candidates: Vec<_> = rotated.into_iter().map(candidate).collect();
            assert_eq!(best_candidate(&candidates).unwrap().quality_id, 116);
        }
    }

    #[test]
    fn test_tie_keeps_first() {
        let candidates = vec![
            StreamCandidate {
                quality_id: 80,
                source_url: "first".to_string(),
            },
            StreamCandidate {
                quality_id: 80,
                source_url: "second".to_string(),
            },
        ];
        assert_eq!(best_candidate(&candidates).unwrap().source_url, "first");
    }

    #[test]
    fn test_empty_list_fails() {
        let dash = DashInfo {
            video: Some(vec![candidate(80)]),
            audio: Some(vec![]),
        };
        let err = select_streams(&dash).unwrap_err();
        assert_eq!(err.to_string(), "empty audio URL");

        let dash = DashInfo {
            video: None,
            audio: Some(vec![candidate(30280)]),
        };
        let err = select_streams(&dash).unwrap_err();
        assert_eq!(err.to_string(), "empty video URL");
    }
}
