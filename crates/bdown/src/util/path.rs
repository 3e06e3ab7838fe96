use std::path::{Path, PathBuf};

use crate::StreamKind;

/// Default folder name downloads are written to.
pub const DEFAULT_DOWNLOAD_FOLDER: &str = "bilibiliDown";

/// Make an untrusted title safe to use as a single path component.
///
/// Path separators become spaces, NUL bytes are dropped. A title that ends up
/// empty or names a relative directory is replaced by `untitled`.
pub fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    match sanitized.trim() {
        "" | "." | ".." => "untitled".to_string(),
        _ => sanitized,
    }
}

/// Paths of the files produced for one part inside the flat download folder.
///
/// Two parts whose titles sanitize to the same string share these paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    dir: PathBuf,
    stem: String,
}

impl OutputLayout {
    pub fn new(dir: impl Into<PathBuf>, title: &str) -> Self {
        Self {
            dir: dir.into(),
            stem: sanitize_title(title),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// `<title>_video.m4s` or `<title>_audio.m4s`
    pub fn stream_path(&self, kind: StreamKind) -> PathBuf {
        self.dir.join(format!("{}_{}.m4s", self.stem, kind.as_str()))
    }

    /// `<title>.mp4`
    pub fn output_path(&self) -> PathBuf {
        self.dir.join(format!("{}.mp4", self.stem))
    }

    /// `<title>.mp3`
    pub fn mp3_path(&self) -> PathBuf {
        self.dir.join(format!("{}.mp3", self.stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_separators() {
        assert_eq!(sanitize_title("a/b\\c"), "a b c");
        assert_eq!(sanitize_title("../../etc/passwd"), ".. .. etc passwd");
        assert_eq!(sanitize_title("P1 第一集"), "P1 第一集");
    }

    #[test]
    fn test_sanitize_degenerate_titles() {
        assert_eq!(sanitize_title(""), "untitled");
        assert_eq!(sanitize_title(".."), "untitled");
        assert_eq!(sanitize_title("/"), "untitled");
        assert_eq!(sanitize_title("\0"), "untitled");
    }

    #[test]
    fn test_layout_file_names() {
        let layout = OutputLayout::new("downloads", "Ep.1/intro");
        assert_eq!(
            layout.stream_path(StreamKind::Video),
            PathBuf::from("downloads/Ep.1 intro_video.m4s")
        );
        assert_eq!(
            layout.stream_path(StreamKind::Audio),
            PathBuf::from("downloads/Ep.1 intro_audio.m4s")
        );
        assert_eq!(
            layout.output_path(),
            PathBuf::from("downloads/Ep.1 intro.mp4")
        );
        assert_eq!(layout.mp3_path(), PathBuf::from("downloads/Ep.1 intro.mp3"));
    }
}
