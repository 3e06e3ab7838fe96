pub mod http;
pub mod path;

/// Extract a `BV...` id from a share URL, or return the input when it already
/// is one.
///
/// Returns `None` when no path segment starts with `BV`.
pub fn parse_bvid(input: &str) -> Option<&str> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    // drop query and fragment before splitting into segments
    let path = input.split(['?', '#']).next().unwrap_or(input);
    path.split('/')
        .find(|part| part.starts_with("BV") && part.len() > 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bvid() {
        assert_eq!(parse_bvid("BV1xx411c7mD"), Some("BV1xx411c7mD"));
        assert_eq!(
            parse_bvid("https://www.bilibili.com/video/BV1xx411c7mD/?share_source=copy"),
            Some("BV1xx411c7mD")
        );
        assert_eq!(
            parse_bvid("https://b23.tv/BV1xx411c7mD?p=2"),
            Some("BV1xx411c7mD")
        );
    }

    #[test]
    fn test_parse_bvid_missing() {
        assert_eq!(parse_bvid(""), None);
        assert_eq!(parse_bvid("   "), None);
        assert_eq!(parse_bvid("https://www.bilibili.com/video/av170001"), None);
        assert_eq!(parse_bvid("BV"), None);
    }
}
