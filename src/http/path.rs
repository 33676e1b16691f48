//! URL path joining.

use url::Url;

/// Join two path segments with exactly one `/` between them.
///
/// An empty side yields the other side unchanged.
pub fn join_path(left: &str, right: &str) -> String {
    if right.is_empty() {
        return left.to_string();
    }
    if left.is_empty() {
        return right.to_string();
    }

    let left = left.trim_end_matches('/');
    let right = right.trim_start_matches('/');
    let mut joined = String::with_capacity(left.len() + right.len() + 1);
    joined.push_str(left);
    joined.push('/');
    joined.push_str(right);
    joined
}

/// Join any number of segments, skipping empty ones.
pub fn join_paths<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .fold(String::new(), |acc, segment| join_path(&acc, segment))
}

/// Whether `url` carries its own scheme and host.
///
/// `host:port/path` style strings without a scheme are treated as relative.
pub fn is_absolute_url(url: &str) -> bool {
    Url::parse(url).is_ok_and(|url| url.has_host())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_removes_double_separator() {
        assert_eq!(join_path("a/", "/b"), "a/b");
    }

    #[test]
    fn test_join_inserts_separator() {
        assert_eq!(join_path("a", "b"), "a/b");
    }

    #[test]
    fn test_join_empty_right() {
        assert_eq!(join_path("a", ""), "a");
        assert_eq!(join_path("", "b"), "b");
    }

    #[test]
    fn test_join_keeps_scheme() {
        assert_eq!(
            join_path("https://cloud.example.com/", "/api/v1"),
            "https://cloud.example.com/api/v1"
        );
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(
            join_paths(["https://host", "api/v1/", "", "/devices"]),
            "https://host/api/v1/devices"
        );
    }

    #[test]
    fn test_absolute_url() {
        assert!(is_absolute_url("https://host/x"));
        assert!(is_absolute_url("wss://host/socket"));
        assert!(!is_absolute_url("/devices"));
        assert!(!is_absolute_url("devices/1"));
        assert!(!is_absolute_url("localhost:8080/x"));
    }
}
