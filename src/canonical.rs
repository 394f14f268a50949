//! URL canonicalization and content identifiers
//!
//! Every ingestor dedups on the canonical form of a URL. Two URLs that differ
//! only by http/https, a `www.` prefix, a default port, tracking parameters,
//! duplicate slashes, parameter order or a fragment map to the same string,
//! and therefore to the same [`ContentUid`].

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use url::Url;

/// Query parameters that only identify the referrer, never the content
pub const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
];

/// Length of a content UID in hex characters
pub const UID_LEN: usize = 16;

/// Canonicalize a raw URL string.
///
/// Never fails: empty input is returned unchanged and input that cannot be
/// parsed even with an `http://` prefix is returned as-is. The result is a
/// fixed point, `canonicalize(&canonicalize(u)) == canonicalize(u)`.
pub fn canonicalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return raw.to_string();
    }

    let candidate = if has_scheme(trimmed) {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    match Url::parse(&candidate) {
        Ok(url) => render(&url),
        Err(_) => raw.to_string(),
    }
}

/// True if `input` starts with an RFC 3986 `scheme:` prefix: a letter, then
/// letters, digits, `+`, `-` or `.`, before the first `:`. A `host:port`
/// form (digits after the colon up to a path, query or fragment) is not a
/// scheme.
pub(crate) fn has_scheme(input: &str) -> bool {
    let Some((scheme, rest)) = input.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid {
        return false;
    }

    let port_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let port = &rest[..port_end];
    port.is_empty() || !port.chars().all(|c| c.is_ascii_digit())
}

/// Pass-through variant for optional inputs: `None` stays `None`
pub fn canonicalize_opt(raw: Option<&str>) -> Option<String> {
    raw.map(canonicalize)
}

fn render(url: &Url) -> String {
    let is_web = matches!(url.scheme(), "http" | "https");
    let scheme = if is_web { "http" } else { url.scheme() };

    let mut out = String::with_capacity(url.as_str().len());
    out.push_str(scheme);
    out.push_str("://");

    if !url.username().is_empty() {
        out.push_str(url.username());
        if let Some(password) = url.password() {
            out.push(':');
            out.push_str(password);
        }
        out.push('@');
    }

    if let Some(host) = url.host_str() {
        let host = host.to_lowercase();
        let host = match host.strip_prefix("www.") {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            _ => host,
        };
        out.push_str(&host);
    }

    // http and https collapse to one scheme, so both defaults go
    match url.port() {
        Some(80) | Some(443) if is_web => {}
        Some(port) => {
            out.push(':');
            out.push_str(&port.to_string());
        }
        None => {}
    }

    out.push_str(&collapse_path(url.path()));

    if let Some(query) = canonical_query(url) {
        out.push('?');
        out.push_str(&query);
    }

    out
}

fn collapse_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return String::new();
    }
    let mut collapsed = String::with_capacity(path.len());
    for segment in segments {
        collapsed.push('/');
        collapsed.push_str(segment);
    }
    collapsed
}

fn canonical_query(url: &Url) -> Option<String> {
    url.query()?;

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if pairs.is_empty() {
        return None;
    }

    pairs.sort();

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    Some(serializer.finish())
}

/// Short content-addressed identifier used as the dedup key across stores
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentUid(String);

impl ContentUid {
    /// UID of a raw URL: first 16 hex chars of SHA-1 over its canonical form
    pub fn from_url(raw: &str) -> Self {
        Self::from_canonical(&canonicalize(raw))
    }

    /// UID of an already canonical URL
    pub fn from_canonical(canonical: &str) -> Self {
        Self::from_bytes(canonical.as_bytes())
    }

    /// UID of arbitrary content, used for text and file captures that have no URL
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha1::digest(bytes);
        let mut hex = hex::encode(digest);
        hex.truncate(UID_LEN);
        Self(hex)
    }

    /// Rehydrate a UID read back from one of our own stores
    pub(crate) fn from_stored(uid: String) -> Self {
        Self(uid)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl AsRef<str> for ContentUid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalence_class() {
        assert_eq!(
            canonicalize("https://www.example.com:443/path?utm_source=x&id=123"),
            canonicalize("http://example.com/path?id=123")
        );
        assert_eq!(
            canonicalize("http://example.com/path?id=123"),
            "http://example.com/path?id=123"
        );
    }

    #[test]
    fn test_mixed_case_scheme_and_host() {
        assert_eq!(
            canonicalize("HTTPS://WWW.Example.com:443/Article?utm_source=newsletter&id=42"),
            "http://example.com/Article?id=42"
        );
    }

    #[test]
    fn test_missing_scheme_defaults_to_http() {
        assert_eq!(canonicalize("example.com/a"), "http://example.com/a");
        assert_eq!(canonicalize("www.example.com"), "http://example.com");
    }

    #[test]
    fn test_scheme_less_url_with_url_in_query() {
        let raw = "www.Example.com/a?utm_source=x&next=http://b.com";
        assert_eq!(
            canonicalize(raw),
            canonicalize("http://example.com/a?next=http%3A%2F%2Fb.com")
        );
        assert_eq!(canonicalize(raw), "http://example.com/a?next=http%3A%2F%2Fb.com");
    }

    #[test]
    fn test_scheme_detection() {
        assert!(has_scheme("http://example.com"));
        assert!(has_scheme("HTTPS://example.com"));
        assert!(has_scheme("git+ssh://host/repo"));
        assert!(has_scheme("mailto:someone@example.com"));
        assert!(!has_scheme("example.com/a"));
        assert!(!has_scheme("example.com/a?next=http://b.com"));
        assert!(!has_scheme("example.com:8080/a"));
        assert!(!has_scheme("localhost:3000"));
        assert!(!has_scheme("1http://example.com"));
        assert_eq!(canonicalize("example.com:8080/a"), "http://example.com:8080/a");
    }

    #[test]
    fn test_path_slashes_and_fragment() {
        assert_eq!(
            canonicalize("http://example.com//a///b/#section"),
            "http://example.com/a/b"
        );
        assert_eq!(canonicalize("http://example.com/"), "http://example.com");
    }

    #[test]
    fn test_query_sorted_and_tracking_removed() {
        assert_eq!(
            canonicalize("http://example.com/p?b=2&fbclid=zz&a=1&gclid=yy&utm_term=t"),
            "http://example.com/p?a=1&b=2"
        );
        assert_eq!(
            canonicalize("http://example.com/p?utm_medium=email"),
            "http://example.com/p"
        );
    }

    #[test]
    fn test_non_default_port_kept() {
        assert_eq!(
            canonicalize("http://example.com:8080/x"),
            "http://example.com:8080/x"
        );
        assert_eq!(canonicalize("https://example.com:80/x"), "http://example.com/x");
    }

    #[test]
    fn test_empty_and_malformed_pass_through() {
        assert_eq!(canonicalize(""), "");
        assert_eq!(canonicalize("   "), "   ");
        assert_eq!(canonicalize_opt(None), None);
        assert_eq!(canonicalize("http://[::1"), "http://[::1");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "",
            "not a url at all",
            "HTTPS://WWW.Example.com:443/Article?utm_source=newsletter&id=42",
            "example.com",
            "http://example.com//a//?z=1&a=2&a=1#frag",
            "https://user:pw@Sub.Example.org:8443/x%20y?q=a+b",
            "ftp://files.example.com/pub/",
            "http://[::1",
            "https://www./path",
            "http://example.com/?flag",
            "mailto:someone@example.com",
        ];
        for sample in samples {
            let once = canonicalize(sample);
            assert_eq!(canonicalize(&once), once, "not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_uid_shape_and_determinism() {
        let uid = ContentUid::from_url("https://www.example.com/path?utm_source=x&id=123");
        assert_eq!(uid.as_str().len(), UID_LEN);
        assert!(uid
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(uid, ContentUid::from_url("http://example.com/path?id=123"));
        assert_ne!(uid, ContentUid::from_url("http://example.com/path?id=124"));
    }

    #[test]
    fn test_uid_matches_sha1_prefix() {
        // sha1("http://example.com") = 89dce6a446a69d6b9bdc01ac75251e4c322bcdff
        assert_eq!(
            ContentUid::from_canonical("http://example.com").as_str(),
            "89dce6a446a69d6b"
        );
    }
}
