// src/utils/url.rs

//! URL canonicalization.
//!
//! The canonical form is the identity of a link across posts: the same
//! article shared with different tracking parameters or fragments maps to
//! one registry entry.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::ProcessError;

static TRACKING_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(utm_[a-z_]+|fbclid|gclid|mc_cid|mc_eid|ref_src|igshid)$")
        .expect("tracking parameter pattern is valid")
});

/// Canonicalize a link for identity purposes.
///
/// Lowercases scheme and host, drops the fragment and tracking parameters,
/// and removes the trailing slash of a bare domain root.
///
/// # Examples
/// ```
/// use digestline::utils::url::normalize_url;
///
/// assert_eq!(
///     normalize_url("https://Example.com/?utm_source=x#top").unwrap(),
///     "https://example.com"
/// );
/// ```
pub fn normalize_url(raw: &str) -> Result<String, ProcessError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| ProcessError::InvalidIdentity(format!("{raw}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProcessError::InvalidIdentity(format!(
            "{raw}: unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ProcessError::InvalidIdentity(format!("{raw}: missing host")));
    }

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAM.is_match(&k.to_lowercase()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let mut canonical = url.to_string();
    if url.path() == "/" && url.query().is_none() {
        canonical.pop();
    }
    Ok(canonical)
}

/// Extract the host of a URL, lowercased and without a leading `www.`.
///
/// # Examples
/// ```
/// use digestline::utils::url::get_domain;
///
/// assert_eq!(
///     get_domain("https://www.Example.COM/path"),
///     Some("example.com".to_string())
/// );
/// ```
pub fn get_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}

/// True when the link points at one of `domains` or a subdomain of one.
pub fn is_excluded(url: &str, domains: &[String]) -> bool {
    let Some(host) = get_domain(url) else {
        return false;
    };
    domains.iter().any(|d| {
        let d = d.trim().to_lowercase();
        !d.is_empty() && (host == d || host.ends_with(&format!(".{d}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_root_slash_only() {
        assert_eq!(
            normalize_url("https://example.com/").unwrap(),
            "https://example.com"
        );
        assert_eq!(
            normalize_url("https://example.com/blog/").unwrap(),
            "https://example.com/blog/"
        );
    }

    #[test]
    fn test_drops_fragment_and_tracking() {
        assert_eq!(
            normalize_url("https://example.com/a?utm_source=bsky&id=7&fbclid=x#section").unwrap(),
            "https://example.com/a?id=7"
        );
        assert_eq!(
            normalize_url("HTTPS://EXAMPLE.com/a?utm_medium=social").unwrap(),
            "https://example.com/a"
        );
    }

    #[test]
    fn test_equivalent_links_share_identity() {
        let a = normalize_url("https://example.com/post#comments").unwrap();
        let b = normalize_url("https://example.com/post?utm_campaign=x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_unparseable() {
        assert!(matches!(
            normalize_url("not a url"),
            Err(ProcessError::InvalidIdentity(_))
        ));
        assert!(normalize_url("ftp://example.com/file").is_err());
        assert!(normalize_url("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_get_domain() {
        assert_eq!(
            get_domain("https://sub.example.com:8080/path"),
            Some("sub.example.com".to_string())
        );
        assert_eq!(get_domain("invalid-url"), None);
    }

    #[test]
    fn test_is_excluded() {
        let domains = vec!["bsky.app".to_string()];
        assert!(is_excluded("https://bsky.app/profile/x/post/y", &domains));
        assert!(is_excluded("https://staging.bsky.app/", &domains));
        assert!(!is_excluded("https://notbsky.app/", &domains));
    }
}
