use std::time::SystemTime;

/// Outcome of evaluating a client's conditional-GET validators against a stored entry.
pub struct ConditionalOutcome {
    /// Whether the response should be served as `304 Not Modified` rather than `200 OK`.
    pub not_modified: bool,
}

/// Evaluates `If-None-Match` / `If-Modified-Since` against a stored entry's ETag and
/// last-modified time.
///
/// `can_use_client_cache` becomes true as soon as either validator header is present and
/// parses; a mismatching `If-None-Match` or a stale `If-Modified-Since` forces a full `200`
/// response. A malformed `If-Modified-Since` is treated as no validator having been supplied
/// at all, and forces a full `200` response rather than risk serving a stale `304` off
/// unparsable input.
pub fn evaluate(
    tag: &str,
    modified: SystemTime,
    if_none_match: Option<&str>,
    if_modified_since: Option<&str>,
) -> ConditionalOutcome {
    let mut can_use_client_cache = false;
    let mut cache_ok = true;

    if let Some(etag) = if_none_match {
        can_use_client_cache = true;
        if etag != tag {
            cache_ok = false;
        }
    }

    if cache_ok {
        if let Some(since) = if_modified_since {
            match httpdate::parse_http_date(since) {
                Ok(when) => {
                    can_use_client_cache = true;
                    if modified > when {
                        cache_ok = false;
                    }
                }
                // Malformed header: treat as "no validator provided" and fall through to a
                // full response rather than risk serving a stale 304 off bad input.
                Err(_) => cache_ok = false,
            }
        }
    }

    ConditionalOutcome {
        not_modified: can_use_client_cache && cache_ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn http_date(t: SystemTime) -> String {
        httpdate::fmt_http_date(t)
    }

    #[test]
    fn no_validators_serves_full_response() {
        let outcome = evaluate("abc", SystemTime::now(), None, None);
        assert!(!outcome.not_modified);
    }

    #[test]
    fn matching_etag_serves_not_modified() {
        let outcome = evaluate("abc", SystemTime::now(), Some("abc"), None);
        assert!(outcome.not_modified);
    }

    #[test]
    fn mismatched_etag_serves_full_response() {
        let outcome = evaluate("abc", SystemTime::now(), Some("def"), None);
        assert!(!outcome.not_modified);
    }

    #[test]
    fn fresh_if_modified_since_serves_not_modified() {
        let modified = SystemTime::now() - Duration::from_secs(120);
        let since = http_date(SystemTime::now());
        let outcome = evaluate("abc", modified, None, Some(&since));
        assert!(outcome.not_modified);
    }

    #[test]
    fn stale_if_modified_since_serves_full_response() {
        let modified = SystemTime::now();
        let since = http_date(SystemTime::now() - Duration::from_secs(120));
        let outcome = evaluate("abc", modified, None, Some(&since));
        assert!(!outcome.not_modified);
    }

    #[test]
    fn unparsable_if_modified_since_serves_full_response() {
        let outcome = evaluate("abc", SystemTime::now(), None, Some("not-a-date"));
        assert!(!outcome.not_modified);
    }

    #[test]
    fn etag_takes_precedence_when_both_validators_present() {
        let modified = SystemTime::now() - Duration::from_secs(120);
        let since = http_date(SystemTime::now());
        let outcome = evaluate("abc", modified, Some("wrong"), Some(&since));
        assert!(!outcome.not_modified);
    }
}
