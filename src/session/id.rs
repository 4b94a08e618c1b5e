//! Session id generation and parsing.
//!
//! Grounded on `httpSession.c`'s `makeSessionID`/`httpGetSessionID`: an MD5 digest of a
//! per-call input (address-derived entropy, wall-clock time, and a monotonic counter) prefixed
//! with a fixed domain separator, and a hand-rolled scan of the `Cookie` header that understands
//! quoted values.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::SESSION_COOKIE;

const DOMAIN_SEPARATOR: &str = "::http.session::";

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a fresh, statistically unique session id.
///
/// The counter races harmlessly across threads (relaxed ordering): the MD5 input also mixes in
/// wall-clock time and a stack-address-derived value, so a counter collision alone cannot
/// produce a duplicate id.
pub fn generate() -> String {
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // A stack address stands in for the host's connection-pointer entropy.
    let marker = 0u8;
    let addr = &marker as *const u8 as usize;

    let input = format!("{addr:x}{now:x}{count}");
    format!("{DOMAIN_SEPARATOR}{:x}", md5::compute(input.as_bytes()))
}

/// Scans a raw `Cookie` header value for the session cookie, returning its value.
///
/// Handles both quoted (`-http-session-="a;b"`) and unquoted values, matching the source
/// `httpGetSessionID` scanner: an escaped delimiter (preceded by `\`) does not terminate the
/// value.
pub fn parse_from_cookie_header(cookie_header: &str) -> Option<String> {
    let start = cookie_header.find(SESSION_COOKIE)?;
    let mut rest = &cookie_header[start + SESSION_COOKIE.len()..];

    rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '=');

    let bytes = rest.as_bytes();
    let quoted = bytes.first() == Some(&b'"');
    let value_start = if quoted { 1 } else { 0 };

    let mut end = value_start;
    let chars: Vec<char> = rest.chars().collect();
    while end < chars.len() {
        let c = chars[end];
        let escaped = end > 0 && chars[end - 1] == '\\';
        if quoted {
            if c == '"' && !escaped {
                break;
            }
        } else if (c == ',' || c == ';') && !escaped {
            break;
        }
        end += 1;
    }

    if value_start > end {
        return None;
    }

    let value: String = chars[value_start..end].iter().collect();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_prefixed_nonempty_ids() {
        let id = generate();
        assert!(id.starts_with(DOMAIN_SEPARATOR));
        assert!(id.len() > DOMAIN_SEPARATOR.len());
    }

    #[test]
    fn generate_produces_distinct_ids() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
    }

    #[test]
    fn parses_unquoted_value_terminated_by_semicolon() {
        let header = "other=1; -http-session-=abc123; more=2";
        assert_eq!(
            parse_from_cookie_header(header),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn parses_quoted_value() {
        let header = r#"-http-session-="abc;def""#;
        assert_eq!(
            parse_from_cookie_header(header),
            Some("abc;def".to_string())
        );
    }

    #[test]
    fn parses_value_at_end_of_header() {
        let header = "-http-session-=onlyvalue";
        assert_eq!(
            parse_from_cookie_header(header),
            Some("onlyvalue".to_string())
        );
    }

    #[test]
    fn returns_none_when_cookie_absent() {
        assert_eq!(parse_from_cookie_header("other=1; more=2"), None);
    }

    #[test]
    fn escaped_delimiter_does_not_terminate_quoted_value() {
        let header = r#"-http-session-="abc\"def""#;
        assert_eq!(
            parse_from_cookie_header(header),
            Some(r#"abc\"def"#.to_string())
        );
    }
}
