//! Session variable key derivation.
//!
//! Grounded on `httpSession.c`'s `makeKey`: binds the client IP into the key unless the
//! deployment opts out (`session_without_ip`), trading session-hijacking resistance for
//! tolerance of clients whose IP changes mid-session (NAT, mobile roaming).

/// Derives the storage key for session variable `user_key`.
pub fn make_key(session_id: &str, client_ip: &str, user_key: &str, without_ip: bool) -> String {
    if without_ip {
        format!("session-{session_id}-{user_key}")
    } else {
        format!("session-{session_id}-{client_ip}-{user_key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_client_ip_by_default() {
        assert_eq!(
            make_key("sid", "1.2.3.4", "color", false),
            "session-sid-1.2.3.4-color"
        );
    }

    #[test]
    fn omits_client_ip_when_configured() {
        assert_eq!(make_key("sid", "1.2.3.4", "color", true), "session-sid-color");
    }
}
