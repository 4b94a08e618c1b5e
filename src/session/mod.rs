//! Per-client session state, layered on the same TTL blob store the response cache uses.
//!
//! [`id`] generates and parses opaque session identifiers; [`key`] derives the per-variable
//! storage key; this module ties both to the shared store and exposes the allocator
//! (`SessionManager`) and variable API consumed by the proxy context.

pub mod id;
pub mod key;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use pingora_error::{Error, ErrorType::ReadError, Result};
use serde_json::{Map, Value};

use crate::config::SessionLimits;
use crate::proxy::ProxyContext;
use crate::store::{self, TtlStore};

/// Name of the cookie carrying the session id, matching the host system's fixed convention.
pub const SESSION_COOKIE: &str = "-http-session-";

/// Process-wide session allocator, reconfigured at startup from `Config::session`.
static MANAGER: Lazy<ArcSwap<SessionManager>> =
    Lazy::new(|| ArcSwap::new(Arc::new(SessionManager::new(SessionLimits::default()))));

/// Replaces the process-wide session allocator's limits. Call once at startup after loading
/// configuration; live sessions allocated under the previous limits are unaffected.
pub fn init(limits: SessionLimits) {
    MANAGER.store(Arc::new(SessionManager::new(limits)));
}

/// Returns the process-wide session allocator.
pub fn manager() -> Arc<SessionManager> {
    MANAGER.load_full()
}

/// One active browser session.
pub struct Session {
    pub id: String,
    pub lifespan: Duration,
    pub client_ip: String,
    store: std::sync::Arc<dyn TtlStore>,
}

impl Session {
    fn var_key(&self, user_key: &str, without_ip: bool) -> String {
        key::make_key(&self.id, &self.client_ip, user_key, without_ip)
    }
}

/// Allocates and tracks sessions against a global active-session limit.
pub struct SessionManager {
    limits: SessionLimits,
    active_sessions: AtomicI64,
}

impl SessionManager {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            active_sessions: AtomicI64::new(0),
        }
    }

    /// Number of currently live sessions. Exposed for diagnostics/tests.
    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Whether session variable keys under these limits are bound to the client's IP. Callers
    /// reading or writing session variables should pass this through rather than hard-coding
    /// `false`.
    pub fn session_without_ip(&self) -> bool {
        self.limits.session_without_ip
    }

    /// Allocates a session object bound to the shared session store.
    ///
    /// Atomically increments the active-session counter; if doing so would exceed
    /// `session_max`, the increment is rolled back and `SessionLimitExceeded` is returned.
    pub fn alloc_session(
        &self,
        client_ip: &str,
        id: Option<String>,
        lifespan: Duration,
    ) -> Result<Session> {
        let count = self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.limits.session_max {
            self.active_sessions.fetch_sub(1, Ordering::SeqCst);
            return Error::e_explain(
                ReadError,
                format!(
                    "too many sessions {count}/{}",
                    self.limits.session_max
                ),
            );
        }

        let id = id.unwrap_or_else(id::generate);
        Ok(Session {
            id,
            lifespan,
            client_ip: client_ip.to_string(),
            store: store::session_store(),
        })
    }

    /// Destroys `ctx`'s session, if any, returning a `Set-Cookie` value re-issuing the (now
    /// dead) session id with `Max-Age=0`.
    ///
    /// Individual variables are not force-expired; they persist in the store until their own
    /// TTL elapses.
    pub fn destroy_session(&self, ctx: &mut ProxyContext) -> Option<String> {
        let session = ctx.session.take()?;

        let cookie = format!("{}={}; Path=/; Max-Age=0", SESSION_COOKIE, session.id);

        let remaining = self.active_sessions.fetch_sub(1, Ordering::SeqCst) - 1;
        debug_assert!(remaining >= 0, "active_sessions went negative");

        Some(cookie)
    }

    /// Destroys any existing session on `ctx`, then allocates a fresh one.
    pub fn create_session(&self, ctx: &mut ProxyContext, client_ip: &str) -> Result<()> {
        if let Some(cookie) = self.destroy_session(ctx) {
            ctx.session_cookie_to_set = Some(cookie);
        }
        ctx.session_id_probed = true;
        self.get_session(ctx, client_ip, None, true)?;
        Ok(())
    }

    /// Returns `ctx`'s session, allocating one if `create` is true or a valid session cookie is
    /// present on the request (`cookie_header` is the raw `Cookie` header value, read by the
    /// caller since `ProxyContext` does not itself carry request headers). Reopening never
    /// mutates the existing session id.
    pub fn get_session<'a>(
        &self,
        ctx: &'a mut ProxyContext,
        client_ip: &str,
        cookie_header: Option<&str>,
        create: bool,
    ) -> Result<Option<&'a Session>> {
        if ctx.session.is_some() {
            return Ok(ctx.session.as_ref());
        }

        let existing_id = if ctx.session_id_probed {
            None
        } else {
            ctx.session_id_probed = true;
            cookie_header.and_then(id::parse_from_cookie_header)
        };

        if existing_id.is_none() && !create {
            return Ok(None);
        }

        let had_id = existing_id.is_some();
        let lifespan = Duration::from_secs(self.limits.session_timeout_secs);
        let session = self.alloc_session(client_ip, existing_id, lifespan)?;

        if !had_id {
            ctx.session_cookie_to_set =
                Some(format!("{}={}; Path=/", SESSION_COOKIE, session.id));
        }

        ctx.session = Some(session);
        Ok(ctx.session.as_ref())
    }
}

/// Reads a session variable, or `default` if the session does not exist or the key is unset.
pub fn get_session_var(ctx: &ProxyContext, key: &str, default: &str, without_ip: bool) -> String {
    let Some(session) = ctx.session.as_ref() else {
        return default.to_string();
    };

    let store_key = session.var_key(key, without_ip);
    session
        .store
        .read(&store_key)
        .and_then(|(value, _)| String::from_utf8(value.to_vec()).ok())
        .unwrap_or_else(|| default.to_string())
}

/// Writes a session variable, overwriting any existing value. TTL matches the session's own
/// lifespan.
pub fn set_session_var(ctx: &ProxyContext, key: &str, value: &str, without_ip: bool) -> Result<()> {
    let session = ctx
        .session
        .as_ref()
        .ok_or_else(|| Error::new_str("no active session on this request"))?;

    let store_key = session.var_key(key, without_ip);
    session.store.write(
        store_key,
        bytes::Bytes::copy_from_slice(value.as_bytes()),
        std::time::SystemTime::now(),
        session.lifespan,
    );
    Ok(())
}

/// Removes a session variable. Returns `NotFound` if no entry was present.
pub fn remove_session_var(ctx: &ProxyContext, key: &str, without_ip: bool) -> Result<()> {
    let session = ctx
        .session
        .as_ref()
        .ok_or_else(|| Error::new_str("no active session on this request"))?;

    let store_key = session.var_key(key, without_ip);
    if session.store.remove(&store_key) {
        Ok(())
    } else {
        Error::e_explain(ReadError, format!("session variable '{key}' not found"))
    }
}

/// Reads a session variable and, if it looks like a JSON object, deserializes it.
pub fn get_session_obj(ctx: &ProxyContext, key: &str, without_ip: bool) -> Option<Map<String, Value>> {
    let raw = get_session_var(ctx, key, "", without_ip);
    if !raw.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Serializes `obj` to JSON and stores it as a session variable.
pub fn set_session_obj(
    ctx: &ProxyContext,
    key: &str,
    obj: &Map<String, Value>,
    without_ip: bool,
) -> Result<()> {
    let raw = serde_json::to_string(obj)
        .map_err(|e| Error::explain(ReadError, format!("failed to serialize session object: {e}")))?;
    set_session_var(ctx, key, &raw, without_ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: i64) -> SessionLimits {
        SessionLimits {
            session_max: max,
            session_timeout_secs: 1800,
            session_without_ip: false,
        }
    }

    #[test]
    fn alloc_session_assigns_a_fresh_id_when_none_given() {
        let manager = SessionManager::new(limits(10));
        let session = manager
            .alloc_session("127.0.0.1", None, Duration::from_secs(60))
            .unwrap();
        assert!(!session.id.is_empty());
        assert_eq!(manager.active_sessions(), 1);
    }

    #[test]
    fn alloc_session_rejects_once_limit_reached() {
        let manager = SessionManager::new(limits(1));
        let _first = manager
            .alloc_session("127.0.0.1", None, Duration::from_secs(60))
            .unwrap();
        let second = manager.alloc_session("127.0.0.1", None, Duration::from_secs(60));
        assert!(second.is_err());
        assert_eq!(manager.active_sessions(), 1);
    }

    #[test]
    fn destroy_session_decrements_counter_and_reissues_dead_cookie() {
        let manager = SessionManager::new(limits(10));
        let session = manager
            .alloc_session("127.0.0.1", Some("abc".to_string()), Duration::from_secs(60))
            .unwrap();

        let mut ctx = ProxyContext::default();
        ctx.session = Some(session);

        let cookie = manager.destroy_session(&mut ctx).unwrap();
        assert!(cookie.contains("abc"));
        assert!(cookie.contains("Max-Age=0"));
        assert_eq!(manager.active_sessions(), 0);
        assert!(ctx.session.is_none());
    }

    #[test]
    fn get_session_var_falls_back_to_default_without_a_session() {
        let ctx = ProxyContext::default();
        assert_eq!(get_session_var(&ctx, "k", "fallback", false), "fallback");
    }

    #[test]
    fn set_then_get_session_var_round_trips() {
        let manager = SessionManager::new(limits(10));
        let session = manager
            .alloc_session("127.0.0.1", Some("sess1".to_string()), Duration::from_secs(60))
            .unwrap();
        let mut ctx = ProxyContext::default();
        ctx.session = Some(session);

        set_session_var(&ctx, "color", "blue", false).unwrap();
        assert_eq!(get_session_var(&ctx, "color", "", false), "blue");
    }

    #[test]
    fn remove_session_var_reports_not_found() {
        let manager = SessionManager::new(limits(10));
        let session = manager
            .alloc_session("127.0.0.1", Some("sess2".to_string()), Duration::from_secs(60))
            .unwrap();
        let mut ctx = ProxyContext::default();
        ctx.session = Some(session);

        assert!(remove_session_var(&ctx, "missing", false).is_err());
        set_session_var(&ctx, "present", "1", false).unwrap();
        assert!(remove_session_var(&ctx, "present", false).is_ok());
    }

    #[test]
    fn session_obj_round_trips_through_json() {
        let manager = SessionManager::new(limits(10));
        let session = manager
            .alloc_session("127.0.0.1", Some("sess3".to_string()), Duration::from_secs(60))
            .unwrap();
        let mut ctx = ProxyContext::default();
        ctx.session = Some(session);

        let mut obj = Map::new();
        obj.insert("a".to_string(), Value::from(1));
        set_session_obj(&ctx, "prefs", &obj, false).unwrap();

        let read_back = get_session_obj(&ctx, "prefs", false).unwrap();
        assert_eq!(read_back.get("a"), Some(&Value::from(1)));
    }

    #[test]
    fn non_object_value_does_not_parse_as_session_obj() {
        let manager = SessionManager::new(limits(10));
        let session = manager
            .alloc_session("127.0.0.1", Some("sess4".to_string()), Duration::from_secs(60))
            .unwrap();
        let mut ctx = ProxyContext::default();
        ctx.session = Some(session);

        set_session_var(&ctx, "plain", "not-json", false).unwrap();
        assert!(get_session_obj(&ctx, "plain", false).is_none());
    }
}
