use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::cache::rule::CacheRule;
use crate::session::Session as SessionState;

use super::plugin::{ProxyPlugin, ProxyPluginExecutor};
use super::route::ProxyRoute;

/// Per-request state threaded through every pipeline phase.
///
/// Holds the matched route and its plugin executor (set by `early_request_filter`), plus the
/// response-cache and session-state scratch fields the cache and session subsystems populate
/// as the request moves through the pipeline.
pub struct ProxyContext {
    pub router: Option<Arc<ProxyRoute>>,
    pub router_params: BTreeMap<String, String>,
    pub plugin: Arc<dyn ProxyPlugin>,
    pub vars: HashMap<String, String>,
    pub tries: usize,
    pub request_start: Instant,

    /// The cache rule matched for this request, if any.
    pub cache_control: Option<Arc<CacheRule>>,
    /// Buffer capturing the outgoing response body, installed on a cache miss.
    pub cache_buffer: Option<Vec<u8>>,
    /// Body bytes read back from the store on a cache hit.
    pub cached_content: Option<Bytes>,

    /// The session allocated or reopened for this request, if any.
    pub session: Option<SessionState>,
    /// A `Set-Cookie` value to attach to the response because a session was newly created.
    pub session_cookie_to_set: Option<String>,
    /// Whether the session id has already been read out of the request's `Cookie` header.
    pub session_id_probed: bool,
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self {
            router: None,
            router_params: BTreeMap::new(),
            plugin: Arc::new(ProxyPluginExecutor::default()),
            vars: HashMap::new(),
            tries: 0,
            request_start: Instant::now(),
            cache_control: None,
            cache_buffer: None,
            cached_content: None,
            session: None,
            session_cookie_to_set: None,
            session_id_probed: false,
        }
    }
}
