//! Route-scoped HTTP response cache.
//!
//! [`rule`] and [`matcher`] implement the cache control rule list and the match algorithm
//! evaluated against it; [`key`] derives the storage key both the matcher and the filter use;
//! [`plugin`] wires lookup and capture into the request/response pipeline; [`conditional`]
//! evaluates `If-None-Match`/`If-Modified-Since` against a stored entry.

pub mod conditional;
pub mod key;
pub mod matcher;
pub mod plugin;
pub mod rule;

use std::time::SystemTime;

use bytes::Bytes;
use http::header::{ETAG, LAST_MODIFIED};
use http::StatusCode;
use pingora_error::{Error, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

use crate::proxy::route::ProxyRoute;
use crate::store;

use matcher::{match_rule, MatchRequest};
use plugin::truncate_to_second;

/// Explicit application-driven read for routes with a `manual` cache rule: looks up the
/// response for the current request and writes it straight to `session` if present.
///
/// Returns the number of body bytes written, or `0` on a miss.
pub async fn write_cached(route: &ProxyRoute, session: &mut Session) -> Result<usize> {
    let store = store::response_store();
    let req = session.req_header();
    let (path, query) = key::path_and_query(req);
    let match_req = MatchRequest {
        method: req.method.as_str(),
        path,
        query,
        route_name: &route.inner.id,
    };

    let rules = route.caching.load();
    let Some(rule) = match_rule(&rules, &match_req) else {
        return Ok(0);
    };

    let key = key::build_key(path, query, rule.flags.ignore_params, &route.inner.id);
    let Some((value, modified)) = store.read(&key) else {
        return Ok(0);
    };

    let tag = format!("{:x}", md5::compute(key.as_bytes()));
    let len = value.len();

    let mut header = ResponseHeader::build(StatusCode::OK, Some(2))?;
    header.insert_header(ETAG.as_str(), tag)?;
    header.insert_header(LAST_MODIFIED.as_str(), httpdate::fmt_http_date(modified))?;

    session.write_response_header(Box::new(header), false).await?;
    session.write_response_body(Some(value), true).await?;

    Ok(len)
}

/// Explicit application-driven write for routes with a `manual` cache rule: stores `data`
/// under the key the matching rule (selected by method/path/extension/type) would produce.
pub fn update_cache(
    route: &ProxyRoute,
    method: &str,
    path: &str,
    query: Option<&str>,
    data: Bytes,
) -> Result<()> {
    let match_req = MatchRequest {
        method,
        path,
        query,
        route_name: &route.inner.id,
    };

    let rules = route.caching.load();
    let rule = match_rule(&rules, &match_req)
        .ok_or_else(|| Error::new_str("no cache rule matches the given request"))?;

    let key = key::build_key(path, query, rule.flags.ignore_params, &route.inner.id);
    let modified = truncate_to_second(SystemTime::now());

    store::response_store().write(key, data, modified, rule.lifespan);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::rule::{add_cache, CacheFlags};
    use crate::config::Route as RouteConfig;

    fn manual_route() -> ProxyRoute {
        let route = ProxyRoute::from(RouteConfig {
            id: "r1".to_string(),
            parent_id: None,
            uri: Some("/api".to_string()),
            uris: Vec::new(),
            methods: Vec::new(),
            host: None,
            hosts: Vec::new(),
            priority: 0,
            upstream: None,
            timeout: None,
            plugins: Default::default(),
            caching: Vec::new(),
        });
        add_cache(
            &route,
            None,
            None,
            None,
            None,
            std::time::Duration::from_secs(60),
            CacheFlags {
                manual: true,
                ..Default::default()
            },
        );
        route
    }

    #[test]
    fn update_cache_stores_under_the_matching_rules_key() {
        let route = manual_route();
        update_cache(&route, "GET", "/api", None, Bytes::from_static(b"payload")).unwrap();

        let key = key::build_key("/api", None, false, "r1");
        let (value, _) = store::response_store().read(&key).unwrap();
        assert_eq!(value, Bytes::from_static(b"payload"));
    }

    #[test]
    fn update_cache_errors_when_no_rule_matches() {
        let route = ProxyRoute::from(RouteConfig {
            id: "r2".to_string(),
            parent_id: None,
            uri: Some("/nomatch".to_string()),
            uris: Vec::new(),
            methods: Vec::new(),
            host: None,
            hosts: Vec::new(),
            priority: 0,
            upstream: None,
            timeout: None,
            plugins: Default::default(),
            caching: Vec::new(),
        });
        let err = update_cache(&route, "GET", "/nomatch", None, Bytes::from_static(b"x"));
        assert!(err.is_err());
    }
}
