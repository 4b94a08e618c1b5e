use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::StatusCode;
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

use crate::proxy::route::ProxyRoute;
use crate::proxy::{plugin::ProxyPlugin, ProxyContext};
use crate::store::{self, TtlStore};

use super::conditional;
use super::key::build_key;
use super::matcher::{match_rule, MatchRequest};
use super::rule::CacheRule;

/// Truncates a timestamp to one-second resolution, matching the precision `If-Modified-Since`
/// headers carry.
pub fn truncate_to_second(t: SystemTime) -> SystemTime {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Whether a client `Cache-Control` request header asks to skip the transparent lookup.
fn client_requests_revalidation(value: &str) -> bool {
    value.contains("no-cache") || value.contains("max-age=0")
}

fn header_str<'a>(session: &'a Session, name: http::HeaderName) -> Option<&'a str> {
    session.req_header().headers.get(name)?.to_str().ok()
}

/// Plugin stage implementing the route-scoped response cache: a transparent lookup on the way
/// in (`request_filter`), and a capture-and-commit on the way out (`response_body_filter`).
/// Always present in every route's executor; whether it does anything is gated by whether the
/// route has any cache rules at all.
pub struct CachePlugin {
    route: Arc<ProxyRoute>,
    store: Arc<dyn TtlStore>,
}

impl CachePlugin {
    pub fn new(route: Arc<ProxyRoute>) -> Self {
        Self {
            route,
            store: store::response_store(),
        }
    }

    fn match_request(&self, session: &Session) -> Option<Arc<CacheRule>> {
        let rules = self.route.caching.load();
        if rules.is_empty() {
            return None;
        }

        let req = session.req_header();
        let match_req = MatchRequest {
            method: req.method.as_str(),
            path: req.uri.path(),
            query: req.uri.query(),
            route_name: &self.route.inner.id,
        };

        match_rule(&rules, &match_req).cloned().map(Arc::new)
    }

    /// The C3 policy heart: on a rule match, decides whether to serve from the store, let the
    /// normal handler run uncaptured (client/manual rules), or let it run with a capture
    /// buffer installed (transparent miss).
    async fn fetch_cached_response(
        &self,
        session: &mut Session,
        ctx: &mut ProxyContext,
        rule: Arc<CacheRule>,
    ) -> Result<bool> {
        if rule.flags.client {
            ctx.cache_control = Some(rule);
            return Ok(false);
        }

        if rule.flags.manual {
            ctx.cache_control = Some(rule);
            return Ok(false);
        }

        if let Some(cc) = header_str(session, CACHE_CONTROL) {
            if client_requests_revalidation(cc) {
                ctx.cache_control = Some(rule);
                ctx.cache_buffer = Some(Vec::new());
                return Ok(false);
            }
        }

        let req = session.req_header();
        let key = build_key(
            req.uri.path(),
            req.uri.query(),
            rule.flags.ignore_params,
            &self.route.inner.id,
        );

        let Some((value, modified)) = self.store.read(&key) else {
            ctx.cache_control = Some(rule);
            ctx.cache_buffer = Some(Vec::new());
            return Ok(false);
        };

        let tag = format!("{:x}", md5::compute(key.as_bytes()));
        let if_none_match = header_str(session, IF_NONE_MATCH);
        let if_modified_since = header_str(session, IF_MODIFIED_SINCE);
        let outcome = conditional::evaluate(&tag, modified, if_none_match, if_modified_since);

        let status = if outcome.not_modified {
            StatusCode::NOT_MODIFIED
        } else {
            StatusCode::OK
        };

        let mut header = ResponseHeader::build(status, Some(2))?;
        header.insert_header(ETAG.as_str(), tag)?;
        header.insert_header(LAST_MODIFIED.as_str(), httpdate::fmt_http_date(modified))?;

        let body = if outcome.not_modified {
            None
        } else {
            Some(value.clone())
        };

        session
            .write_response_header(Box::new(header), body.is_none())
            .await?;
        if let Some(body) = body {
            session.write_response_body(Some(body), true).await?;
        }

        ctx.cached_content = Some(value);
        Ok(true)
    }

    /// Commits a captured response body to the store.
    fn save_cached_response(&self, session: &Session, ctx: &mut ProxyContext) {
        let Some(rule) = ctx.cache_control.clone() else {
            debug_assert!(false, "commit attempted without a matched cache rule");
            return;
        };
        let Some(buffer) = ctx.cache_buffer.take() else {
            return;
        };

        let req = session.req_header();
        let key = build_key(
            req.uri.path(),
            req.uri.query(),
            rule.flags.ignore_params,
            &self.route.inner.id,
        );
        let modified = truncate_to_second(SystemTime::now());

        self.store
            .write(key, Bytes::from(buffer), modified, rule.lifespan);
    }
}

#[async_trait]
impl ProxyPlugin for CachePlugin {
    fn name(&self) -> &str {
        "cache"
    }

    fn priority(&self) -> i32 {
        // Must run before any plugin that might itself produce an early response. Plugins run
        // in descending priority order, so this needs the highest value, not the lowest.
        i32::MAX
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let Some(rule) = self.match_request(session) else {
            return Ok(false);
        };

        self.fetch_cached_response(session, ctx, rule).await
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        let Some(rule) = &ctx.cache_control else {
            return Ok(());
        };

        if rule.flags.client {
            let existing = upstream_response
                .headers
                .get(CACHE_CONTROL)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            match existing {
                None => {
                    upstream_response.insert_header(
                        CACHE_CONTROL.as_str(),
                        format!("max-age={}", rule.lifespan.as_secs()),
                    )?;
                }
                Some(value) if !value.contains("max-age") => {
                    upstream_response.insert_header(
                        CACHE_CONTROL.as_str(),
                        format!("{value}, max-age={}", rule.lifespan.as_secs()),
                    )?;
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    fn response_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        if ctx.cache_buffer.is_none() {
            return Ok(());
        }

        if let Some(chunk) = body {
            if let Some(buffer) = ctx.cache_buffer.as_mut() {
                buffer.extend_from_slice(chunk);
            }
        }

        if end_of_stream {
            self.save_cached_response(session, ctx);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revalidation_request_is_detected_by_substring() {
        assert!(client_requests_revalidation("no-cache"));
        assert!(client_requests_revalidation("max-age=0"));
        assert!(client_requests_revalidation("private, no-cache"));
        assert!(!client_requests_revalidation("max-age=60"));
    }

    #[test]
    fn truncates_sub_second_precision() {
        let t = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(truncate_to_second(t), UNIX_EPOCH + Duration::from_secs(1));
    }
}
