use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pingora_error::{Error, ErrorType::ReadError, Result};

use crate::config::{self, CacheRuleSpec};
use crate::proxy::route::ProxyRoute;

/// Flags controlling how a cache rule is enforced. All are accepted and stored; `unique` is
/// reserved for future use and is not interpreted anywhere in the matcher or key builder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheFlags {
    /// Emit a client-facing `Cache-Control` header instead of performing server-side lookup.
    pub client: bool,
    /// Skip transparent server-side caching; the application writes and reads the cache
    /// explicitly via `write_cached` / `update_cache`.
    pub manual: bool,
    /// Exclude the query string from the cache key.
    pub ignore_params: bool,
    /// Discard any inherited rules before registering this one.
    pub reset: bool,
    /// Reserved.
    pub unique: bool,
}

/// One entry in a route's ordered cache rule list. Immutable after registration.
#[derive(Clone, Debug, Default)]
pub struct CacheRule {
    pub methods: Option<HashSet<String>>,
    pub uris: Option<HashSet<String>>,
    pub extensions: Option<HashSet<String>>,
    pub types: Option<HashSet<String>>,
    pub lifespan: Duration,
    pub flags: CacheFlags,
}

fn tokenize(input: &str) -> HashSet<String> {
    input
        .split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalizes one URI entry per the route's `ignore_params`/prefix conventions, returning the
/// string to store in the rule's `uris` set.
fn normalize_uri(uri: &str, route_name: &str, ignore_params: bool) -> String {
    if ignore_params {
        if let Some((path, _)) = uri.split_once('?') {
            log::warn!(
                "cache rule uri '{}' has query params but ignore_params is set; truncating",
                uri
            );
            return path.to_string();
        }
        return uri.to_string();
    }

    if uri.contains('?') {
        return uri.to_string();
    }

    format!("{uri}?prefix={route_name}")
}

/// Registers a new cache rule on `route`, implementing the copy-on-write semantics described
/// for the cache configuration API: if `route.caching` is still referentially shared with a
/// parent's list, it is cloned before this rule is appended.
#[allow(clippy::too_many_arguments)]
pub fn add_cache(
    route: &ProxyRoute,
    methods: Option<&str>,
    uris: Option<&str>,
    extensions: Option<&str>,
    types: Option<&str>,
    lifespan: Duration,
    flags: CacheFlags,
) {
    let current = route.caching.load();

    let mut rules: Vec<CacheRule> = if flags.reset {
        Vec::new()
    } else {
        (**current).clone()
    };

    let methods = methods.map(tokenize).and_then(|set| {
        if set.contains("*") {
            None
        } else {
            Some(set)
        }
    });

    let uris = uris.map(|raw| {
        tokenize(raw)
            .into_iter()
            .map(|u| normalize_uri(&u, &route.inner.id, flags.ignore_params))
            .collect::<HashSet<_>>()
    });

    let extensions = extensions.map(tokenize);
    let types = types.map(tokenize);

    rules.push(CacheRule {
        methods,
        uris,
        extensions,
        types,
        lifespan,
        flags,
    });

    route.caching.store(Arc::new(rules));
}

fn spec_flags(spec: &CacheRuleSpec) -> CacheFlags {
    CacheFlags {
        client: spec.client,
        manual: spec.manual,
        ignore_params: spec.ignore_params,
        reset: spec.reset,
        unique: spec.unique,
    }
}

/// Installs every route's configured cache rules, honoring `parent_id` copy-on-write
/// inheritance: a child route's list starts out sharing its parent's `Arc` and only
/// diverges once the child registers a rule of its own.
pub fn install_route_rules(
    proxy_routes: &[Arc<ProxyRoute>],
    route_specs: &[config::Route],
) -> Result<()> {
    let mut settled: HashSet<String> = HashSet::new();
    let mut remaining: Vec<&config::Route> = route_specs.iter().collect();

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut next_remaining = Vec::new();

        for spec in remaining {
            let ready = match &spec.parent_id {
                None => true,
                Some(parent_id) => settled.contains(parent_id),
            };

            if !ready {
                next_remaining.push(spec);
                continue;
            }

            let route = proxy_routes
                .iter()
                .find(|r| r.inner.id == spec.id)
                .expect("route spec without a matching ProxyRoute");

            if let Some(parent_id) = &spec.parent_id {
                let parent = proxy_routes
                    .iter()
                    .find(|r| r.inner.id == *parent_id)
                    .ok_or_else(|| Error::new_str("unknown parent_id referenced by route"))?;
                route.caching.store(parent.caching.load_full());
            }

            for rule_spec in &spec.caching {
                add_cache(
                    route,
                    rule_spec.methods.as_deref(),
                    rule_spec.uris.as_deref(),
                    rule_spec.extensions.as_deref(),
                    rule_spec.types.as_deref(),
                    Duration::from_secs(rule_spec.lifespan_secs),
                    spec_flags(rule_spec),
                );
            }

            settled.insert(spec.id.clone());
        }

        if next_remaining.len() == before {
            return Error::e_explain(ReadError, "cycle or unresolved parent_id in route config");
        }
        remaining = next_remaining;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Route as RouteConfig;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn route_with_id(id: &str) -> ProxyRoute {
        ProxyRoute::from(RouteConfig {
            id: id.to_string(),
            parent_id: None,
            uri: Some("/".to_string()),
            uris: Vec::new(),
            methods: Vec::new(),
            host: None,
            hosts: Vec::new(),
            priority: 0,
            upstream: None,
            timeout: None,
            plugins: Default::default(),
            caching: Vec::new(),
        })
    }

    #[test]
    fn normalizes_uri_with_auto_prefix() {
        init_log();
        assert_eq!(normalize_uri("/a/b", "r1", false), "/a/b?prefix=r1");
        assert_eq!(normalize_uri("/a/b?x=1", "r1", false), "/a/b?x=1");
    }

    #[test]
    fn ignore_params_truncates_query_string() {
        init_log();
        assert_eq!(normalize_uri("/a/b?x=1", "r1", true), "/a/b");
    }

    #[test]
    fn wildcard_method_drops_the_axis() {
        init_log();
        let route = route_with_id("r1");
        add_cache(
            &route,
            Some("*"),
            None,
            None,
            None,
            Duration::from_secs(60),
            CacheFlags::default(),
        );
        let rules = route.caching.load();
        assert!(rules[0].methods.is_none());
    }

    #[test]
    fn reset_flag_discards_inherited_rules() {
        init_log();
        let route = route_with_id("r1");
        add_cache(
            &route,
            None,
            Some("/a"),
            None,
            None,
            Duration::from_secs(60),
            CacheFlags::default(),
        );
        assert_eq!(route.caching.load().len(), 1);

        add_cache(
            &route,
            None,
            Some("/b"),
            None,
            None,
            Duration::from_secs(60),
            CacheFlags {
                reset: true,
                ..Default::default()
            },
        );
        assert_eq!(route.caching.load().len(), 1);
    }

    #[test]
    fn child_shares_then_diverges_from_parent() {
        init_log();
        let parent = Arc::new(route_with_id("parent"));
        add_cache(
            &parent,
            None,
            Some("/shared"),
            None,
            None,
            Duration::from_secs(60),
            CacheFlags::default(),
        );

        let child = Arc::new(route_with_id("child"));
        child.caching.store(parent.caching.load_full());
        assert!(Arc::ptr_eq(&parent.caching.load_full(), &child.caching.load_full()));

        add_cache(
            &child,
            None,
            Some("/own"),
            None,
            None,
            Duration::from_secs(30),
            CacheFlags::default(),
        );

        assert!(!Arc::ptr_eq(&parent.caching.load_full(), &child.caching.load_full()));
        assert_eq!(parent.caching.load().len(), 1);
        assert_eq!(child.caching.load().len(), 2);
    }
}
