use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::debug;
use matchit::{InsertError, Router as MatchRouter};
use once_cell::sync::Lazy;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, Result};
use pingora_proxy::Session;

use crate::{
    cache::rule::CacheRule,
    config,
    utils::request::get_request_host,
};

use super::{plugin::build_plugin, plugin::ProxyPlugin, upstream::ProxyUpstream, Identifiable, MapOperations};

/// Proxy route.
///
/// Manages routing of a matched request to its single upstream address, and owns the route's
/// ordered cache rule list.
pub struct ProxyRoute {
    pub inner: config::Route,
    pub upstream: Option<Arc<ProxyUpstream>>,
    pub plugins: Vec<Arc<dyn ProxyPlugin>>,
    /// Cache rules in match-priority order. Shared by reference with a parent route until
    /// this route's first call to `add_cache`, which copies the list before mutating it.
    pub caching: ArcSwap<Vec<CacheRule>>,
}

impl From<config::Route> for ProxyRoute {
    /// Creates a new `ProxyRoute` instance from a `Route` configuration.
    fn from(value: config::Route) -> Self {
        Self {
            inner: value,
            upstream: None,
            plugins: Vec::new(),
            caching: ArcSwap::new(Arc::new(Vec::new())),
        }
    }
}

impl Identifiable for ProxyRoute {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn set_id(&mut self, id: String) {
        self.inner.id = id;
    }
}

impl ProxyRoute {
    pub fn new_with_upstream_and_plugins(route: config::Route) -> Result<Self> {
        let mut proxy_route = Self::from(route.clone());

        if let Some(upstream_config) = route.upstream {
            let proxy_upstream = ProxyUpstream::try_from(upstream_config)?;
            proxy_route.upstream = Some(Arc::new(proxy_upstream));
        }

        for (name, value) in route.plugins {
            let plugin = build_plugin(&name, value)?;
            proxy_route.plugins.push(plugin);
        }

        Ok(proxy_route)
    }

    /// Gets the upstream for the route.
    pub fn resolve_upstream(&self) -> Option<Arc<ProxyUpstream>> {
        self.upstream.clone()
    }

    fn get_hosts(&self) -> Vec<String> {
        self.inner.get_hosts()
    }

    pub fn select_http_peer<'a>(&'a self, _session: &'a mut Session) -> Result<Box<HttpPeer>> {
        self.resolve_upstream()
            .ok_or_else(|| Error::new_str("Failed to retrieve upstream configuration for route"))
            .map(|upstream| upstream.peer())
    }

    /// Registers a new cache rule on this route. See [`crate::cache::rule::add_cache`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_cache(
        &self,
        methods: Option<&str>,
        uris: Option<&str>,
        extensions: Option<&str>,
        types: Option<&str>,
        lifespan: std::time::Duration,
        flags: crate::cache::rule::CacheFlags,
    ) {
        crate::cache::rule::add_cache(self, methods, uris, extensions, types, lifespan, flags)
    }
}

#[derive(Default)]
pub struct MatchEntry {
    /// Router for non-host URI matching
    non_host_uri: MatchRouter<Vec<Arc<ProxyRoute>>>,
    /// Router for host URI matching
    host_uris: MatchRouter<MatchRouter<Vec<Arc<ProxyRoute>>>>,
}

impl MatchEntry {
    fn insert_into_router(
        router: &mut MatchRouter<Vec<Arc<ProxyRoute>>>,
        uri: &str,
        proxy_route: Arc<ProxyRoute>,
    ) -> Result<(), InsertError> {
        match router.at_mut(uri) {
            Ok(routes) => {
                routes.value.push(proxy_route);
                routes
                    .value
                    .sort_by(|a, b| b.inner.priority.cmp(&a.inner.priority));
            }
            Err(_) => {
                router.insert(uri, vec![proxy_route])?;
            }
        }
        Ok(())
    }

    /// Inserts a route into the match entry.
    pub fn insert_route(&mut self, proxy_route: Arc<ProxyRoute>) -> Result<(), InsertError> {
        let hosts = proxy_route.get_hosts();
        let uris = proxy_route.inner.get_uris();

        if hosts.is_empty() {
            for uri in &uris {
                Self::insert_into_router(&mut self.non_host_uri, uri, proxy_route.clone())?;
            }
        } else {
            for host in hosts.iter() {
                let reversed_host = host.chars().rev().collect::<String>();
                let inner_router = self.host_uris.at_mut(reversed_host.as_str());

                let inner_router = match inner_router {
                    Ok(router) => router.value,
                    Err(_) => {
                        let new_router = MatchRouter::new();
                        self.host_uris.insert(reversed_host.clone(), new_router)?;
                        self.host_uris.at_mut(reversed_host.as_str()).unwrap().value
                    }
                };

                for uri in &uris {
                    Self::insert_into_router(inner_router, uri, proxy_route.clone())?;
                }
            }
        }

        Ok(())
    }

    /// Matches a request to a route.
    pub fn match_request(
        &self,
        session: &mut Session,
    ) -> Option<(BTreeMap<String, String>, Arc<ProxyRoute>)> {
        let host = get_request_host(session.req_header());
        let uri = session.req_header().uri.path();
        let method = session.req_header().method.as_str();

        debug!(
            "match request: host={:?}, uri={:?}, method={:?}",
            host, uri, method
        );

        if let Some(reversed_host) = host
            .filter(|h| !h.is_empty())
            .map(|h| h.chars().rev().collect::<String>())
        {
            if let Ok(v) = self.host_uris.at(&reversed_host) {
                if let Some(result) = Self::match_uri_method(v.value, uri, method) {
                    return Some(result);
                }
            }
        }

        Self::match_uri_method(&self.non_host_uri, uri, method)
    }

    fn match_uri_method(
        match_router: &MatchRouter<Vec<Arc<ProxyRoute>>>,
        uri: &str,
        method: &str,
    ) -> Option<(BTreeMap<String, String>, Arc<ProxyRoute>)> {
        if let Ok(v) = match_router.at(uri) {
            let params: BTreeMap<String, String> = v
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();

            for route in v.value.iter() {
                if route.inner.methods.is_empty() {
                    return Some((params, route.clone()));
                }

                if route.inner.methods.iter().any(|m| m.to_string() == method) {
                    return Some((params, route.clone()));
                }
            }
        }
        None
    }
}

/// Global map of every configured route, keyed by route id.
pub static ROUTE_MAP: Lazy<DashMap<String, Arc<ProxyRoute>>> = Lazy::new(DashMap::new);
static GLOBAL_MATCH: Lazy<ArcSwap<MatchEntry>> =
    Lazy::new(|| ArcSwap::new(Arc::new(MatchEntry::default())));

pub fn global_match_fetch() -> Arc<MatchEntry> {
    GLOBAL_MATCH.load().clone()
}

pub fn reload_global_match() {
    let mut matcher = MatchEntry::default();

    for route in ROUTE_MAP.iter() {
        debug!("Inserting route: {}", route.inner.id);
        matcher.insert_route(route.clone()).unwrap();
    }

    GLOBAL_MATCH.store(Arc::new(matcher));
}

/// Loads routes from the given configuration, wiring up parent cache-rule inheritance.
pub fn load_static_routes(config: &config::Config) -> Result<()> {
    let proxy_routes: Vec<Arc<ProxyRoute>> = config
        .routes
        .iter()
        .map(|route| {
            log::info!("Configuring Route: {}", route.id);
            match ProxyRoute::new_with_upstream_and_plugins(route.clone()) {
                Ok(proxy_route) => Ok(Arc::new(proxy_route)),
                Err(e) => {
                    log::error!("Failed to configure Route {}: {}", route.id, e);
                    Err(e)
                }
            }
        })
        .collect::<Result<Vec<_>>>()?;

    crate::cache::rule::install_route_rules(&proxy_routes, &config.routes)?;

    ROUTE_MAP.reload_resources(proxy_routes);

    reload_global_match();

    Ok(())
}

/// Fetches a route by its ID.
pub fn route_fetch(id: &str) -> Option<Arc<ProxyRoute>> {
    match ROUTE_MAP.get(id) {
        Some(rule) => Some(rule.value().clone()),
        None => {
            log::warn!("Route with id '{}' not found", id);
            None
        }
    }
}
