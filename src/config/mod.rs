use std::{
    collections::{HashMap, HashSet},
    fs,
    net::SocketAddr,
};

use http::Method;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use validator::{Validate, ValidationError};

/// Enables uniform ID handling across configuration entities for validation.
pub trait Identifiable {
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
}

macro_rules! impl_identifiable {
    ($type:ty) => {
        impl Identifiable for $type {
            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }
        }
    };
}

impl_identifiable!(Route);

/// Root configuration structure combining Pingora framework config with embercache's own settings.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_resource_id"))]
pub struct Config {
    /// Pingora framework configuration (workers, logging, etc.)
    #[serde(default)]
    pub pingora: ServerConf,

    /// Server-specific configuration (listeners, logging).
    #[validate(nested)]
    pub server: ServerSettings,

    #[validate(nested)]
    #[serde(default)]
    pub routes: Vec<Route>,

    /// Global session allocator limits, shared by every route's session store.
    #[serde(default)]
    pub session: SessionLimits,
}

impl Config {
    /// Loads configuration from a YAML file with comprehensive validation.
    ///
    /// Synchronous loading is intentional - configuration should be validated
    /// at startup before any async operations begin.
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        log::debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    /// Main configuration loading entry point that combines file config with CLI overrides.
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    /// Parses a YAML configuration string with comprehensive validation.
    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        log::trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        log::trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file validation failed")?;

        Self::validate_unique_ids(&conf.routes, "route")
            .or_err_with(FileReadError, || "Route ID validation failed")?;

        Ok(conf)
    }

    /// Serializes configuration back to YAML format for debugging or export.
    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to serialize config to YAML: {e}");
            String::new()
        })
    }

    /// Applies CLI option overrides to loaded configuration.
    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_resource_id(&self) -> Result<(), ValidationError> {
        if self.routes.iter().any(|route| route.id.is_empty()) {
            return Err(ValidationError::new("route_id_required"));
        }
        Ok(())
    }

    fn validate_unique_ids<T: Identifiable>(items: &[T], resource_name: &str) -> Result<()> {
        let mut ids = HashSet::new();
        for item in items {
            if !ids.insert(item.id().to_string()) {
                return Error::e_explain(
                    FileReadError,
                    format!("Duplicate {} ID found: {}", resource_name, item.id()),
                );
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
pub struct ServerSettings {
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    pub log: Option<Log>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
    #[serde(default)]
    pub offer_h2c: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(length(min = 1), custom(function = "Log::validate_path"))]
    pub path: String,
}

impl Log {
    fn validate_path(path: &str) -> Result<(), ValidationError> {
        if path.contains('\0') || path.trim().is_empty() {
            return Err(ValidationError::new("Invalid log file path"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Timeout {
    pub connect: u64,
    pub send: u64,
    pub read: u64,
}

/// A route: a URI/host match, the single upstream it proxies to, and the ordered list of
/// cache rules installed on it via the cache configuration API.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Route::validate"))]
pub struct Route {
    #[serde(default)]
    pub id: String,

    /// Another route's id this route inherits its cache rule list from, until it registers
    /// its own (copy-on-write).
    pub parent_id: Option<String>,

    pub uri: Option<String>,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub methods: Vec<Method>,
    pub host: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "Route::default_priority")]
    pub priority: u32,

    #[validate(nested)]
    pub upstream: Option<Upstream>,
    #[validate(nested)]
    pub timeout: Option<Timeout>,

    /// Optional plugins (beyond the always-present cache stage) to run on this route.
    #[serde(default)]
    pub plugins: HashMap<String, serde_yaml::Value>,

    /// Cache rules to register on this route at startup, in priority order.
    #[serde(default)]
    pub caching: Vec<CacheRuleSpec>,
}

impl Route {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.uri.is_none() && self.uris.is_empty() {
            return Err(ValidationError::new("uri_or_uris_required"));
        }

        if self.upstream.is_none() {
            return Err(ValidationError::new("upstream_required"));
        }

        Ok(())
    }

    pub fn get_hosts(&self) -> Vec<String> {
        self.host
            .clone()
            .map_or_else(|| self.hosts.clone(), |host| vec![host.to_string()])
    }

    pub fn get_uris(&self) -> Vec<String> {
        self.uri
            .clone()
            .map_or_else(|| self.uris.clone(), |uri| vec![uri.to_string()])
    }

    fn default_priority() -> u32 {
        0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Upstream {
    /// `host:port` of the single backend this route proxies to.
    pub addr: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub sni: String,
    pub retries: Option<u32>,
    pub retry_timeout: Option<u64>,
    #[validate(nested)]
    pub timeout: Option<Timeout>,
    #[serde(default)]
    pub pass_host: UpstreamPassHost,
    pub upstream_host: Option<String>,
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamPassHost {
    #[default]
    PASS,
    REWRITE,
}

/// YAML-facing description of one cache rule, consumed by the cache configuration API to
/// build a `CacheRule` on the owning route.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRuleSpec {
    #[serde(default)]
    pub methods: Option<String>,
    #[serde(default)]
    pub uris: Option<String>,
    #[serde(default)]
    pub extensions: Option<String>,
    #[serde(default)]
    pub types: Option<String>,
    pub lifespan_secs: u64,
    #[serde(default)]
    pub client: bool,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub ignore_params: bool,
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub unique: bool,
}

/// Global session allocator limits, shared by every route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLimits {
    #[serde(default = "SessionLimits::default_session_max")]
    pub session_max: i64,
    #[serde(default = "SessionLimits::default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// When true, session keys are not bound to the client's IP address.
    #[serde(default)]
    pub session_without_ip: bool,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            session_max: Self::default_session_max(),
            session_timeout_secs: Self::default_session_timeout_secs(),
            session_without_ip: false,
        }
    }
}

impl SessionLimits {
    fn default_session_max() -> i64 {
        10_000
    }

    fn default_session_timeout_secs() -> u64 {
        1800
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn prints_default_yaml() {
        init_log();
        let conf = Config::default();
        println!("{}", conf.to_yaml());
    }

    #[test]
    fn loads_minimal_config() {
        init_log();
        let conf_str = r#"
server:
  listeners:
    - address: 0.0.0.0:8080

routes:
  - id: "1"
    uri: /
    methods: [GET, POST]
    upstream:
      addr: "127.0.0.1:1980"
    caching:
      - uris: "/api/data"
        lifespan_secs: 60

session:
  session_max: 500
  session_timeout_secs: 900
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(1, conf.server.listeners.len());
        assert_eq!(1, conf.routes.len());
        assert_eq!(vec![Method::GET, Method::POST], conf.routes[0].methods);
        assert_eq!(1, conf.routes[0].caching.len());
        assert_eq!(500, conf.session.session_max);
    }

    #[test]
    fn rejects_duplicate_route_ids() {
        init_log();
        let conf_str = r#"
server:
  listeners:
    - address: 0.0.0.0:8080

routes:
  - id: "1"
    uri: /a
    upstream:
      addr: "127.0.0.1:1980"
  - id: "1"
    uri: /b
    upstream:
      addr: "127.0.0.1:1980"
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn rejects_route_without_upstream() {
        init_log();
        let conf_str = r#"
server:
  listeners:
    - address: 0.0.0.0:8080

routes:
  - id: "1"
    uri: /a
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }
}
