use super::key::build_key;
use super::rule::CacheRule;

/// A tiny built-in extension-to-MIME table, just enough to evaluate a rule's `types` axis.
/// Not a general-purpose MIME registry.
fn mime_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" | "woff2" => "font/woff",
        "pdf" => "application/pdf",
        _ => return None,
    })
}

fn extension_of(path: &str) -> Option<&str> {
    path.rsplit('/').next()?.rsplit_once('.').map(|(_, e)| e)
}

/// Request identity as seen by the matcher: just enough fields to evaluate every rule axis,
/// kept free of any `pingora_proxy::Session` dependency so it can be exercised in tests.
pub struct MatchRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    /// The owning route's id, needed to reproduce the `prefix=<route_name>` convention
    /// `build_key` injects into the canonical key for non-`ignore_params` rules.
    pub route_name: &'a str,
}

/// Returns the first cache rule in `rules` that matches `request`, or `None`.
///
/// Every axis present on a rule must match for the rule to match; an absent axis is a
/// wildcard. URI matching is evaluated against the key the rule would itself produce
/// (honoring that rule's own `ignore_params` flag), so rules with different `ignore_params`
/// settings can coexist for the same route.
pub fn match_rule<'a>(rules: &'a [CacheRule], request: &MatchRequest) -> Option<&'a CacheRule> {
    rules.iter().find(|rule| rule_matches(rule, request))
}

fn rule_matches(rule: &CacheRule, request: &MatchRequest) -> bool {
    if let Some(uris) = &rule.uris {
        let key = build_key(
            request.path,
            request.query,
            rule.flags.ignore_params,
            request.route_name,
        );
        let ukey = key.strip_prefix("http::response-").unwrap_or(&key);
        if !uris.contains(ukey) {
            return false;
        }
    }

    if let Some(methods) = &rule.methods {
        let method = request.method.to_ascii_uppercase();
        if !methods.iter().any(|m| m.to_ascii_uppercase() == method) {
            return false;
        }
    }

    if let Some(extensions) = &rule.extensions {
        match extension_of(request.path) {
            Some(ext) if extensions.contains(ext) => {}
            _ => return false,
        }
    } else if let Some(types) = &rule.types {
        // The extension axis takes precedence; the type axis is only evaluated when the rule
        // has no extensions of its own.
        match extension_of(request.path).and_then(mime_for_extension) {
            Some(mime) if types.contains(mime) => {}
            _ => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::rule::CacheFlags;
    use std::collections::HashSet;
    use std::time::Duration;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn wildcard_rule_matches_everything() {
        let rules = vec![CacheRule::default()];
        let req = MatchRequest {
            method: "GET",
            path: "/any",
            query: None,
            route_name: "r1",
        };
        assert!(match_rule(&rules, &req).is_some());
    }

    #[test]
    fn method_axis_rejects_mismatched_method() {
        let rules = vec![CacheRule {
            methods: Some(set(&["GET"])),
            ..Default::default()
        }];
        let req = MatchRequest {
            method: "POST",
            path: "/a",
            query: None,
            route_name: "r1",
        };
        assert!(match_rule(&rules, &req).is_none());
    }

    #[test]
    fn uri_axis_matches_against_rules_own_ignore_params() {
        let rules = vec![CacheRule {
            uris: Some(set(&["/a/b"])),
            flags: CacheFlags {
                ignore_params: true,
                ..Default::default()
            },
            ..Default::default()
        }];
        let req = MatchRequest {
            method: "GET",
            path: "/a/b",
            query: Some("x=1"),
            route_name: "r1",
        };
        assert!(match_rule(&rules, &req).is_some());
    }

    /// A real request carries no `prefix` param of its own; `build_key` must inject it on the
    /// fly so a rule registered against a plain `/a` (normalized to `/a?prefix=r1`) matches.
    #[test]
    fn uri_axis_matches_a_real_request_via_injected_prefix() {
        let rules = vec![CacheRule {
            uris: Some(set(&["/a?prefix=r1"])),
            ..Default::default()
        }];
        let req = MatchRequest {
            method: "GET",
            path: "/a",
            query: None,
            route_name: "r1",
        };
        assert!(match_rule(&rules, &req).is_some());
    }

    #[test]
    fn extension_axis_takes_precedence_over_type_axis() {
        let rules = vec![CacheRule {
            extensions: Some(set(&["png"])),
            types: Some(set(&["text/html"])),
            ..Default::default()
        }];
        let req = MatchRequest {
            method: "GET",
            path: "/img.png",
            query: None,
            route_name: "r1",
        };
        assert!(match_rule(&rules, &req).is_some());
    }

    #[test]
    fn type_axis_resolves_mime_from_extension() {
        let rules = vec![CacheRule {
            types: Some(set(&["text/html"])),
            ..Default::default()
        }];
        let req = MatchRequest {
            method: "GET",
            path: "/index.html",
            query: None,
            route_name: "r1",
        };
        assert!(match_rule(&rules, &req).is_some());
    }

    #[test]
    fn unresolvable_type_never_matches() {
        let rules = vec![CacheRule {
            types: Some(set(&["text/html"])),
            ..Default::default()
        }];
        let req = MatchRequest {
            method: "GET",
            path: "/no-extension",
            query: None,
            route_name: "r1",
        };
        assert!(match_rule(&rules, &req).is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            CacheRule {
                uris: Some(set(&["/a?prefix=r"])),
                lifespan: Duration::from_secs(10),
                ..Default::default()
            },
            CacheRule::default(),
        ];
        let req = MatchRequest {
            method: "GET",
            path: "/a",
            query: None,
            route_name: "r",
        };
        let matched = match_rule(&rules, &req).unwrap();
        assert_eq!(matched.lifespan, Duration::from_secs(10));
    }
}
