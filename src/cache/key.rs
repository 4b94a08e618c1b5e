use pingora_http::RequestHeader;

/// Builds the storage key for a request's response cache entry.
///
/// `"http::response-" + path` when `ignore_params` is set. Otherwise the host's
/// `prefix=<route_name>` parameter is injected into the canonical params the same way
/// [`crate::cache::rule::add_cache`]'s URI normalization injects it into a declared rule's
/// `uris` entry, so a rule registered against a plain `/a` and a real `GET /a` request agree
/// on the same key: `"http::response-" + path + "?prefix=" + route_name`, or `"...?" + query +
/// "&prefix=" + route_name` when the request carries its own query string. Used identically by
/// the matcher's lookup path and the filter's commit path so a given request always resolves to
/// the same key.
pub fn build_key(path: &str, query: Option<&str>, ignore_params: bool, route_name: &str) -> String {
    if ignore_params {
        format!("http::response-{path}")
    } else {
        match query {
            Some(query) if !query.is_empty() => {
                format!("http::response-{path}?{query}&prefix={route_name}")
            }
            _ => format!("http::response-{path}?prefix={route_name}"),
        }
    }
}

/// Extracts the path and query string from a request header.
pub fn path_and_query(req: &RequestHeader) -> (&str, Option<&str>) {
    (req.uri.path(), req.uri.query())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_query_and_injects_prefix_by_default() {
        assert_eq!(
            build_key("/a/b", Some("x=1"), false, "r1"),
            "http::response-/a/b?x=1&prefix=r1"
        );
    }

    #[test]
    fn injects_prefix_alone_when_query_absent() {
        assert_eq!(
            build_key("/a/b", None, false, "r1"),
            "http::response-/a/b?prefix=r1"
        );
    }

    #[test]
    fn ignore_params_drops_query_and_prefix_even_when_present() {
        assert_eq!(
            build_key("/a/b", Some("x=1"), true, "r1"),
            "http::response-/a/b"
        );
    }
}
