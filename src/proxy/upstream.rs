use std::time::Duration;

use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, Result};
use pingora_http::RequestHeader;

use crate::config::{Timeout, Upstream, UpstreamPassHost};

/// Proxy upstream.
///
/// Resolves a route's single backend address into an `HttpPeer`. Load balancing across
/// multiple backends is not part of this subsystem; one route maps to one address.
pub struct ProxyUpstream {
    pub inner: Upstream,
    peer: HttpPeer,
}

impl TryFrom<Upstream> for ProxyUpstream {
    type Error = Box<Error>;

    /// Creates a new `ProxyUpstream` from an `Upstream` configuration.
    fn try_from(value: Upstream) -> Result<Self> {
        let mut peer = HttpPeer::new(value.addr.clone(), value.tls, value.sni.clone());

        if let Some(Timeout {
            connect,
            read,
            send,
        }) = value.timeout
        {
            peer.options.connection_timeout = Some(Duration::from_secs(connect));
            peer.options.read_timeout = Some(Duration::from_secs(read));
            peer.options.write_timeout = Some(Duration::from_secs(send));
        }

        Ok(Self { inner: value, peer })
    }
}

impl ProxyUpstream {
    /// Returns the resolved peer for this upstream.
    pub fn peer(&self) -> Box<HttpPeer> {
        Box::new(self.peer.clone())
    }

    /// Rewrites the upstream host in the request header if needed.
    pub fn upstream_host_rewrite(&self, upstream_request: &mut RequestHeader) {
        if self.inner.pass_host == UpstreamPassHost::REWRITE {
            if let Some(host) = &self.inner.upstream_host {
                upstream_request
                    .insert_header(http::header::HOST, host)
                    .unwrap();
            }
        }
    }

    /// Gets the number of retries from the upstream configuration.
    pub fn get_retries(&self) -> Option<usize> {
        self.inner.retries.map(|r| r as usize)
    }

    /// Gets the retry timeout from the upstream configuration.
    pub fn get_retry_timeout(&self) -> Option<u64> {
        self.inner.retry_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_upstream() -> Upstream {
        Upstream {
            addr: "127.0.0.1:8080".to_string(),
            tls: false,
            sni: String::new(),
            pass_host: UpstreamPassHost::PASS,
            upstream_host: None,
            timeout: None,
            retries: Some(2),
            retry_timeout: Some(5),
        }
    }

    #[test]
    fn builds_peer_from_config() {
        let upstream = ProxyUpstream::try_from(sample_upstream()).unwrap();
        assert_eq!(upstream.get_retries(), Some(2));
        assert_eq!(upstream.get_retry_timeout(), Some(5));
    }

    #[test]
    fn rewrites_host_header_only_when_configured() {
        let mut upstream_cfg = sample_upstream();
        upstream_cfg.pass_host = UpstreamPassHost::REWRITE;
        upstream_cfg.upstream_host = Some("example.internal".to_string());
        let upstream = ProxyUpstream::try_from(upstream_cfg).unwrap();

        let mut req = RequestHeader::build("GET", b"/", None).unwrap();
        upstream.upstream_host_rewrite(&mut req);
        assert_eq!(
            req.headers.get(http::header::HOST).unwrap(),
            "example.internal"
        );
    }
}
