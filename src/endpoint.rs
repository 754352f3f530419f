//! Backend endpoint URLs.
//!
//! Endpoints have the form:
//!
//! ```text
//! [scheme]://[secret]@[host]:[port]/[vhost]
//! ```
//!
//! for example `wr://d0c3f2@127.0.0.1:8081/chat`. The secret is the vhost
//! access token; it becomes part of every session identity.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use tokio::net::lookup_host;
use url::Url;

use crate::error::{Error, Result};

/// A parsed backend endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    credential: String,
    host: String,
    port: u16,
    vhost: String,
}

impl Endpoint {
    /// Parse an endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEndpoint` if the URL is malformed or misses
    /// the host, port or secret.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| Error::InvalidEndpoint(format!("{}: {}", url, e)))?;

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidEndpoint(format!("{}: missing host", url)))?;
        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let port = parsed
            .port()
            .ok_or_else(|| Error::InvalidEndpoint(format!("{}: missing port", url)))?;

        let credential = parsed.username();
        if credential.is_empty() {
            return Err(Error::InvalidEndpoint(format!("{}: missing secret", url)));
        }

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            credential: credential.to_string(),
            host,
            port,
            vhost: parsed.path().to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The vhost secret token.
    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Virtual host path, including the leading slash (e.g. `/chat`).
    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// Resolve the endpoint host to a socket address.
    ///
    /// The first address returned by the resolver is used.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(Error::Connection)?;

        addrs.next().ok_or_else(|| {
            Error::InvalidEndpoint(format!("{}: host did not resolve", self.host))
        })
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// The secret stays out of logs.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.vhost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let endpoint = Endpoint::parse("wr://secret@127.0.0.1:8081/test").unwrap();
        assert_eq!(endpoint.scheme(), "wr");
        assert_eq!(endpoint.credential(), "secret");
        assert_eq!(endpoint.host(), "127.0.0.1");
        assert_eq!(endpoint.port(), 8081);
        assert_eq!(endpoint.vhost(), "/test");
    }

    #[test]
    fn test_parse_hostname_and_nested_vhost() {
        let endpoint: Endpoint = "wr://abc@broker.local:9000/apps/chat".parse().unwrap();
        assert_eq!(endpoint.host(), "broker.local");
        assert_eq!(endpoint.vhost(), "/apps/chat");
    }

    #[test]
    fn test_parse_ipv6_host() {
        let endpoint = Endpoint::parse("wr://abc@[::1]:8081/test").unwrap();
        assert_eq!(endpoint.host(), "::1");
    }

    #[test]
    fn test_parse_rejects_missing_parts() {
        for url in [
            "not a url",
            "wr://secret@127.0.0.1/test",
            "wr://127.0.0.1:8081/test",
        ] {
            let err = Endpoint::parse(url).unwrap_err();
            assert!(
                matches!(err, Error::InvalidEndpoint(_)),
                "Expected InvalidEndpoint for {}, got {:?}",
                url,
                err
            );
        }
    }

    #[test]
    fn test_debug_hides_secret() {
        let endpoint = Endpoint::parse("wr://topsecret@127.0.0.1:8081/test").unwrap();
        let debug = format!("{:?}", endpoint);
        assert!(!debug.contains("topsecret"));
        assert!(!endpoint.to_string().contains("topsecret"));
        assert_eq!(endpoint.to_string(), "wr://127.0.0.1:8081/test");
    }

    #[tokio::test]
    async fn test_resolve_loopback() {
        let endpoint = Endpoint::parse("wr://secret@127.0.0.1:8081/test").unwrap();
        let addr = endpoint.resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:8081".parse().unwrap());
    }
}
