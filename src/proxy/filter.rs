//! Destination filtering for the egress proxy.

use super::error::ProxyError;

/// A single host pattern: a host literal or a `*.` wildcard prefix,
/// optionally qualified with `:port`.
///
/// `*.example.com` matches `api.example.com` and `a.b.example.com` but not
/// `example.com` itself, and the suffix match is label-bounded, so
/// `evilexample.com` never matches. A port qualifier requires an exact port
/// match; its absence matches any port. Host matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    host: String,
    wildcard: bool,
    port: Option<u16>,
}

impl HostPattern {
    /// Parse a pattern string such as `github.com`, `*.npmjs.org`, or
    /// `example.com:443`.
    pub fn parse(pattern: &str) -> Result<Self, ProxyError> {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return Err(ProxyError::InvalidPattern("empty pattern".to_string()));
        }

        let (host_part, port) = match pattern.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    ProxyError::InvalidPattern(format!("invalid port in pattern '{pattern}'"))
                })?;
                (host.to_string(), Some(port))
            }
            None => (pattern.clone(), None),
        };

        let (host, wildcard) = match host_part.strip_prefix("*.") {
            Some(rest) => (rest.to_string(), true),
            None => (host_part, false),
        };

        if host.is_empty() {
            return Err(ProxyError::InvalidPattern(format!(
                "pattern '{pattern}' has no host"
            )));
        }

        Ok(Self {
            host,
            wildcard,
            port,
        })
    }

    /// Whether this pattern matches a destination.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        if let Some(want) = self.port {
            if want != port {
                return false;
            }
        }

        let host = host.to_lowercase();
        if self.wildcard {
            // Label-boundary suffix: the candidate must end with ".host"
            // and the apex itself does not match.
            host.len() > self.host.len() + 1
                && host.ends_with(&self.host)
                && host.as_bytes()[host.len() - self.host.len() - 1] == b'.'
        } else {
            host == self.host
        }
    }
}

/// Allowed and denied network destinations for proxy filtering.
///
/// Deny rules take precedence over allow rules. With an empty allow list,
/// every destination not explicitly denied is allowed; with a non-empty
/// allow list, only matching destinations are.
#[derive(Debug, Clone, Default)]
pub struct NetworkFilter {
    allow: Vec<HostPattern>,
    deny: Vec<HostPattern>,
}

impl NetworkFilter {
    /// Build a filter from allow and deny pattern strings. Invalid patterns
    /// are rejected here, never at match time.
    pub fn new(allow_hosts: &[&str], deny_hosts: &[&str]) -> Result<Self, ProxyError> {
        let allow = allow_hosts
            .iter()
            .map(|p| HostPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        let deny = deny_hosts
            .iter()
            .map(|p| HostPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allow, deny })
    }

    /// A filter that allows every destination.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Decide whether a connection to `host:port` may be forwarded.
    pub fn is_allowed(&self, host: &str, port: u16) -> bool {
        if self.deny.iter().any(|p| p.matches(host, port)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|p| p.matches(host, port))
    }
}
