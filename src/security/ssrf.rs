//! Outbound URL validation.
//!
//! Every URL the gateway is asked to fetch passes through [`SsrfGuard`]
//! before any connection is made. The checks run in order, and the first
//! failure rejects the URL:
//!
//! 1. length cap
//! 2. blocked scheme prefixes (`data:`, `javascript:`, ...)
//! 3. parse, scheme allow-list, no embedded credentials
//! 4. host blocklist and blocked host suffixes
//! 5. blocked ports
//! 6. name resolution: every resolved address must be public
//!
//! The validated addresses are returned with the URL so the caller can pin
//! its connection to them. Redirect targets go through the same checks.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

/// Resolves host names for [`SsrfGuard`].
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Fixed host table, for tests and air-gapped deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.entries.insert(host.to_ascii_lowercase(), addrs);
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {}", host)))
    }
}

/// Lists consulted by [`SsrfGuard`]. Loaded once from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsrfPolicy {
    pub max_url_length: usize,
    /// Prefixes rejected before parsing, compared case-insensitively.
    pub blocked_schemes: Vec<String>,
    pub allowed_schemes: Vec<String>,
    /// Exact host names and literal addresses that are never fetched.
    pub blocked_hosts: Vec<String>,
    pub blocked_host_suffixes: Vec<String>,
    pub blocked_ports: Vec<u16>,
    /// Regexes matched against the textual form of every resolved address.
    pub private_address_patterns: Vec<String>,
    /// File extensions accepted by [`SsrfGuard::validate_image_url`].
    pub image_extensions: Vec<String>,
    pub max_redirects: usize,
    /// Skip the private address checks. Local development only.
    pub allow_private_networks: bool,
}

impl Default for SsrfPolicy {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            max_url_length: 2048,
            blocked_schemes: strings(&["data:", "javascript:", "vbscript:", "file:"]),
            allowed_schemes: strings(&["http", "https"]),
            blocked_hosts: strings(&[
                "localhost",
                "localhost.localdomain",
                "127.0.0.1",
                "0.0.0.0",
                "::1",
                "::",
                "169.254.169.254",
                "fd00:ec2::254",
                "metadata",
                "metadata.google.internal",
                "metadata.azure.com",
                "kubernetes.default",
                "kubernetes.default.svc",
            ]),
            blocked_host_suffixes: strings(&[
                ".localhost",
                ".local",
                ".internal",
                ".localdomain",
                ".corp",
                ".home",
                ".lan",
                ".svc",
                ".cluster.local",
            ]),
            blocked_ports: vec![
                21, 22, 23, 25, 53, 110, 135, 137, 138, 139, 143, 445, 993, 995, 1433, 1521,
                2375, 2376, 2379, 3306, 3389, 5432, 5900, 5984, 6379, 6443, 8500, 9000, 9200,
                9300, 10250, 11211, 27017,
            ],
            private_address_patterns: strings(&[
                r"^127\.",
                r"^10\.",
                r"^172\.(1[6-9]|2[0-9]|3[01])\.",
                r"^192\.168\.",
                r"^169\.254\.",
                r"^0\.",
                r"^100\.(6[4-9]|[7-9][0-9]|1[01][0-9]|12[0-7])\.",
                r"^(22[4-9]|23[0-9])\.",
                r"^(24[0-9]|25[0-5])\.",
                r"^::1?$",
                r"^f[cd][0-9a-f]{2}:",
                r"^fe[89ab][0-9a-f]:",
                r"^ff[0-9a-f]{2}:",
                r"^::ffff:",
            ]),
            image_extensions: strings(&["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"]),
            max_redirects: 5,
            allow_private_networks: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SsrfError {
    #[error("URL is {len} characters long, limit is {max}")]
    UrlTooLong { len: usize, max: usize },

    #[error("URL scheme {0} is not allowed")]
    BlockedScheme(String),

    #[error("URL could not be parsed: {0}")]
    InvalidUrl(String),

    #[error("URL scheme {0} is not supported")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("URL must not contain credentials")]
    EmbeddedCredentials,

    #[error("host {0} is not allowed")]
    BlockedHost(String),

    #[error("host {host} is inside blocked domain {suffix}")]
    BlockedHostSuffix { host: String, suffix: String },

    #[error("port {0} is not allowed")]
    BlockedPort(u16),

    #[error("host {host} could not be resolved: {reason}")]
    ResolutionFailed { host: String, reason: String },

    #[error("host {0} resolved to no addresses")]
    NoAddresses(String),

    #[error("host {host} resolves to non-public address {addr}")]
    PrivateAddress { host: String, addr: IpAddr },

    #[error("URL path {0} does not name an image file")]
    NotAnImage(String),

    #[error("more than {0} redirects")]
    TooManyRedirects(usize),
}

/// A URL that passed every check, with the addresses it was checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    pub url: Url,
    /// Normalized host: lowercase, no trailing dot, IPv6 without brackets.
    pub host: String,
    pub port: u16,
    pub addrs: Vec<IpAddr>,
    /// True when the host is a DNS name rather than an address literal.
    pub is_domain: bool,
}

pub struct SsrfGuard {
    policy: SsrfPolicy,
    private_patterns: Vec<Regex>,
    resolver: Arc<dyn HostResolver>,
}

impl SsrfGuard {
    pub fn new(policy: SsrfPolicy, resolver: Arc<dyn HostResolver>) -> Result<Self, regex::Error> {
        let private_patterns = policy
            .private_address_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let mut policy = policy;
        for list in [
            &mut policy.blocked_schemes,
            &mut policy.allowed_schemes,
            &mut policy.blocked_hosts,
            &mut policy.blocked_host_suffixes,
            &mut policy.image_extensions,
        ] {
            for item in list.iter_mut() {
                *item = item.trim().to_ascii_lowercase();
            }
        }

        Ok(Self {
            policy,
            private_patterns,
            resolver,
        })
    }

    pub fn policy(&self) -> &SsrfPolicy {
        &self.policy
    }

    pub async fn validate(&self, raw: &str) -> Result<ValidatedUrl, SsrfError> {
        let result = self.check(raw).await;
        if let Err(err) = &result {
            tracing::warn!(url = %truncate(raw, 256), reason = %err, "Outbound URL rejected");
            crate::observability::metrics::record_ssrf_rejected();
        }
        result
    }

    /// [`validate`](Self::validate), plus the path must end in an image
    /// file extension.
    pub async fn validate_image_url(&self, raw: &str) -> Result<ValidatedUrl, SsrfError> {
        let validated = self.validate(raw).await?;
        let path = validated.url.path();
        let extension = path
            .rsplit('/')
            .next()
            .and_then(|file| file.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());

        match extension {
            Some(ext) if self.policy.image_extensions.contains(&ext) => Ok(validated),
            _ => {
                tracing::warn!(url = %validated.url, "Image URL rejected, path is not an image");
                crate::observability::metrics::record_ssrf_rejected();
                Err(SsrfError::NotAnImage(path.to_string()))
            }
        }
    }

    /// Validate a `Location` header received while fetching `current`.
    pub async fn validate_redirect(&self, current: &Url, location: &str) -> Result<ValidatedUrl, SsrfError> {
        let next = current
            .join(location)
            .map_err(|err| SsrfError::InvalidUrl(err.to_string()))?;
        self.validate(next.as_str()).await
    }

    async fn check(&self, raw: &str) -> Result<ValidatedUrl, SsrfError> {
        let max = self.policy.max_url_length;
        if raw.len() > max {
            return Err(SsrfError::UrlTooLong { len: raw.len(), max });
        }

        // The URL parser drops tabs and newlines, so "java\tscript:" must be
        // caught after the same stripping.
        let compact: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '\t' | '\n' | '\r'))
            .collect::<String>()
            .to_ascii_lowercase();
        if let Some(prefix) = self
            .policy
            .blocked_schemes
            .iter()
            .find(|prefix| compact.starts_with(prefix.as_str()))
        {
            return Err(SsrfError::BlockedScheme(prefix.clone()));
        }

        let url = Url::parse(raw.trim()).map_err(|err| SsrfError::InvalidUrl(err.to_string()))?;
        if !self.policy.allowed_schemes.iter().any(|s| s == url.scheme()) {
            return Err(SsrfError::UnsupportedScheme(url.scheme().to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(SsrfError::EmbeddedCredentials);
        }

        let (host, literal) = match url.host() {
            None => return Err(SsrfError::MissingHost),
            Some(Host::Domain(domain)) => (domain.trim_end_matches('.').to_ascii_lowercase(), None),
            Some(Host::Ipv4(addr)) => (addr.to_string(), Some(IpAddr::V4(addr))),
            Some(Host::Ipv6(addr)) => (addr.to_string(), Some(IpAddr::V6(addr))),
        };
        if host.is_empty() {
            return Err(SsrfError::MissingHost);
        }

        if self.policy.blocked_hosts.iter().any(|blocked| *blocked == host) {
            return Err(SsrfError::BlockedHost(host));
        }
        if let Some(suffix) = self
            .policy
            .blocked_host_suffixes
            .iter()
            .find(|suffix| host.ends_with(suffix.as_str()))
        {
            return Err(SsrfError::BlockedHostSuffix {
                host,
                suffix: suffix.clone(),
            });
        }

        let port = url.port_or_known_default().ok_or(SsrfError::MissingHost)?;
        if self.policy.blocked_ports.contains(&port) {
            return Err(SsrfError::BlockedPort(port));
        }

        let addrs = match literal {
            Some(addr) => vec![addr],
            None => self
                .resolver
                .resolve(&host, port)
                .await
                .map_err(|err| SsrfError::ResolutionFailed {
                    host: host.clone(),
                    reason: err.to_string(),
                })?,
        };
        if addrs.is_empty() {
            return Err(SsrfError::NoAddresses(host));
        }

        if !self.policy.allow_private_networks {
            if let Some(addr) = addrs.iter().find(|addr| self.is_private_address(**addr)) {
                return Err(SsrfError::PrivateAddress { host, addr: *addr });
            }
        }

        Ok(ValidatedUrl {
            url,
            host,
            port,
            addrs,
            is_domain: literal.is_none(),
        })
    }

    /// True for loopback, private, link-local, reserved and other addresses
    /// that must never be fetched.
    pub fn is_private_address(&self, addr: IpAddr) -> bool {
        let text = addr.to_string();
        if self.private_patterns.iter().any(|re| re.is_match(&text)) {
            return true;
        }
        match addr {
            IpAddr::V4(v4) => is_private_v4(v4),
            IpAddr::V6(v6) => is_private_v6(v6),
        }
    }
}

fn is_private_v4(addr: Ipv4Addr) -> bool {
    let [a, b, c, _] = addr.octets();
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || addr.is_multicast()
        || addr.is_documentation()
        || a == 0
        || a >= 240
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..128).contains(&b))
        // 192.0.0.0/24 protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b == 18 || b == 19))
}

fn is_private_v6(addr: Ipv6Addr) -> bool {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let segments = addr.segments();
    // 64:ff9b::/96 NAT64 embeds an IPv4 address in the low 32 bits.
    if segments[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        let [a, b] = segments[6].to_be_bytes();
        let [c, d] = segments[7].to_be_bytes();
        return is_private_v4(Ipv4Addr::new(a, b, c, d));
    }
    addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (segments[0] & 0xffc0) == 0xfe80
        // fec0::/10 deprecated site local
        || (segments[0] & 0xffc0) == 0xfec0
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
}

fn truncate(raw: &str, max: usize) -> &str {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SsrfGuard {
        let resolver = StaticResolver::new()
            .with_host("cdn.example.com", vec!["93.184.216.34".parse().unwrap()])
            .with_host("rebind.example.com", vec!["10.1.2.3".parse().unwrap()])
            .with_host(
                "mixed.example.com",
                vec!["93.184.216.34".parse().unwrap(), "127.0.0.1".parse().unwrap()],
            )
            .with_host("v6.example.com", vec!["fd12:3456::1".parse().unwrap()]);
        SsrfGuard::new(SsrfPolicy::default(), Arc::new(resolver)).unwrap()
    }

    #[tokio::test]
    async fn test_public_url_accepted_with_addresses() {
        let validated = guard()
            .validate("https://cdn.example.com/images/cat.png")
            .await
            .unwrap();
        assert_eq!(validated.host, "cdn.example.com");
        assert_eq!(validated.port, 443);
        assert_eq!(validated.addrs, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        assert!(validated.is_domain);
    }

    #[tokio::test]
    async fn test_dangerous_schemes_rejected() {
        let guard = guard();
        for url in [
            "javascript:alert(1)",
            "JAVASCRIPT:alert(1)",
            "java\tscript:alert(1)",
            "data:text/html;base64,PHNjcmlwdD4=",
            "file:///etc/passwd",
        ] {
            assert!(
                matches!(guard.validate(url).await, Err(SsrfError::BlockedScheme(_))),
                "{url} should be blocked"
            );
        }
        assert!(matches!(
            guard.validate("ftp://cdn.example.com/a.png").await,
            Err(SsrfError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_and_loopback_hosts_rejected() {
        let guard = guard();
        assert!(matches!(
            guard.validate("http://169.254.169.254/latest/meta-data/").await,
            Err(SsrfError::BlockedHost(_))
        ));
        assert!(matches!(
            guard.validate("http://LOCALHOST./").await,
            Err(SsrfError::BlockedHost(_))
        ));
        assert!(matches!(
            guard.validate("http://[::1]/").await,
            Err(SsrfError::BlockedHost(_))
        ));
        assert!(matches!(
            guard.validate("http://db.internal/").await,
            Err(SsrfError::BlockedHostSuffix { .. })
        ));
    }

    #[tokio::test]
    async fn test_obfuscated_loopback_literals_rejected() {
        let guard = guard();
        // Decimal, hex and short forms all parse to 127.0.0.1.
        for url in ["http://2130706433/", "http://0x7f000001/", "http://127.1/"] {
            assert!(guard.validate(url).await.is_err(), "{url} should be rejected");
        }
        assert!(matches!(
            guard.validate("http://[::ffff:10.0.0.1]/").await,
            Err(SsrfError::PrivateAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolved_private_addresses_rejected() {
        let guard = guard();
        assert!(matches!(
            guard.validate("https://rebind.example.com/").await,
            Err(SsrfError::PrivateAddress { .. })
        ));
        // One bad address is enough.
        assert!(matches!(
            guard.validate("https://mixed.example.com/").await,
            Err(SsrfError::PrivateAddress { .. })
        ));
        assert!(matches!(
            guard.validate("https://v6.example.com/").await,
            Err(SsrfError::PrivateAddress { .. })
        ));
        assert!(matches!(
            guard.validate("https://unknown.example.com/").await,
            Err(SsrfError::ResolutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_ports_credentials_and_length() {
        let guard = guard();
        assert_eq!(
            guard.validate("http://cdn.example.com:6379/").await,
            Err(SsrfError::BlockedPort(6379))
        );
        assert_eq!(
            guard.validate("https://user:pw@cdn.example.com/").await,
            Err(SsrfError::EmbeddedCredentials)
        );
        let long = format!("https://cdn.example.com/{}", "a".repeat(3000));
        assert!(matches!(
            guard.validate(&long).await,
            Err(SsrfError::UrlTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_image_url_requires_image_extension() {
        let guard = guard();
        assert!(guard
            .validate_image_url("https://cdn.example.com/a/photo.JPG?size=large")
            .await
            .is_ok());
        assert!(matches!(
            guard.validate_image_url("https://cdn.example.com/a/page.html").await,
            Err(SsrfError::NotAnImage(_))
        ));
        assert!(matches!(
            guard.validate_image_url("https://cdn.example.com/").await,
            Err(SsrfError::NotAnImage(_))
        ));
    }

    #[tokio::test]
    async fn test_redirect_targets_revalidated() {
        let guard = guard();
        let current = Url::parse("https://cdn.example.com/a/photo.png").unwrap();
        assert!(guard.validate_redirect(&current, "/b/photo.png").await.is_ok());
        assert!(matches!(
            guard
                .validate_redirect(&current, "http://169.254.169.254/latest/")
                .await,
            Err(SsrfError::BlockedHost(_))
        ));
    }

    #[test]
    fn test_symbolic_address_checks() {
        let guard = guard();
        for addr in [
            "100.64.0.1",
            "198.18.0.5",
            "192.0.0.8",
            "255.255.255.255",
            "fe80::1",
            "64:ff9b::a00:1",
            "2001:db8::1",
        ] {
            assert!(guard.is_private_address(addr.parse().unwrap()), "{addr}");
        }
        for addr in ["93.184.216.34", "2606:4700::1111"] {
            assert!(!guard.is_private_address(addr.parse().unwrap()), "{addr}");
        }
    }

    #[test]
    fn test_invalid_pattern_is_a_construction_error() {
        let policy = SsrfPolicy {
            private_address_patterns: vec!["(".into()],
            ..SsrfPolicy::default()
        };
        assert!(SsrfGuard::new(policy, Arc::new(SystemResolver)).is_err());
    }
}
