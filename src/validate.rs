use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use url::{Host, Url};

use crate::config::ValidatorConfig;
use crate::error::RejectionReason;

/// A URL that passed every check, with the addresses it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    pub url: Url,
    pub resolved: Vec<IpAddr>,
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[derive(Clone)]
pub struct UrlValidator {
    blocklist: Vec<String>,
    resolve_dns: bool,
    allow_private_networks: bool,
    resolver: Arc<dyn HostResolver>,
}

impl std::fmt::Debug for UrlValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlValidator")
            .field("blocklist", &self.blocklist)
            .field("resolve_dns", &self.resolve_dns)
            .field("allow_private_networks", &self.allow_private_networks)
            .finish_non_exhaustive()
    }
}

impl UrlValidator {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: &ValidatorConfig, resolver: Arc<dyn HostResolver>) -> Self {
        let blocklist = config
            .blocklist
            .iter()
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            blocklist,
            resolve_dns: config.resolve_dns,
            allow_private_networks: config.allow_private_networks,
            resolver,
        }
    }

    pub async fn validate(&self, raw: &str) -> Result<ValidatedUrl, RejectionReason> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RejectionReason::Malformed);
        }
        if has_traversal(raw) {
            return Err(RejectionReason::Traversal);
        }

        let url = Url::parse(raw).map_err(|_| RejectionReason::Malformed)?;
        self.check_literal(&url)?;

        let resolved = match url.host() {
            Some(Host::Domain(domain)) if self.resolve_dns => {
                let port = url.port_or_known_default().unwrap_or(80);
                let addrs = self.resolver.resolve(domain, port).await.map_err(|err| {
                    tracing::debug!(host = domain, %err, "dns resolution failed");
                    RejectionReason::Malformed
                })?;
                if addrs.is_empty() {
                    return Err(RejectionReason::Malformed);
                }
                if !self.allow_private_networks
                    && let Some(bad) = addrs.iter().find(|ip| is_disallowed_ip(ip))
                {
                    tracing::warn!(host = domain, ip = %bad, "host resolves into a private range");
                    return Err(RejectionReason::PrivateNetwork);
                }
                addrs
            }
            Some(Host::Ipv4(v4)) => vec![IpAddr::V4(v4)],
            Some(Host::Ipv6(v6)) => vec![IpAddr::V6(v6)],
            _ => Vec::new(),
        };

        Ok(ValidatedUrl { url, resolved })
    }

    /// Scheme, host, blocklist and IP-literal checks without touching DNS.
    pub fn check_literal(&self, url: &Url) -> Result<(), RejectionReason> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RejectionReason::Malformed);
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(RejectionReason::Malformed);
        }
        if url.path_segments().is_some_and(|mut s| s.any(|seg| seg == "..")) {
            return Err(RejectionReason::Traversal);
        }

        match url.host() {
            None => Err(RejectionReason::Malformed),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if domain.is_empty() {
                    return Err(RejectionReason::Malformed);
                }
                if self.is_blocklisted(&domain) {
                    return Err(RejectionReason::Blocklisted);
                }
                if !self.allow_private_networks
                    && (domain == "localhost" || domain.ends_with(".localhost"))
                {
                    return Err(RejectionReason::PrivateNetwork);
                }
                Ok(())
            }
            Some(Host::Ipv4(v4)) => self.check_ip(IpAddr::V4(v4)),
            Some(Host::Ipv6(v6)) => self.check_ip(IpAddr::V6(v6)),
        }
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), RejectionReason> {
        if self.is_blocklisted(&ip.to_string()) {
            return Err(RejectionReason::Blocklisted);
        }
        if !self.allow_private_networks && is_disallowed_ip(&ip) {
            return Err(RejectionReason::PrivateNetwork);
        }
        Ok(())
    }

    fn is_blocklisted(&self, host: &str) -> bool {
        self.blocklist
            .iter()
            .any(|blocked| host == blocked || host.ends_with(&format!(".{blocked}")))
    }

    /// Resolver for the fetch client. Every connection, including each
    /// redirect hop, is checked against the addresses actually dialed.
    pub fn connect_guard(&self) -> ConnectGuard {
        ConnectGuard {
            resolver: Arc::clone(&self.resolver),
            allow_private_networks: self.allow_private_networks,
        }
    }
}

/// A hostname resolved into a disallowed range at connect time.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{host} resolves to disallowed address {ip} (private_network)")]
pub struct BlockedAddress {
    pub host: String,
    pub ip: IpAddr,
}

/// `reqwest` DNS hook that re-resolves through the validator's
/// [`HostResolver`] and refuses hosts with any disallowed address.
#[derive(Clone)]
pub struct ConnectGuard {
    resolver: Arc<dyn HostResolver>,
    allow_private_networks: bool,
}

impl reqwest::dns::Resolve for ConnectGuard {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let guard = self.clone();
        Box::pin(async move { guard.lookup(name.as_str()).await })
    }
}

impl ConnectGuard {
    async fn lookup(
        &self,
        host: &str,
    ) -> Result<reqwest::dns::Addrs, Box<dyn std::error::Error + Send + Sync>> {
        let addrs = self.resolver.resolve(host, 0).await?;
        if !self.allow_private_networks
            && let Some(ip) = addrs.iter().find(|ip| is_disallowed_ip(ip)).copied()
        {
            tracing::warn!(host, %ip, "refusing connection into a private range");
            return Err(Box::new(BlockedAddress {
                host: host.to_owned(),
                ip,
            }));
        }
        Ok(Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0))))
    }
}

/// Loopback, link-local, RFC1918, CGNAT, unspecified, broadcast, and the IPv6
/// equivalents (including IPv4-mapped addresses).
pub fn is_disallowed_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_disallowed_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_disallowed_v4(&mapped);
            }
            is_disallowed_v6(v6)
        }
    }
}

fn is_disallowed_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || a == 0
        || (a == 100 && (64..128).contains(&b))
}

fn is_disallowed_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

/// Looks for `..` path segments in the raw input. `Url::parse` resolves dot
/// segments away, so this has to run before parsing.
fn has_traversal(raw: &str) -> bool {
    let after_scheme = match raw.find("://") {
        Some(idx) => &raw[idx + 3..],
        None => raw,
    };
    let path_start = after_scheme
        .find(['/', '\\'])
        .unwrap_or(after_scheme.len());
    let rest = &after_scheme[path_start..];
    let path_end = rest.find(['?', '#']).unwrap_or(rest.len());
    let path = rest[..path_end].to_ascii_lowercase().replace("%2e", ".");

    path.split(['/', '\\']).any(|segment| segment == "..")
        || path.contains("%2f..")
        || path.contains("..%2f")
        || path.contains("..%5c")
}
