//! DNS helpers behind TTL caches.
//!
//! Lookups go through one shared hickory resolver. Results (including
//! negative ones) are cached so a lazy DNS system or a wrong name cannot
//! stall the filter hot path repeatedly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ip::addr::IpAddress;
use crate::ip::cache::TtlCache;
use crate::ip::set::{FileIpSet, IpAddrSet};

/// Timeout for a single DNS query.
const DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// How a filter may use DNS when a line carries a name instead of an IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseDns {
    /// Resolve names silently.
    Yes,
    /// Resolve names but log a warning each time.
    #[default]
    Warn,
    /// Never resolve; names are dropped.
    No,
    /// Never resolve; names are kept as raw identifiers.
    Raw,
}

impl UseDns {
    /// Parse the protocol token.
    pub fn parse(token: &str) -> Result<UseDns> {
        match token.to_ascii_lowercase().as_str() {
            "yes" => Ok(UseDns::Yes),
            "warn" => Ok(UseDns::Warn),
            "no" => Ok(UseDns::No),
            "raw" => Ok(UseDns::Raw),
            other => Err(Error::InvalidArgument(format!(
                "invalid usedns value {:?}",
                other
            ))),
        }
    }

    /// The protocol name.
    pub fn name(&self) -> &'static str {
        match self {
            UseDns::Yes => "yes",
            UseDns::Warn => "warn",
            UseDns::No => "no",
            UseDns::Raw => "raw",
        }
    }
}

/// Shared resolver with name/address/file caches and the IPv6 tri-state.
pub struct DnsResolver {
    resolver: TokioResolver,
    name_to_ip: TtlCache<String, Vec<IpAddress>>,
    ip_to_name: TtlCache<String, Option<String>>,
    file_to_ip: TtlCache<String, Arc<FileIpSet>>,
    /// Operator override: `Some(bool)` for on/off, `None` for auto.
    allow_ipv6: RwLock<Option<bool>>,
    /// Cached auto-detection outcome.
    detected_ipv6: RwLock<Option<bool>>,
}

impl DnsResolver {
    /// Create a resolver from system configuration, falling back to defaults.
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_tokio()
            .map(|b| b.build())
            .unwrap_or_else(|_| {
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            });

        DnsResolver {
            resolver,
            name_to_ip: TtlCache::new(1_000, 300.0),
            ip_to_name: TtlCache::new(1_000, 300.0),
            file_to_ip: TtlCache::new(100, 300.0),
            allow_ipv6: RwLock::new(None),
            detected_ipv6: RwLock::new(None),
        }
    }

    /// Set the IPv6 tri-state: `Some(true)`/`Some(false)` or `None` for auto.
    pub fn set_ipv6_allowed(&self, value: Option<bool>) {
        *self.allow_ipv6.write() = value;
        debug!(
            ipv6 = match value {
                Some(true) => "on",
                Some(false) => "off",
                None => "auto",
            },
            "IPv6 allowance updated"
        );
    }

    /// The configured tri-state (not the detected outcome).
    pub fn ipv6_setting(&self) -> Option<bool> {
        *self.allow_ipv6.read()
    }

    /// Whether IPv6 lookups are allowed: operator override, else detection.
    pub fn ipv6_allowed(&self) -> bool {
        if let Some(explicit) = *self.allow_ipv6.read() {
            return explicit;
        }
        if let Some(detected) = *self.detected_ipv6.read() {
            return detected;
        }
        let detected = Self::probe_ipv6();
        *self.detected_ipv6.write() = Some(detected);
        detected
    }

    /// OS capability probe: sysctl first, then a throwaway IPv6 bind.
    fn probe_ipv6() -> bool {
        if let Ok(text) = std::fs::read_to_string("/proc/sys/net/ipv6/conf/all/disable_ipv6") {
            if let Ok(disabled) = text.trim().parse::<u8>() {
                return disabled == 0;
            }
        }
        std::net::TcpListener::bind(("::", 0)).is_ok()
    }

    /// Resolve a name to its set of valid addresses.
    ///
    /// IPv4 always; IPv6 only when allowed. Failures resolve to an empty
    /// set, which is cached like any other result.
    pub async fn dns_to_ip(&self, name: &str) -> Vec<IpAddress> {
        if let Some(cached) = self.name_to_ip.get(&name.to_string()) {
            return cached;
        }
        let allow_v6 = self.ipv6_allowed();
        let mut ips: Vec<IpAddress> = Vec::new();
        match tokio::time::timeout(DNS_TIMEOUT, self.resolver.lookup_ip(name)).await {
            Ok(Ok(response)) => {
                for addr in response.iter() {
                    if addr.is_ipv6() && !allow_v6 {
                        continue;
                    }
                    let ip = IpAddress::from(addr);
                    if ip.is_valid() && !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(name = %name, error = %e, "Unable to find a corresponding IP address");
            }
            Err(_) => {
                warn!(name = %name, "DNS lookup timed out");
            }
        }
        self.name_to_ip.set(name.to_string(), ips.clone());
        ips
    }

    /// Reverse lookup of an address.
    pub async fn ip_to_name(&self, ip: &IpAddress) -> Option<String> {
        let key = ip.ntoa();
        if let Some(cached) = self.ip_to_name.get(&key) {
            return cached;
        }
        let std_ip = ip.as_std()?;
        let name = match tokio::time::timeout(DNS_TIMEOUT, self.resolver.reverse_lookup(std_ip))
            .await
        {
            Ok(Ok(response)) => response
                .iter()
                .next()
                .map(|ptr| ptr.to_string().trim_end_matches('.').to_string()),
            Ok(Err(e)) => {
                debug!(ip = %ip, error = %e, "Unable to find a name for the IP");
                None
            }
            Err(_) => {
                debug!(ip = %ip, "Reverse DNS lookup timed out");
                None
            }
        };
        self.ip_to_name.set(key, name.clone());
        name
    }

    /// Find the address(es) a piece of text stands for.
    ///
    /// A literal IP wins; otherwise DNS is consulted according to `usedns`.
    pub async fn text_to_ip(&self, text: &str, usedns: UseDns) -> Vec<IpAddress> {
        if let Some(ip) = IpAddress::search_ip(text) {
            if ip.is_valid() {
                return vec![ip];
            }
        }
        match usedns {
            UseDns::Yes | UseDns::Warn => {
                let ips = self.dns_to_ip(text).await;
                if !ips.is_empty() && usedns == UseDns::Warn {
                    warn!(text = %text, ips = ?ips.iter().map(|i| i.ntoa()).collect::<Vec<_>>(),
                        "Determined IP using DNS Lookup");
                }
                ips
            }
            UseDns::No | UseDns::Raw => Vec::new(),
        }
    }

    /// The short hostname of this host.
    pub fn hostname() -> Option<String> {
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
    }

    /// Own host names: `localhost` plus hostname variants.
    pub async fn get_self_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = HashSet::from(["localhost".to_string()]);
        if let Some(host) = Self::hostname() {
            // both the short name and, when present, the bare domain-less part
            if let Some(short) = host.split('.').next() {
                names.insert(short.to_string());
            }
            names.insert(host);
        }
        names
    }

    /// Own addresses: loopbacks plus whatever the self names resolve to.
    ///
    /// Interface enumeration is a platform capability this daemon treats as
    /// absent; resolution of the host's own names covers the usual case.
    pub async fn get_self_ips(&self) -> IpAddrSet {
        let mut set = IpAddrSet::new();
        set.add(IpAddress::id("127.0.0.1"));
        set.add(IpAddress::id("::1"));
        for name in self.get_self_names().await {
            if name == "localhost" {
                continue;
            }
            for ip in self.dns_to_ip(&name).await {
                set.add(ip);
            }
        }
        set
    }

    /// Shared file-backed ignore set for `path`.
    pub fn get_file_set(&self, path: &str) -> Arc<FileIpSet> {
        if let Some(cached) = self.file_to_ip.get(&path.to_string()) {
            return cached;
        }
        let set = Arc::new(FileIpSet::new(path));
        self.file_to_ip.set(path.to_string(), set.clone());
        set
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("allow_ipv6", &*self.allow_ipv6.read())
            .finish_non_exhaustive()
    }
}
