//! IPv4/IPv6 address and subnet handling.
//!
//! An [`IpAddress`] always keeps the raw input string. When the string does
//! not parse as an address the instance stays usable as an opaque
//! identifier (`Family::Unspec` for DNS-ish strings, `Family::Raw` for
//! explicitly non-address ids), so tickets can be keyed by whatever the
//! filter extracted.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::ip::cache::TtlCache;

/// Address family, in the fixed comparison order used by ban lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    /// Not a parseable address; the raw string may be a DNS name.
    Unspec,
    /// IPv4.
    V4,
    /// IPv6.
    V6,
    /// Explicitly raw identifier, never treated as resolvable.
    Raw,
}

impl Family {
    /// Protocol name of the family (`inet4` / `inet6`), empty otherwise.
    pub fn name(&self) -> &'static str {
        match self {
            Family::V4 => "inet4",
            Family::V6 => "inet6",
            Family::Unspec | Family::Raw => "",
        }
    }
}

/// An IP address or subnet, with the original string retained.
#[derive(Debug, Clone)]
pub struct IpAddress {
    family: Family,
    addr: u128,
    plen: u8,
    raw: String,
}

/// Parsed-instance cache shared across the daemon; raw/unspec values are
/// never cached.
fn obj_cache() -> &'static TtlCache<String, IpAddress> {
    static CACHE: OnceLock<TtlCache<String, IpAddress>> = OnceLock::new();
    CACHE.get_or_init(|| TtlCache::new(10_000, 300.0))
}

impl IpAddress {
    /// Parse an address, subnet or opaque identifier.
    ///
    /// Accepted: `a.b.c.d`, `a.b.c.d/plen`, `a.b.c.d/dotted-mask`, `ipv6`,
    /// `[ipv6]`, `ipv6/plen`, `ipv6/ipv6-mask`. Anything else yields an
    /// `Unspec` instance carrying the raw string. A mask that is not
    /// contiguous ones-then-zeroes is an error.
    pub fn parse(ipstr: &str) -> Result<IpAddress> {
        if let Some(cached) = obj_cache().get(&ipstr.to_string()) {
            return Ok(cached);
        }
        let ip = Self::parse_uncached(ipstr)?;
        if ip.is_valid() {
            obj_cache().set(ipstr.to_string(), ip.clone());
        }
        Ok(ip)
    }

    /// Parse, mapping mask errors to an `Unspec` instance instead.
    pub fn id(ipstr: &str) -> IpAddress {
        Self::parse(ipstr).unwrap_or_else(|_| Self::unspec(ipstr))
    }

    /// An explicitly raw identifier (never resolved, never cached).
    pub fn raw_id(id: &str) -> IpAddress {
        IpAddress {
            family: Family::Raw,
            addr: 0,
            plen: 0,
            raw: id.to_string(),
        }
    }

    fn unspec(raw: &str) -> IpAddress {
        IpAddress {
            family: Family::Unspec,
            addr: 0,
            plen: 0,
            raw: raw.to_string(),
        }
    }

    fn parse_uncached(ipstr: &str) -> Result<IpAddress> {
        // IPv6 with port is conventionally bracketed; strip brackets first.
        let mut body = ipstr;
        if body.len() > 2 && body.starts_with('[') && body.ends_with(']') {
            body = &body[1..body.len() - 1];
        }

        let (host, cidr) = match body.split_once('/') {
            None => (body, None),
            Some((host, mask)) => {
                if let Ok(plen) = mask.parse::<u8>() {
                    (host, Some(plen))
                } else {
                    // Dotted or ipv6-style mask; must convert to a prefix length.
                    let mask_ip = Self::parse_single(mask);
                    match mask_ip {
                        Some(m) => (host, Some(m.mask_to_plen()?)),
                        None => return Ok(Self::unspec(ipstr)),
                    }
                }
            }
        };

        let Some(parsed) = Self::parse_single(host) else {
            return Ok(Self::unspec(ipstr));
        };

        let width = parsed.width();
        let ip = match cidr {
            Some(plen) => {
                if plen > width {
                    return Ok(Self::unspec(ipstr));
                }
                IpAddress {
                    family: parsed.family,
                    addr: parsed.addr & Self::mask_bits(parsed.family, plen),
                    plen,
                    raw: ipstr.to_string(),
                }
            }
            None => {
                // An IPv4-mapped IPv6 address normalizes to IPv4.
                if parsed.family == Family::V6 {
                    let v6 = Ipv6Addr::from(parsed.addr);
                    if let Some(v4) = v6.to_ipv4_mapped() {
                        return Ok(IpAddress {
                            family: Family::V4,
                            addr: u32::from(v4) as u128,
                            plen: 32,
                            raw: ipstr.to_string(),
                        });
                    }
                }
                IpAddress {
                    raw: ipstr.to_string(),
                    ..parsed
                }
            }
        };
        Ok(ip)
    }

    /// Parse a bare address with full prefix length; `None` if not an address.
    fn parse_single(text: &str) -> Option<IpAddress> {
        if let Ok(v4) = text.parse::<Ipv4Addr>() {
            return Some(IpAddress {
                family: Family::V4,
                addr: u32::from(v4) as u128,
                plen: 32,
                raw: text.to_string(),
            });
        }
        if let Ok(v6) = text.parse::<Ipv6Addr>() {
            return Some(IpAddress {
                family: Family::V6,
                addr: u128::from(v6),
                plen: 128,
                raw: text.to_string(),
            });
        }
        None
    }

    /// Whether `text` is exactly one address (optionally bracketed).
    pub fn search_ip(text: &str) -> Option<IpAddress> {
        let mut body = text;
        if body.len() > 2 && body.starts_with('[') && body.ends_with(']') {
            body = &body[1..body.len() - 1];
        }
        Self::parse_single(body).map(|ip| IpAddress {
            raw: text.to_string(),
            ..ip
        })
    }

    fn width(&self) -> u8 {
        match self.family {
            Family::V4 => 32,
            Family::V6 => 128,
            _ => 0,
        }
    }

    fn mask_bits(family: Family, plen: u8) -> u128 {
        let width = match family {
            Family::V4 => 32,
            Family::V6 => 128,
            _ => return 0,
        };
        if plen == 0 {
            0
        } else {
            let ones = u128::MAX >> (128 - width);
            ones & !(ones >> plen)
        }
    }

    /// Prefix length of this instance interpreted as a netmask.
    ///
    /// `255.255.255.0` → 24. Fails unless the address is contiguous
    /// ones followed by zeroes.
    fn mask_to_plen(&self) -> Result<u8> {
        let width = self.width() as u32;
        let ones = (self.addr.count_ones()) as u8;
        let expected = Self::mask_bits(self.family, ones);
        if self.addr == expected && width > 0 {
            Ok(ones)
        } else {
            Err(Error::InvalidArgument(format!(
                "invalid mask {:?}, no prefix length representation",
                self.raw
            )))
        }
    }

    /// Whether the instance corresponds to a valid IP address or subnet.
    pub fn is_valid(&self) -> bool {
        matches!(self.family, Family::V4 | Family::V6)
    }

    /// Whether this is a single address (full prefix, not a subnet).
    pub fn is_single(&self) -> bool {
        self.is_valid() && self.plen == self.width()
    }

    /// Whether this is IPv4.
    pub fn is_ipv4(&self) -> bool {
        self.family == Family::V4
    }

    /// Whether this is IPv6.
    pub fn is_ipv6(&self) -> bool {
        self.family == Family::V6
    }

    /// The address family.
    pub fn family(&self) -> Family {
        self.family
    }

    /// The numeric address (network order, low bits for IPv4).
    pub fn addr(&self) -> u128 {
        self.addr
    }

    /// The prefix length.
    pub fn plen(&self) -> u8 {
        self.plen
    }

    /// The original input string.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Canonical text form (lowercased/compressed IPv6, `/plen` for subnets).
    pub fn ntoa(&self) -> String {
        match self.family {
            Family::V4 => {
                let base = Ipv4Addr::from(self.addr as u32).to_string();
                if self.plen < 32 {
                    format!("{}/{}", base, self.plen)
                } else {
                    base
                }
            }
            Family::V6 => {
                let base = Ipv6Addr::from(self.addr).to_string();
                if self.plen < 128 {
                    format!("{}/{}", base, self.plen)
                } else {
                    base
                }
            }
            Family::Unspec | Family::Raw => self.raw.clone(),
        }
    }

    /// Hex representation of the address (debug aid), empty when invalid.
    pub fn hexdump(&self) -> String {
        match self.family {
            Family::V4 => format!("{:08x}", self.addr as u32),
            Family::V6 => format!("{:032x}", self.addr),
            _ => String::new(),
        }
    }

    /// The reverse-DNS label of this address.
    ///
    /// The default suffix is the family's standard reverse domain.
    pub fn get_ptr(&self, suffix: Option<&str>) -> String {
        match self.family {
            Family::V4 => {
                let octets: Vec<String> = self
                    .ntoa()
                    .split('.')
                    .rev()
                    .map(String::from)
                    .collect();
                format!("{}.{}", octets.join("."), suffix.unwrap_or("in-addr.arpa."))
            }
            Family::V6 => {
                let nibbles: Vec<String> = self
                    .hexdump()
                    .chars()
                    .rev()
                    .map(String::from)
                    .collect();
                format!("{}.{}", nibbles.join("."), suffix.unwrap_or("ip6.arpa."))
            }
            _ => String::new(),
        }
    }

    /// Whether this address lies inside `net`.
    pub fn is_in_net(&self, net: &IpAddress) -> bool {
        if self.family != net.family || !self.is_valid() {
            return false;
        }
        (self.addr & Self::mask_bits(net.family, net.plen)) == net.addr
    }

    /// Whether this instance (as a network) contains `ip`.
    pub fn contains(&self, ip: &IpAddress) -> bool {
        ip == self || ip.is_in_net(self)
    }

    /// A standard-library view of a single address, if any.
    pub fn as_std(&self) -> Option<std::net::IpAddr> {
        match self.family {
            Family::V4 => Some(std::net::IpAddr::V4(Ipv4Addr::from(self.addr as u32))),
            Family::V6 => Some(std::net::IpAddr::V6(Ipv6Addr::from(self.addr))),
            _ => None,
        }
    }
}

impl From<std::net::IpAddr> for IpAddress {
    fn from(ip: std::net::IpAddr) -> Self {
        match ip {
            std::net::IpAddr::V4(v4) => IpAddress {
                family: Family::V4,
                addr: u32::from(v4) as u128,
                plen: 32,
                raw: v4.to_string(),
            },
            std::net::IpAddr::V6(v6) => IpAddress {
                family: Family::V6,
                addr: u128::from(v6),
                plen: 128,
                raw: v6.to_string(),
            },
        }
    }
}

impl PartialEq for IpAddress {
    fn eq(&self, other: &Self) -> bool {
        if self.family != other.family {
            return false;
        }
        match self.family {
            Family::V4 | Family::V6 => self.addr == other.addr && self.plen == other.plen,
            // Raw ids are equal only to raw ids with the same string; an
            // unparseable string only equals the same string.
            Family::Unspec | Family::Raw => self.raw == other.raw,
        }
    }
}

impl Eq for IpAddress {}

impl Hash for IpAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        match self.family {
            Family::V4 | Family::V6 => {
                self.addr.hash(state);
                self.plen.hash(state);
            }
            Family::Unspec | Family::Raw => self.raw.hash(state),
        }
    }
}

impl PartialOrd for IpAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IpAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family
            .cmp(&other.family)
            .then_with(|| self.addr.cmp(&other.addr))
            .then_with(|| self.plen.cmp(&other.plen))
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl std::fmt::Display for IpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ntoa())
    }
}
