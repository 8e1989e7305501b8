//! Address classification for flow filtering.
//!
//! A destination is "internal" when it is loopback, private, link-local,
//! unique-local or falls inside one of the configured internal networks.
//! Flows towards internal destinations are never tracked.

use crate::error::{FlowError, FlowResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IPv4 or IPv6 network in CIDR notation.
///
/// # Examples
/// ```
/// use flowd::net::Cidr;
///
/// let net: Cidr = "192.0.2.0/24".parse().unwrap();
/// assert!(net.contains(&"192.0.2.17".parse().unwrap()));
/// assert!(!net.contains(&"198.51.100.1".parse().unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> FlowResult<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(FlowError::Configuration(format!(
                "prefix length {} out of range for {}",
                prefix, addr
            )));
        }
        // Host bits are dropped so 10.1.2.3/8 behaves as 10.0.0.0/8
        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_v4(prefix))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_v6(prefix))),
        };
        Ok(Self { network, prefix })
    }

    /// Whether `ip` is inside this network. Address families never mix.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(*ip) & mask_v4(self.prefix) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(*ip) & mask_v6(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = FlowError;

    fn from_str(s: &str) -> FlowResult<Self> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| FlowError::Configuration(format!("unable to parse network {}", s)))?;
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| FlowError::Configuration(format!("unable to parse network {}", s)))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };
        Cidr::new(addr, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Check if IPv4 address is private
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_unspecified()
        // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
        || ip.is_private()
        // 100.64.0.0/10 (shared address space, RFC 6598)
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))
        || ip.is_loopback()
        || ip.is_link_local()
}

/// Check if IPv6 address is private/local
pub fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(v4);
    }
    ip.is_unspecified()
        || ip.is_loopback()
        // fe80::/10 (link-local)
        || (ip.segments()[0] & 0xffc0) == 0xfe80
        // fc00::/7 (unique local)
        || (ip.segments()[0] & 0xfe00) == 0xfc00
}

pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(*v4),
        IpAddr::V6(v6) => is_private_ipv6(*v6),
    }
}

/// Private addresses plus anything inside the configured internal networks.
#[derive(Debug, Clone, Default)]
pub struct InternalNetworks {
    networks: Vec<Cidr>,
}

impl InternalNetworks {
    pub fn new(networks: Vec<Cidr>) -> Self {
        Self { networks }
    }

    /// Parse a configured CIDR list, failing on the first bad entry.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> FlowResult<Self> {
        let networks = entries
            .iter()
            .map(|e| e.as_ref().parse())
            .collect::<FlowResult<Vec<Cidr>>>()?;
        Ok(Self { networks })
    }

    pub fn is_internal(&self, ip: &IpAddr) -> bool {
        is_private(ip) || self.networks.iter().any(|net| net.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// Unwrap `::ffff:a.b.c.d` so IPv4 flows seen on dual-stack sockets key
/// the same way as native IPv4 ones.
pub fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Interfaces holding a global-scope IPv6 address, from the contents of
/// `/proc/net/if_inet6`. Loopback is never included.
pub fn parse_if_inet6(content: &str) -> Vec<String> {
    let mut interfaces: Vec<String> = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // address, ifindex, prefix length, scope, flags, name
        if fields.len() < 6 || fields[3] != "00" || fields[5] == "lo" {
            continue;
        }
        if !interfaces.iter().any(|i| i == fields[5]) {
            interfaces.push(fields[5].to_string());
        }
    }
    interfaces
}
