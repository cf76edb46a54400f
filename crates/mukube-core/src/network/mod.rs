//! Network planning module.
//!
//! Derives everything the cluster needs to know about the host network from
//! the two user-supplied ranges: the pod and service networks, the first
//! service address, the DNS address and the minimal range covering both,
//! plus the host address to bind externally reachable daemons to.

use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, info};

/// Error types for network planning.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NetworkError {
    /// The input did not parse as CIDR notation.
    #[error("invalid CIDR address: {0}")]
    InvalidCidr(String),

    /// The host has no usable non-loopback IPv4 address.
    #[error("no non-loopback IPv4 addresses found")]
    NoBindAddress,

    /// The interface list could not be read.
    #[error("couldn't read interface list: {0}")]
    Interfaces(#[from] nix::Error),
}

/// An IPv4 network in CIDR notation.
///
/// The address part is kept exactly as supplied; [`Cidr::network`] yields the
/// masked form. This mirrors how the ranges are displayed: the pod/service
/// nets print as networks while the derived cluster range keeps the host
/// part of the lower input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    /// Address exactly as supplied.
    pub addr: Ipv4Addr,
    /// Prefix length, 0..=32.
    pub prefix: u8,
}

impl Cidr {
    /// Create a CIDR from its parts.
    #[must_use]
    pub const fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    /// Parse `input` as `a.b.c.d/len`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidCidr`] carrying the verbatim input on
    /// any malformed address or prefix.
    pub fn parse(input: &str) -> Result<Self, NetworkError> {
        let invalid = || NetworkError::InvalidCidr(input.to_string());

        let (addr_part, prefix_part) = input.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr_part.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix_part.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }

        Ok(Self { addr, prefix })
    }

    /// The netmask as a 32-bit value.
    #[must_use]
    pub const fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// The network address (the supplied address with host bits cleared).
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    /// The masked form of this range.
    #[must_use]
    pub fn as_network(&self) -> Self {
        Self {
            addr: self.network(),
            prefix: self.prefix,
        }
    }

    /// Whether `ip` lies inside this range.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Everything derived from the pod and service ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkPlan {
    /// Pod network (masked form).
    pub pod_net: Cidr,
    /// Service network (masked form).
    pub service_net: Cidr,
    /// Minimal range covering both pod and service networks.
    pub cluster_net: Cidr,
    /// First service address, i.e. the `kubernetes` service VIP.
    pub service_ip: Ipv4Addr,
    /// Cluster DNS address (service address + 1).
    pub dns_ip: Ipv4Addr,
}

impl NetworkPlan {
    /// Compute the plan from the two ranges in CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidCidr`] for unparseable input.
    pub fn calculate(pod_range: &str, service_range: &str) -> Result<Self, NetworkError> {
        let pod = Cidr::parse(pod_range)?;
        let service = Cidr::parse(service_range)?;

        let cluster_net = combine_ranges(pod, service);
        let dns_ip = next_ip(service.addr);

        info!(
            pod_range = %pod.as_network(),
            service_range = %service.as_network(),
            cluster_range = %cluster_net,
            "IP ranges calculated"
        );

        Ok(Self {
            pod_net: pod.as_network(),
            service_net: service.as_network(),
            cluster_net,
            service_ip: service.addr,
            dns_ip,
        })
    }
}

/// The minimal range covering both inputs: the shared bit prefix of the two
/// network addresses, based at whichever input starts lower.
fn combine_ranges(pod: Cidr, service: Cidr) -> Cidr {
    let pod_net = u32::from(pod.network());
    let service_net = u32::from(service.network());

    let prefix = if pod_net == service_net {
        pod.prefix.min(service.prefix)
    } else {
        (pod_net ^ service_net).leading_zeros() as u8
    };

    let base = if service_net < pod_net {
        service.addr
    } else {
        pod.addr
    };
    Cidr::new(base, prefix)
}

/// The address one above `ip` (final octet incremented).
fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    let mut octets = ip.octets();
    octets[3] = octets[3].wrapping_add(1);
    Ipv4Addr::from(octets)
}

/// Find a host address to bind services to.
///
/// Enumerates all IPv4 addresses on non-loopback interfaces and prefers a
/// private (RFC1918) address; falls back to the first public candidate.
///
/// # Errors
///
/// Returns [`NetworkError::NoBindAddress`] when no candidate exists and
/// [`NetworkError::Interfaces`] when the interface list cannot be read.
pub fn find_bind_address() -> Result<Ipv4Addr, NetworkError> {
    let mut candidates = Vec::new();
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        let Some(address) = ifaddr.address else {
            continue;
        };
        let Some(sin) = address.as_sockaddr_in() else {
            continue;
        };
        let ip = sin.ip();
        if !ip.is_loopback() {
            candidates.push(ip);
        }
    }

    select_bind_address(&candidates).ok_or(NetworkError::NoBindAddress)
}

/// Pick the bind address from a candidate list: the first RFC1918 address if
/// any exists, otherwise the first candidate.
#[must_use]
pub fn select_bind_address(candidates: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    debug!(?candidates, "Beginning bind address selection");

    if let Some(private) = candidates.iter().find(|ip| ip.is_private()) {
        return Some(*private);
    }
    if let Some(public) = candidates.first() {
        info!(
            ?candidates,
            "Didn't find an interface with a private IPv4, falling back to a public one"
        );
        return Some(*public);
    }
    None
}
