//! Network segments and local interface enumeration.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use if_addrs::IfAddr;

use crate::error::CastError;

/// Segments always offered after the local ones.
const FALLBACK_SEGMENTS: [&str; 2] = ["192.168.1", "192.168.0"];

/// First and last host suffix probed in a segment scan.
pub const FIRST_HOST: u8 = 1;
pub const LAST_HOST: u8 = 254;

/// The first three octets of an IPv4 /24, e.g. `192.168.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkSegment([u8; 3]);

impl NetworkSegment {
    pub fn new(a: u8, b: u8, c: u8) -> Self {
        Self([a, b, c])
    }

    pub fn octets(&self) -> [u8; 3] {
        self.0
    }

    /// The address `<segment>.<suffix>`.
    pub fn host(&self, suffix: u8) -> Ipv4Addr {
        let [a, b, c] = self.0;
        Ipv4Addr::new(a, b, c, suffix)
    }

    /// Every probe target, `.1` through `.254`.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (FIRST_HOST..=LAST_HOST).map(move |suffix| self.host(suffix))
    }

    /// The segment an address belongs to.
    pub fn of(ip: Ipv4Addr) -> Self {
        let [a, b, c, _] = ip.octets();
        Self([a, b, c])
    }
}

impl FromStr for NetworkSegment {
    type Err = CastError;

    /// Accepts exactly three dot-separated groups of one to three decimal
    /// digits, each at most 255. No surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CastError::InvalidSegment(s.to_string());
        let mut octets = [0u8; 3];
        let mut parts = s.split('.');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let value: u16 = part.parse().map_err(|_| invalid())?;
            *octet = u8::try_from(value).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for NetworkSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}.{b}.{c}")
    }
}

/// Whether `s` is usable as a scan target. The empty string is valid and
/// means "use broadcast".
pub fn is_valid_network_segment(s: &str) -> bool {
    s.is_empty() || s.parse::<NetworkSegment>().is_ok()
}

/// One IPv4 address of a local interface, reduced to what broadcast
/// discovery looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InterfaceAddr {
    up: bool,
    loopback: bool,
    broadcast: Option<Ipv4Addr>,
}

/// Directed broadcast addresses of every up, non-loopback IPv4 interface
/// that has one.
pub fn broadcast_addresses() -> std::io::Result<Vec<Ipv4Addr>> {
    Ok(broadcast_targets(interfaces()?))
}

fn broadcast_targets(ifaces: impl IntoIterator<Item = InterfaceAddr>) -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    for iface in ifaces {
        if !iface.up || iface.loopback {
            continue;
        }
        if let Some(broadcast) = iface.broadcast {
            if !out.contains(&broadcast) {
                out.push(broadcast);
            }
        }
    }
    out
}

/// A down interface can keep its address on Linux, so link state comes
/// from the interface flags rather than from the address list.
#[cfg(unix)]
fn interfaces() -> std::io::Result<Vec<InterfaceAddr>> {
    use nix::net::if_::InterfaceFlags;

    let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
    Ok(addrs
        .filter(|a| {
            a.address
                .as_ref()
                .and_then(|addr| addr.as_sockaddr_in())
                .is_some()
        })
        .map(|a| InterfaceAddr {
            up: a
                .flags
                .contains(InterfaceFlags::IFF_UP | InterfaceFlags::IFF_RUNNING),
            loopback: a.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            broadcast: a
                .broadcast
                .as_ref()
                .and_then(|addr| addr.as_sockaddr_in())
                .map(|sin| Ipv4Addr::from(sin.ip())),
        })
        .collect())
}

/// if-addrs reports no link state on this platform; every listed adapter
/// is taken as up.
#[cfg(not(unix))]
fn interfaces() -> std::io::Result<Vec<InterfaceAddr>> {
    Ok(if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match &iface.addr {
            IfAddr::V4(v4) => Some(InterfaceAddr {
                up: true,
                loopback: iface.is_loopback(),
                broadcast: v4.broadcast,
            }),
            IfAddr::V6(_) => None,
        })
        .collect())
}

/// Segments worth offering to the user: the local interfaces' /24
/// prefixes first, then the common home defaults. No duplicates.
pub fn suggested_segments() -> Vec<String> {
    let local = match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                IfAddr::V4(v4) => Some(v4.ip),
                IfAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            tracing::debug!("interface enumeration failed: {e}");
            Vec::new()
        }
    };
    segments_from(local)
}

fn segments_from(ips: impl IntoIterator<Item = Ipv4Addr>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let local = ips.into_iter().map(|ip| NetworkSegment::of(ip).to_string());
    for segment in local.chain(FALLBACK_SEGMENTS.iter().map(|s| s.to_string())) {
        if !out.contains(&segment) {
            out.push(segment);
        }
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────
