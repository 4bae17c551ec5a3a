use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// An IP address that may be absent.
///
/// Connection records use `Unspecified` as a wildcard: a socket whose local
/// or remote address is unspecified matches any packet address on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAddress {
    #[default]
    Unspecified,
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddress {
    /// Length of the address in bytes: 0, 4 or 16.
    pub fn len(&self) -> usize {
        match self {
            IpAddress::Unspecified => 0,
            IpAddress::V4(_) => 4,
            IpAddress::V6(_) => 16,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for the absent address and for the all-zeros address of either
    /// family.
    pub fn is_unspecified(&self) -> bool {
        match self {
            IpAddress::Unspecified => true,
            IpAddress::V4(addr) => addr.is_unspecified(),
            IpAddress::V6(addr) => addr.is_unspecified(),
        }
    }

    pub fn is_multicast(&self) -> bool {
        match self {
            IpAddress::Unspecified => false,
            IpAddress::V4(addr) => addr.is_multicast(),
            IpAddress::V6(addr) => addr.is_multicast(),
        }
    }

    pub fn as_v4(&self) -> Option<Ipv4Addr> {
        match self {
            IpAddress::V4(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Exact match used by the connection lookup: an unspecified filter
    /// matches anything, otherwise length and value must both agree.
    pub fn matches_v4(&self, addr: Ipv4Addr) -> bool {
        match self {
            IpAddress::Unspecified => true,
            IpAddress::V4(own) => *own == addr,
            IpAddress::V6(_) => false,
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(addr)
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(addr)
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::Unspecified => f.write_str("*"),
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}
