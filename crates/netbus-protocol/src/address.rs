//! Network endpoint addresses.
//!
//! An [`Address`] is an IP address plus a port, resolved once from text and
//! never mutated afterwards. Two addresses are equal when their ports match
//! and their integer forms ([`Address::to_integer`]) match, so an IPv4 address
//! and its IPv4-mapped IPv6 spelling compare equal.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::AddressError;

/// Well-known address strings.
pub mod defines {
    /// The invalid/unresolved sentinel. Resolves to [`Address::none`](super::Address::none).
    pub const NONE: &str = "0";
    /// Wildcard IPv4 address. A reliable socket bound to it listens.
    pub const ANY_IPV4: &str = "0.0.0.0";
    /// Wildcard IPv6 address. A reliable socket bound to it listens.
    pub const ANY_IPV6: &str = "::";
    /// IPv4 loopback.
    pub const LOCALHOST_IPV4: &str = "127.0.0.1";
    /// IPv6 loopback.
    pub const LOCALHOST_IPV6: &str = "::1";
    /// IPv4 limited broadcast.
    pub const BROADCAST_IPV4: &str = "255.255.255.255";
}

/// A resolved network endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

impl Address {
    /// Resolves `text` and `port` into an address.
    ///
    /// Only characters from `[0-9a-fA-F.:%/-]` are accepted, which covers
    /// numeric IPv4 and IPv6 spellings (scope ids included). Text that doesn't
    /// parse as a literal IP goes through the system resolver.
    ///
    /// # Errors
    /// - [`AddressError::InvalidCharacters`] for text outside the allow-set
    /// - [`AddressError::Unresolved`] when nothing resolves
    /// - [`AddressError::PortOutOfRange`] for port 65535
    pub fn resolve(text: &str, port: u16) -> Result<Self, AddressError> {
        if text == defines::NONE {
            return Ok(Self::none());
        }
        if text.is_empty() {
            return Err(AddressError::Unresolved(String::new()));
        }

        if let Some(character) = text.chars().find(|c| !is_allowed(*c)) {
            return Err(AddressError::InvalidCharacters {
                text: text.to_string(),
                character,
            });
        }

        if port == u16::MAX {
            return Err(AddressError::PortOutOfRange(port));
        }

        if let Ok(ip) = text.parse::<IpAddr>() {
            return Ok(Self { ip, port });
        }

        let resolved = (text, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next());

        match resolved {
            Some(addr) => Ok(Self {
                ip: addr.ip(),
                port,
            }),
            None => {
                tracing::debug!(text, "address did not resolve");
                Err(AddressError::Unresolved(text.to_string()))
            }
        }
    }

    /// The invalid/unresolved sentinel: unspecified IPv4 with port 0.
    pub fn none() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    /// Wraps an already-resolved socket address (e.g. one reported by
    /// `accept`).
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Returns the same host with `port + offset`, or `None` on overflow.
    ///
    /// The unreliable half of a peer lives at `with_port_offset(1)`.
    pub fn with_port_offset(&self, offset: u16) -> Option<Self> {
        self.port.checked_add(offset).map(|port| Self { ip: self.ip, port })
    }

    /// `true` for the [`none`](Self::none) sentinel.
    pub fn is_none(&self) -> bool {
        self.port == 0 && self.ip.is_unspecified()
    }

    /// `true` for a wildcard host with a real port (bind-for-listen).
    pub fn is_any(&self) -> bool {
        self.port != 0 && self.ip.is_unspecified()
    }

    /// `true` for the IPv4 limited broadcast address.
    pub fn is_broadcast(&self) -> bool {
        matches!(self.ip, IpAddr::V4(v4) if v4.is_broadcast())
    }

    /// Formats the host, optionally followed by the port.
    ///
    /// ```rust
    /// use netbus_protocol::Address;
    ///
    /// let addr = Address::resolve("::1", 7777).unwrap();
    /// assert_eq!(addr.to_canonical_string(false), "::1");
    /// assert_eq!(addr.to_canonical_string(true), "[::1]:7777");
    /// ```
    pub fn to_canonical_string(&self, include_port: bool) -> String {
        if include_port {
            self.socket_addr().to_string()
        } else {
            self.ip.to_string()
        }
    }

    /// A comparable 32-bit form of the host.
    ///
    /// IPv4 yields the address in host order. IPv6 falls back to the embedded
    /// IPv4 address for mapped addresses, and otherwise to the XOR of its four
    /// 32-bit segments.
    pub fn to_integer(&self) -> u32 {
        match self.ip {
            IpAddr::V4(v4) => u32::from(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => u32::from(v4),
                None => v6
                    .octets()
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .fold(0, |acc, segment| acc ^ segment),
            },
        }
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_hexdigit() || matches!(c, '.' | ':' | '%' | '-' | '/')
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.to_integer() == other.to_integer()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.port.hash(state);
        self.to_integer().hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_string(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ipv4_literal_keeps_host_and_port() {
        let addr = Address::resolve(defines::LOCALHOST_IPV4, 7777).unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.port(), 7777);
        assert_eq!(addr.to_integer(), 0x7f00_0001);
    }

    #[test]
    fn test_resolve_hostname_letters_rejected() {
        let result = Address::resolve("localhost", 7777);
        assert!(
            matches!(
                result,
                Err(AddressError::InvalidCharacters { character: 'l', .. })
            ),
            "got {result:?}"
        );
    }

    #[test]
    fn test_resolve_empty_text_is_unresolved() {
        let result = Address::resolve("", 7777);
        assert!(matches!(result, Err(AddressError::Unresolved(_))));
    }

    #[test]
    fn test_resolve_max_port_rejected() {
        let result = Address::resolve(defines::LOCALHOST_IPV4, u16::MAX);
        assert_eq!(result, Err(AddressError::PortOutOfRange(u16::MAX)));
    }

    #[test]
    fn test_resolve_none_text_yields_sentinel() {
        let addr = Address::resolve(defines::NONE, 9000).unwrap();
        assert!(addr.is_none());
        assert!(!addr.is_any());
    }

    #[test]
    fn test_any_addresses_are_listen_addresses() {
        let v4 = Address::resolve(defines::ANY_IPV4, 9000).unwrap();
        let v6 = Address::resolve(defines::ANY_IPV6, 9000).unwrap();
        assert!(v4.is_any());
        assert!(v6.is_any());
        assert!(!v4.is_none());
    }

    #[test]
    fn test_broadcast_detected() {
        let addr = Address::resolve(defines::BROADCAST_IPV4, 9000).unwrap();
        assert!(addr.is_broadcast());
    }

    #[test]
    fn test_equality_mapped_ipv6_matches_ipv4() {
        let v4 = Address::resolve("127.0.0.1", 7000).unwrap();
        let mapped = Address::resolve("::ffff:127.0.0.1", 7000).unwrap();
        assert_eq!(v4, mapped);
    }

    #[test]
    fn test_equality_different_port_not_equal() {
        let a = Address::resolve("10.0.0.1", 7000).unwrap();
        let b = Address::resolve("10.0.0.1", 7001).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_with_port_offset_overflow_is_none() {
        let addr = Address::from_socket_addr("10.0.0.1:65535".parse().unwrap());
        assert!(addr.with_port_offset(1).is_none());
        let low = Address::resolve("10.0.0.1", 7000).unwrap();
        assert_eq!(low.with_port_offset(1).unwrap().port(), 7001);
    }

    #[test]
    fn test_canonical_string_with_and_without_port() {
        let addr = Address::resolve("192.168.1.20", 4000).unwrap();
        assert_eq!(addr.to_canonical_string(false), "192.168.1.20");
        assert_eq!(addr.to_canonical_string(true), "192.168.1.20:4000");
        assert_eq!(addr.to_string(), "192.168.1.20:4000");
    }

    #[test]
    fn test_hash_works_as_map_key() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Address::resolve("127.0.0.1", 7000).unwrap());
        assert!(set.contains(&Address::resolve("::ffff:127.0.0.1", 7000).unwrap()));
    }
}
