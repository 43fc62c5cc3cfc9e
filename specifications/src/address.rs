//  ADDRESS.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the Address struct, a lenient alternative to a `SocketAddr`
//!   that also accepts hostnames. Used wherever a config file or CLI flag
//!   points at the host's gRPC or HTTP endpoint.
//

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use enum_debug::EnumDebug;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};


/***** ERRORS *****/
/// Errors that relate to parsing Addresses.
#[derive(Debug)]
pub enum AddressError {
    /// Invalid port number.
    IllegalPortNumber { raw: String, err: std::num::ParseIntError },
    /// Missing the colon separator (':') in the address.
    MissingColon { raw: String },
    /// The hostname part was empty.
    EmptyHostname { raw: String },
}
impl Display for AddressError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use AddressError::*;
        match self {
            IllegalPortNumber { raw, .. } => write!(f, "Illegal port number '{raw}'"),
            MissingColon { raw } => write!(f, "Missing address/port separator ':' in '{raw}' (did you forget to define a port?)"),
            EmptyHostname { raw } => write!(f, "Missing hostname in '{raw}'"),
        }
    }
}
impl Error for AddressError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        use AddressError::*;
        match self {
            IllegalPortNumber { err, .. } => Some(err),
            MissingColon { .. } => None,
            EmptyHostname { .. } => None,
        }
    }
}





/***** LIBRARY *****/
/// Defines a more lenient alternative to a SocketAddr that also accepts hostnames.
#[derive(Clone, Debug, EnumDebug, Eq, Hash, PartialEq)]
pub enum Address {
    /// It's an IPv4 address.
    Ipv4(Ipv4Addr, u16),
    /// It's an IPv6 address.
    Ipv6(Ipv6Addr, u16),
    /// It's a hostname.
    Hostname(String, u16),
}
impl Address {
    /// Constructor for the Address that initializes it for the given hostname.
    ///
    /// # Arguments
    /// - `hostname`: The hostname for this address.
    /// - `port`: The port for this address.
    ///
    /// # Returns
    /// A new Address instance.
    #[inline]
    pub fn hostname(hostname: impl Into<String>, port: u16) -> Self { Self::Hostname(hostname.into(), port) }

    /// Returns the port of this address.
    #[inline]
    pub fn port(&self) -> u16 {
        use Address::*;
        match self {
            Ipv4(_, port) => *port,
            Ipv6(_, port) => *port,
            Hostname(_, port) => *port,
        }
    }

    /// Returns the host-part of this address, without the port.
    #[inline]
    pub fn host(&self) -> String {
        use Address::*;
        match self {
            Ipv4(addr, _) => addr.to_string(),
            Ipv6(addr, _) => addr.to_string(),
            Hostname(host, _) => host.clone(),
        }
    }

    /// Formats this address as an `http://`-prefixed URL, as expected by tonic endpoints.
    ///
    /// # Returns
    /// A String with the address rendered as a connectable URL.
    #[inline]
    pub fn to_url(&self) -> String { format!("http://{self}") }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use Address::*;
        match self {
            Ipv4(addr, port) => write!(f, "{addr}:{port}"),
            Ipv6(addr, port) => write!(f, "[{addr}]:{port}"),
            Hostname(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // An IPv6-with-port form parses straight as a SocketAddr
        if let Ok(sockaddr) = SocketAddr::from_str(s) {
            return match sockaddr.ip() {
                IpAddr::V4(addr) => Ok(Self::Ipv4(addr, sockaddr.port())),
                IpAddr::V6(addr) => Ok(Self::Ipv6(addr, sockaddr.port())),
            };
        }

        // Otherwise, find the last colon that separates host from port
        let colon: usize = match s.rfind(':') {
            Some(pos) => pos,
            None => {
                return Err(AddressError::MissingColon { raw: s.into() });
            },
        };
        let (host, port): (&str, &str) = (&s[..colon], &s[colon + 1..]);
        if host.is_empty() {
            return Err(AddressError::EmptyHostname { raw: s.into() });
        }
        let port: u16 = match u16::from_str(port) {
            Ok(port) => port,
            Err(err) => {
                return Err(AddressError::IllegalPortNumber { raw: s.into(), err });
            },
        };

        // It may still be a bare IPv4 host
        match Ipv4Addr::from_str(host) {
            Ok(addr) => Ok(Self::Ipv4(addr, port)),
            Err(_) => Ok(Self::Hostname(host.into(), port)),
        }
    }
}

impl Serialize for Address {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> { serializer.serialize_str(&self.to_string()) }
}
impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        /// Visitor for the Address.
        struct AddressVisitor;
        impl Visitor<'_> for AddressVisitor {
            type Value = Address;

            fn expecting(&self, f: &mut Formatter<'_>) -> FResult { write!(f, "an address of the form '<host>:<port>'") }

            #[inline]
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> { Address::from_str(v).map_err(E::custom) }
        }

        deserializer.deserialize_str(AddressVisitor)
    }
}



/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        assert_eq!(Address::from_str("127.0.0.1:50051").unwrap(), Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 50051));
        assert_eq!(Address::from_str("orbitmesh.example.com:443").unwrap(), Address::hostname("orbitmesh.example.com", 443));
        assert_eq!(Address::from_str("[::1]:8080").unwrap(), Address::Ipv6(Ipv6Addr::LOCALHOST, 8080));
        assert!(matches!(Address::from_str("no-port-here"), Err(AddressError::MissingColon { .. })));
        assert!(matches!(Address::from_str(":8080"), Err(AddressError::EmptyHostname { .. })));
        assert!(matches!(Address::from_str("host:not-a-port"), Err(AddressError::IllegalPortNumber { .. })));
    }

    #[test]
    fn test_address_roundtrip() {
        for raw in ["127.0.0.1:50051", "node-7.internal:1234", "[::1]:8080"] {
            let addr: Address = Address::from_str(raw).unwrap();
            assert_eq!(addr.to_string(), raw);
        }
    }

    #[test]
    fn test_address_url() {
        assert_eq!(Address::hostname("example.com", 50051).to_url(), "http://example.com:50051");
    }
}
