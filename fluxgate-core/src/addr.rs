//! Destination addresses and their wire encoding.
//!
//! The tunnel request header uses the SOCKS5 address layout
//! (type byte, address, big-endian port); it is the first sealed chunk of
//! every session and must stay bit-compatible with deployed servers.

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Destination of one relayed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Domain(String, u16),
    Ip(SocketAddr),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
        }
    }
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Domain(_, port) => *port,
            TargetAddr::Ip(addr) => addr.port(),
        }
    }

    pub fn host(&self) -> String {
        match self {
            TargetAddr::Domain(domain, _) => domain.clone(),
            TargetAddr::Ip(addr) => addr.ip().to_string(),
        }
    }

    /// Encode as a request header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut header = Vec::new();

        match self {
            TargetAddr::Domain(domain, port) => {
                if domain.len() > 255 {
                    return Err(Error::handshake("Domain name too long"));
                }
                header.push(ATYP_DOMAIN);
                header.push(domain.len() as u8);
                header.extend_from_slice(domain.as_bytes());
                header.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V4(v4)) => {
                header.push(ATYP_IPV4);
                header.extend_from_slice(&v4.ip().octets());
                header.extend_from_slice(&v4.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(v6)) => {
                header.push(ATYP_IPV6);
                header.extend_from_slice(&v6.ip().octets());
                header.extend_from_slice(&v6.port().to_be_bytes());
            }
        }

        Ok(header)
    }

    /// Parse a request header; returns the address and the bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(Error::handshake("Empty address header"));
        }

        match data[0] {
            ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(Error::handshake("IPv4 address too short"));
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((
                    TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))),
                    7,
                ))
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(Error::handshake("Domain address too short"));
                }
                let domain_len = data[1] as usize;
                let total_len = 2 + domain_len + 2;
                if data.len() < total_len {
                    return Err(Error::handshake("Domain address incomplete"));
                }
                let domain = String::from_utf8(data[2..2 + domain_len].to_vec())
                    .map_err(|_| Error::handshake("Invalid domain encoding"))?;
                let port = u16::from_be_bytes([data[2 + domain_len], data[3 + domain_len]]);
                Ok((TargetAddr::Domain(domain, port), total_len))
            }
            ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(Error::handshake("IPv6 address too short"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((
                    TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0))),
                    19,
                ))
            }
            other => Err(Error::handshake(format!("Unknown address type: {}", other))),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl From<(IpAddr, u16)> for TargetAddr {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        TargetAddr::Ip(SocketAddr::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ipv4() {
        let target = TargetAddr::Ip("192.168.1.1:443".parse().unwrap());
        let header = target.encode().unwrap();

        assert_eq!(header[0], 0x01);
        assert_eq!(&header[1..5], &[192, 168, 1, 1]);
        assert_eq!(&header[5..7], &[0x01, 0xBB]);
    }

    #[test]
    fn test_encode_domain() {
        let target = TargetAddr::Domain("example.com".to_string(), 80);
        let header = target.encode().unwrap();

        assert_eq!(header[0], 0x03);
        assert_eq!(header[1], 11);
        assert_eq!(&header[2..13], b"example.com");
        assert_eq!(&header[13..15], &[0x00, 0x50]);
    }

    #[test]
    fn test_encode_rejects_long_domain() {
        let target = TargetAddr::Domain("a".repeat(256), 80);
        assert!(target.encode().is_err());
    }

    #[test]
    fn test_parse_roundtrip() {
        let cases = [
            TargetAddr::Ip("10.0.0.1:8080".parse().unwrap()),
            TargetAddr::Ip("[2001:db8::1]:443".parse().unwrap()),
            TargetAddr::Domain("example.com".to_string(), 65535),
        ];

        for target in cases {
            let encoded = target.encode().unwrap();
            let (parsed, consumed) = TargetAddr::parse(&encoded).unwrap();
            assert_eq!(parsed, target);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_parse_trailing_data() {
        let mut encoded = TargetAddr::Domain("example.com".to_string(), 80)
            .encode()
            .unwrap();
        let header_len = encoded.len();
        encoded.extend_from_slice(b"GET / HTTP/1.1");

        let (parsed, consumed) = TargetAddr::parse(&encoded).unwrap();
        assert_eq!(consumed, header_len);
        assert_eq!(parsed.host(), "example.com");
    }

    #[test]
    fn test_parse_rejects_truncated_and_unknown() {
        assert!(TargetAddr::parse(&[]).is_err());
        assert!(TargetAddr::parse(&[0x01, 1, 2]).is_err());
        assert!(TargetAddr::parse(&[0x7f, 0, 0]).is_err());
    }
}
