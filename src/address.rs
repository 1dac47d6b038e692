use crate::error::{Error, Result};
use crate::protocol::AddressType;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::{io::AsyncReadExt, net::TcpStream};

/// Address represents a network address or domain to be used as the
/// SOCKS5 target address
#[derive(Debug, Clone)]
pub enum Address {
    IPv4(Ipv4Addr),
    DomainName(String),
    IPv6(Ipv6Addr),
}

/// TargetAddr represents a destination address and port as carried
/// in command requests and UDP datagram headers
#[derive(Debug, Clone)]
pub struct TargetAddr {
    pub addr: Address,
    pub port: u16,
}

impl TargetAddr {
    /// read_body parses the network address from an incoming client
    /// request on the stream, after the ATYP byte has been consumed:
    /// IPv4, IPv6, or domain name, then the port in network order
    pub async fn read_body(stream: &mut TcpStream, addr_type: AddressType) -> Result<Self> {
        // Match type and extract address or domain name
        let addr = match addr_type {
            AddressType::IPv4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                Address::IPv4(Ipv4Addr::from(addr))
            }
            AddressType::DomainName => {
                // First octet in DomainName contains the number of
                // octets to follow
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                check_domain_len(len[0] as usize)?;

                // Read domain and convert to string
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let domain_str = String::from_utf8(domain)
                    .map_err(|e| Error::Protocol(format!("invalid domain: {e}")))?;
                Address::DomainName(domain_str)
            }
            AddressType::IPv6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                Address::IPv6(Ipv6Addr::from(addr))
            }
        };

        // Read port -> BigEndian (network order)
        let mut port_buf = [0u8; 2];
        stream.read_exact(&mut port_buf).await?;
        let port = u16::from_be_bytes(port_buf);

        Ok(TargetAddr { addr, port })
    }

    /// decode parses a target address from a byte slice starting at the
    /// ATYP byte (UDP datagram headers) and returns the address together
    /// with the number of bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(Error::Protocol("no address type byte".into()));
        }

        let addr_type = AddressType::from_byte(data[0])
            .ok_or_else(|| Error::Protocol(format!("unknown address type: {}", data[0])))?;

        // Offset starts after ATYP
        let mut offset = 1;

        let addr = match addr_type {
            AddressType::IPv4 => {
                // IPv4 address + port -> 6 bytes
                if offset + 6 > data.len() {
                    return Err(Error::Protocol(
                        "not enough data for IPv4 address and port".into(),
                    ));
                }
                let ip_bytes: [u8; 4] = data[offset..offset + 4]
                    .try_into()
                    .map_err(|_| Error::Protocol("invalid IPv4 bytes".into()))?;
                offset += 4;
                Address::IPv4(Ipv4Addr::from(ip_bytes))
            }
            AddressType::IPv6 => {
                // IPv6 address + port -> 18 bytes
                if offset + 18 > data.len() {
                    return Err(Error::Protocol(
                        "not enough data for IPv6 address and port".into(),
                    ));
                }
                let ip_bytes: [u8; 16] = data[offset..offset + 16]
                    .try_into()
                    .map_err(|_| Error::Protocol("invalid IPv6 bytes".into()))?;
                offset += 16;
                Address::IPv6(Ipv6Addr::from(ip_bytes))
            }
            AddressType::DomainName => {
                if offset + 1 > data.len() {
                    return Err(Error::Protocol("not enough data to read domain length".into()));
                }

                // First byte of domain contains number of octets
                let domain_len = data[offset] as usize;
                check_domain_len(domain_len)?;
                offset += 1;

                if offset + domain_len + 2 > data.len() {
                    return Err(Error::Protocol("not enough data for domain and port".into()));
                }

                let domain_str = String::from_utf8(data[offset..offset + domain_len].to_vec())
                    .map_err(|e| Error::Protocol(format!("invalid domain: {e}")))?;
                offset += domain_len;
                Address::DomainName(domain_str)
            }
        };

        // Port -> BigEndian (network order)
        let port = u16::from_be_bytes([data[offset], data[offset + 1]]);
        offset += 2;

        Ok((TargetAddr { addr, port }, offset))
    }

    /// socket_addr returns the destination as a SocketAddr when no DNS
    /// resolution is required
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.addr {
            Address::IPv4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Address::IPv6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            Address::DomainName(_) => None,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Address::IPv4(ip) => write!(f, "{ip}:{}", self.port),
            Address::DomainName(domain) => write!(f, "{domain}:{}", self.port),
            Address::IPv6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

/// check_domain_len validates a length-prefixed domain name length
fn check_domain_len(len: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::Protocol("domain length cannot be 0".into()));
    }
    if len > 253 {
        return Err(Error::Protocol(format!(
            "domain name too long: {len} (max 253 bytes)"
        )));
    }
    Ok(())
}

/// encode_socket_addr appends ATYP, address octets, and the port in
/// network order; used by command replies and UDP datagram headers
pub fn encode_socket_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.push(AddressType::IPv4 as u8);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            buf.push(AddressType::IPv6 as u8);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ipv4() {
        let data = [0x01, 127, 0, 0, 1, 0x00, 0x50];
        let (target, consumed) = TargetAddr::decode(&data).unwrap();
        assert_eq!(consumed, 7);
        assert_eq!(target.port, 80);
        assert_eq!(
            target.socket_addr(),
            Some("127.0.0.1:80".parse().unwrap())
        );
    }

    #[test]
    fn decode_ipv6() {
        let mut data = vec![0x04];
        data.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        data.extend_from_slice(&443u16.to_be_bytes());
        let (target, consumed) = TargetAddr::decode(&data).unwrap();
        assert_eq!(consumed, 19);
        assert_eq!(target.socket_addr(), Some("[::1]:443".parse().unwrap()));
    }

    #[test]
    fn decode_domain() {
        let mut data = vec![0x03, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&80u16.to_be_bytes());
        let (target, consumed) = TargetAddr::decode(&data).unwrap();
        assert_eq!(consumed, 1 + 1 + 11 + 2);
        assert_eq!(target.to_string(), "example.com:80");
        assert!(target.socket_addr().is_none());
    }

    #[test]
    fn decode_rejects_truncated_and_empty_domain() {
        // Truncated IPv4
        assert!(TargetAddr::decode(&[0x01, 127, 0, 0]).is_err());
        // Zero-length domain
        assert!(TargetAddr::decode(&[0x03, 0, 0x00, 0x50]).is_err());
        // Unknown ATYP
        assert!(TargetAddr::decode(&[0x02, 0, 0]).is_err());
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let mut buf = Vec::new();
        encode_socket_addr(&mut buf, "10.1.2.3:8080".parse().unwrap());
        let (target, _) = TargetAddr::decode(&buf).unwrap();
        assert_eq!(target.socket_addr(), Some("10.1.2.3:8080".parse().unwrap()));
    }
}
