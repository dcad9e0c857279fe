//! Peer addresses as exchanged in `addr` and `version` messages

use bitflags::bitflags;
use bytes::BufMut;
use std::fmt;
use std::io::Read;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use super::encoding::{read_array, read_i64, read_u16, read_u32, read_u64, DecodeError};

/// Size of a full address entry in an `addr` message
pub const NETWORK_ADDRESS_SIZE: usize = 38;

bitflags! {
    /// Services advertised by a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Services: u64 {
        /// Full node relaying objects
        const NODE_NETWORK = 1;
        const NODE_SSL = 1 << 1;
        const NODE_POW = 1 << 2;
        const NODE_DANDELION = 1 << 3;
    }
}

/// A known peer: IPv6-mapped address, port, services, stream and last-seen time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub ip: [u8; 16],
    pub port: u16,
    pub services: Services,
    pub stream: u64,
    /// Unix time the node was last seen
    pub time: i64,
}

impl NetworkAddress {
    pub fn new(ip: IpAddr, port: u16, stream: u64, time: i64) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            ip,
            port,
            services: Services::NODE_NETWORK,
            stream,
            time,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, stream: u64, time: i64) -> Self {
        Self::new(addr.ip(), addr.port(), stream, time)
    }

    pub fn ip_addr(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }

    /// Full 38-byte form used in `addr`
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.time);
        buf.put_u32(self.stream as u32);
        buf.put_u64(self.services.bits());
        buf.put_slice(&self.ip);
        buf.put_u16(self.port);
    }

    pub fn read(r: &mut impl Read) -> Result<Self, DecodeError> {
        let time = read_i64(r)?;
        let stream = read_u32(r)? as u64;
        let services = Services::from_bits_retain(read_u64(r)?);
        let ip = read_array::<16>(r)?;
        let port = read_u16(r)?;
        Ok(Self {
            ip,
            port,
            services,
            stream,
            time,
        })
    }

    /// 26-byte form without time and stream, used inside `version`
    pub fn write_short(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.services.bits());
        buf.put_slice(&self.ip);
        buf.put_u16(self.port);
    }

    pub fn read_short(r: &mut impl Read) -> Result<Self, DecodeError> {
        let services = Services::from_bits_retain(read_u64(r)?);
        let ip = read_array::<16>(r)?;
        let port = read_u16(r)?;
        Ok(Self {
            ip,
            port,
            services,
            stream: 0,
            time: 0,
        })
    }

    /// Identity of the node independent of services and timestamp
    pub fn key(&self) -> ([u8; 16], u16, u64) {
        (self.ip, self.port, self.stream)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (stream {})", self.socket_addr(), self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ipv4_is_mapped() {
        let addr: SocketAddr = "192.168.1.10:8444".parse().unwrap();
        let network = NetworkAddress::from_socket_addr(addr, 1, 0);

        assert_eq!(&network.ip[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(network.socket_addr(), addr);
    }

    #[test]
    fn test_wire_layout() {
        let addr: SocketAddr = "10.0.0.1:8444".parse().unwrap();
        let network = NetworkAddress::from_socket_addr(addr, 1, 1_700_000_000);

        let mut buf = Vec::new();
        network.write(&mut buf);
        assert_eq!(buf.len(), NETWORK_ADDRESS_SIZE);
        assert_eq!(&buf[8..12], &[0, 0, 0, 1]);
        assert_eq!(NetworkAddress::read(&mut Cursor::new(buf)).unwrap(), network);
    }

    #[test]
    fn test_short_form_keeps_endpoint() {
        let addr: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        let network = NetworkAddress::from_socket_addr(addr, 1, 0);

        let mut buf = Vec::new();
        network.write_short(&mut buf);
        assert_eq!(buf.len(), 26);
        let parsed = NetworkAddress::read_short(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed.socket_addr(), addr);
    }
}
