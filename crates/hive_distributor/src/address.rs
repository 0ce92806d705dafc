//! Wire form of a peer address: `[u32 len][raw IP bytes][u32 port]`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::error::AddressError;

/// Number of bytes [`write_address`] emits for `addr`.
pub fn encoded_len(addr: &SocketAddr) -> usize {
    let ip_len = match addr.ip() {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    };
    4 + ip_len + 4
}

pub fn write_address<B: BufMut>(dst: &mut B, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            dst.put_u32(4);
            dst.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            dst.put_u32(16);
            dst.put_slice(&ip.octets());
        }
    }
    dst.put_u32(u32::from(addr.port()));
}

/// Read an address written by [`write_address`]. Any IP length other than
/// 4 or 16 is rejected.
pub fn read_address<B: Buf>(src: &mut B) -> Result<SocketAddr, AddressError> {
    need(src, 4)?;
    let ip = match src.get_u32() {
        4 => {
            need(src, 4)?;
            let mut octets = [0u8; 4];
            src.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            need(src, 16)?;
            let mut octets = [0u8; 16];
            src.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(AddressError::Length(other)),
    };

    need(src, 4)?;
    let port = src.get_u32();
    let port = u16::try_from(port).map_err(|_| AddressError::Port(port))?;
    Ok(SocketAddr::new(ip, port))
}

fn need<B: Buf>(src: &B, n: usize) -> Result<(), AddressError> {
    if src.remaining() < n {
        Err(AddressError::Truncated)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_ipv4_layout() {
        let addr: SocketAddr = "10.1.2.3:1907".parse().unwrap();
        let mut buf = BytesMut::new();
        write_address(&mut buf, &addr);

        assert_eq!(buf.len(), encoded_len(&addr));
        assert_eq!(&buf[..], &[0, 0, 0, 4, 10, 1, 2, 3, 0, 0, 0x07, 0x73]);
        assert_eq!(read_address(&mut buf.freeze()).unwrap(), addr);
    }

    #[test]
    fn test_ipv6_address() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let mut buf = BytesMut::new();
        write_address(&mut buf, &addr);
        assert_eq!(buf.len(), 24);
        assert_eq!(read_address(&mut buf.freeze()).unwrap(), addr);
    }

    #[test]
    fn test_rejects_unknown_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(6);
        buf.put_slice(&[1, 2, 3, 4, 5, 6]);
        buf.put_u32(80);
        assert_eq!(
            read_address(&mut buf.freeze()).unwrap_err(),
            AddressError::Length(6)
        );
    }

    #[test]
    fn test_rejects_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_slice(&[127, 0]);
        assert_eq!(
            read_address(&mut buf.freeze()).unwrap_err(),
            AddressError::Truncated
        );
    }

    #[test]
    fn test_rejects_port_out_of_range() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_slice(&[127, 0, 0, 1]);
        buf.put_u32(70_000);
        assert_eq!(
            read_address(&mut buf.freeze()).unwrap_err(),
            AddressError::Port(70_000)
        );
    }
}
