//! IPv4 socket address wrapper. The server's config schema and logging
//! only ever need dotted-quad + port, so this doesn't bother with IPv6.

use std::fmt;

#[derive(Debug, Clone, Copy)]
pub struct InetAddress {
    addr: libc::sockaddr_in,
}

impl InetAddress {
    pub fn new(ip: &str, port: u16) -> Result<Self, std::net::AddrParseError> {
        let parsed: std::net::Ipv4Addr = ip.parse()?;
        let octets = parsed.octets();
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from_ne_bytes(octets);
        Ok(InetAddress { addr })
    }

    pub(crate) fn from_sockaddr(addr: &libc::sockaddr_in) -> Self {
        InetAddress { addr: *addr }
    }

    pub(crate) fn as_sockaddr(&self) -> (libc::sockaddr_in, libc::socklen_t) {
        (self.addr, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
    }

    pub fn to_ip(&self) -> String {
        let octets = self.addr.sin_addr.s_addr.to_ne_bytes();
        format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin_port)
    }

    pub fn to_ip_port(&self) -> String {
        format!("{}:{}", self.to_ip(), self.port())
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_port())
    }
}
