use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Ip46Address stores either address family in a single `[u8; 16]`
/// block, so that flow keys stay fixed-size and compare byte-for-byte.
///
/// IPv4 addresses occupy the last four bytes with the first twelve
/// zeroed. The all-zero value is the unspecified address.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ip46Address(pub [u8; 16]);

impl Ip46Address {
    /// Converts a Rust `IpAddr` type into an `Ip46Address`.
    ///
    /// # Arguments
    ///
    /// * `ip` - the IP Address to convert.
    pub fn from_ip(ip: IpAddr) -> Self {
        let mut result = Self::default();
        match ip {
            IpAddr::V4(ip) => result.0[12..].copy_from_slice(&ip.octets()),
            IpAddr::V6(ip) => result.0.copy_from_slice(&ip.octets()),
        }
        result
    }

    /// Is this an IPv4 address?
    pub fn is_v4(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0) && self.0[12..].iter().any(|b| *b != 0)
    }

    /// Is this the unspecified (all zero) address?
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Converts an `Ip46Address` type to a Rust `IpAddr` type
    pub fn as_ip(&self) -> IpAddr {
        if self.is_v4() {
            IpAddr::V4(Ipv4Addr::new(self.0[12], self.0[13], self.0[14], self.0[15]))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.0))
        }
    }

    /// The 16 octets to put on the wire in an IPv6-typed field.
    /// IPv4 addresses are written IPv4-mapped (`::ffff:a.b.c.d`).
    pub fn ipv6_octets(&self) -> [u8; 16] {
        match self.as_ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
            IpAddr::V6(ip) => ip.octets(),
        }
    }
}

impl From<IpAddr> for Ip46Address {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

impl From<Ipv6Addr> for Ip46Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip.octets())
    }
}

impl From<Ip46Address> for IpAddr {
    fn from(ip: Ip46Address) -> Self {
        ip.as_ip()
    }
}

impl fmt::Display for Ip46Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ip())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unspecified_is_neither_family() {
        let unspecified = Ip46Address::default();
        assert!(unspecified.is_zero());
        assert!(!unspecified.is_v4());
    }

    #[test]
    fn ipv4_sits_in_the_low_octets() {
        let ip = Ip46Address::from_ip("192.0.2.7".parse().unwrap());
        assert_eq!(ip.0, [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 192, 0, 2, 7]);
        assert!(ip.is_v4());
        assert_eq!(ip.as_ip(), "192.0.2.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn ipv6_keeps_its_text_form() {
        let sid: Ipv6Addr = "fc00:0:1:e000::".parse().unwrap();
        let ip = Ip46Address::from(sid);
        assert!(!ip.is_v4());
        assert_eq!(IpAddr::from(ip), IpAddr::V6(sid));
        assert_eq!(ip.to_string(), "fc00:0:1:e000::");
    }

    #[test]
    fn ipv4_goes_on_the_wire_mapped() {
        let ip = Ip46Address::from_ip("10.0.0.1".parse().unwrap());
        let wire = ip.ipv6_octets();
        assert_eq!(&wire[..10], &[0; 10]);
        assert_eq!(&wire[10..12], &[0xff, 0xff]);
        assert_eq!(&wire[12..], &[10, 0, 0, 1]);
    }
}
