// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Multicast group descriptors.
//!
//! Every data stream in the instrument points at an address of the form
//! `A.B.C.D+N:port`, meaning `N + 1` consecutive IPs starting at
//! `A.B.C.D`, all on the same port. One IP per producing engine.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// An IP+range:port stream destination (or source).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAddress {
    base: Ipv4Addr,
    range: u32,
    port: u16,
}

impl StreamAddress {
    /// Build an address from parts. `range` is the number of consecutive
    /// IPs, so it must be at least 1.
    pub fn new(base: Ipv4Addr, range: u32, port: u16) -> Result<Self> {
        if range < 1 {
            return Err(Error::BadAddress {
                given: format!("{base}:{port}"),
                reason: "range must be at least 1".into(),
            });
        }
        let addr = StreamAddress { base, range, port };
        addr.check_overflow()?;
        Ok(addr)
    }

    /// Parse `A.B.C.D[+N]:PORT`. `+N` is optional and denotes `N + 1`
    /// consecutive group IPs.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = |reason: &str| Error::BadAddress {
            given: s.to_string(),
            reason: reason.into(),
        };

        let (ip_part, port_part) = s
            .rsplit_once(':')
            .ok_or_else(|| bad("expected A.B.C.D+N:port"))?;
        let port: u16 = port_part
            .parse()
            .map_err(|_| bad("port is not a number in 1..=65535"))?;
        if port == 0 {
            return Err(bad("port must be non-zero"));
        }

        let (base_part, plus) = match ip_part.split_once('+') {
            Some((b, n)) => {
                let n: u32 = n.parse().map_err(|_| bad("range is not a number"))?;
                if n == u32::MAX {
                    return Err(Error::AddressOverflow(s.to_string()));
                }
                (b, n)
            }
            None => (ip_part, 0),
        };

        let octets: Vec<&str> = base_part.split('.').collect();
        if octets.len() != 4 {
            return Err(bad("expected four dotted octets"));
        }
        let mut parsed = [0u8; 4];
        for (i, octet) in octets.iter().enumerate() {
            parsed[i] = octet
                .parse()
                .map_err(|_| bad("octet is not a number in 0..=255"))?;
        }

        let addr = StreamAddress {
            base: Ipv4Addr::from(parsed),
            range: plus + 1,
            port,
        };
        addr.check_overflow()?;
        Ok(addr)
    }

    fn check_overflow(&self) -> Result<()> {
        let base = u32::from(self.base);
        if base.checked_add(self.range - 1).is_none() {
            return Err(Error::AddressOverflow(self.to_string()));
        }
        Ok(())
    }

    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    pub fn range(&self) -> u32 {
        self.range
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Widen (or narrow) the group to cover `range` consecutive IPs.
    pub fn with_range(&self, range: u32) -> Result<Self> {
        StreamAddress::new(self.base, range, self.port)
    }

    /// `true` when the base lands in the IPv4 multicast block.
    pub fn is_multicast(&self) -> bool {
        (224..=239).contains(&self.base.octets()[0])
    }

    /// The consecutive group IPs covered by this address.
    pub fn enumerate(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let base = u32::from(self.base);
        (0..self.range).map(move |i| Ipv4Addr::from(base + i))
    }
}

impl fmt::Display for StreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.range > 1 {
            write!(f, "{}+{}:{}", self.base, self.range - 1, self.port)
        } else {
            write!(f, "{}:{}", self.base, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_range() {
        let a = StreamAddress::parse("239.2.0.64+7:7148").expect("parse");
        assert_eq!(a.base(), Ipv4Addr::new(239, 2, 0, 64));
        assert_eq!(a.range(), 8);
        assert_eq!(a.port(), 7148);
    }

    #[test]
    fn test_parse_without_range() {
        let a = StreamAddress::parse("10.100.0.10:7148").expect("parse");
        assert_eq!(a.range(), 1);
        assert!(!a.is_multicast());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for s in [
            "239.2.0.64",
            "239.2.0:7148",
            "239.2.0.64.1:7148",
            "239.2.0.256:7148",
            "239.2.0.64+x:7148",
            "239.2.0.64:0",
            "239.2.0.64:66000",
            "not-an-address",
        ] {
            let err = StreamAddress::parse(s).unwrap_err();
            assert_eq!(err.kind_token(), "bad_address", "for input {s}");
        }
    }

    #[test]
    fn test_round_trip() {
        for s in ["239.2.0.64+7:7148", "239.9.3.1:7148", "1.2.3.4+50:7777"] {
            let a = StreamAddress::parse(s).expect("parse");
            assert_eq!(StreamAddress::parse(&a.to_string()).expect("reparse"), a);
            assert_eq!(a.to_string(), s);
        }
    }

    #[test]
    fn test_multicast_block() {
        assert!(StreamAddress::parse("224.0.0.1:7000").unwrap().is_multicast());
        assert!(StreamAddress::parse("239.255.255.255:7000")
            .unwrap()
            .is_multicast());
        assert!(!StreamAddress::parse("223.0.0.1:7000").unwrap().is_multicast());
        assert!(!StreamAddress::parse("240.0.0.1:7000").unwrap().is_multicast());
    }

    #[test]
    fn test_enumerate() {
        let a = StreamAddress::parse("239.0.0.254+3:7000").expect("parse");
        let ips: Vec<_> = a.enumerate().collect();
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(239, 0, 0, 254),
                Ipv4Addr::new(239, 0, 0, 255),
                Ipv4Addr::new(239, 0, 1, 0),
                Ipv4Addr::new(239, 0, 1, 1),
            ]
        );
    }

    #[test]
    fn test_enumerate_overflow() {
        let err = StreamAddress::parse("255.255.255.255+1:7000").unwrap_err();
        assert_eq!(err.kind_token(), "address_overflow");
    }

    #[test]
    fn test_with_range() {
        let a = StreamAddress::parse("239.9.3.1:7148").expect("parse");
        let widened = a.with_range(16).expect("widen");
        assert_eq!(widened.range(), 16);
        assert_eq!(widened.to_string(), "239.9.3.1+15:7148");
    }
}
