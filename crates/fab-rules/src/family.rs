//! Address families and the names derived from them.

use std::fmt;

/// Chain accepting IKE and ESP/AH traffic.
pub const CHAIN_INPUT: &str = "FABEDGE-INPUT";

/// Chain accepting forwarded overlay traffic.
pub const CHAIN_FORWARD: &str = "FABEDGE-FORWARD";

/// NAT chain masquerading traffic that leaves the overlay.
pub const CHAIN_NAT_OUTGOING: &str = "FABEDGE-NAT-OUTGOING";

/// IP address family of a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    /// IPv4, managed with `iptables`.
    V4,
    /// IPv6, managed with `ip6tables`.
    V6,
}

impl IpFamily {
    /// Classifies a CIDR or address; anything with a colon is IPv6.
    #[must_use]
    pub fn of_cidr(cidr: &str) -> Self {
        if cidr.contains(':') { Self::V6 } else { Self::V4 }
    }

    /// Firewall tool for this family.
    #[must_use]
    pub fn iptables_program(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }

    /// `family` argument of `ipset create`.
    #[must_use]
    pub fn ipset_family(self) -> &'static str {
        match self {
            Self::V4 => "inet",
            Self::V6 => "inet6",
        }
    }

    /// Name of the set holding peer CIDRs.
    #[must_use]
    pub fn peer_set_name(self) -> &'static str {
        match self {
            Self::V4 => "FABEDGE-PEER-CIDR",
            Self::V6 => "FABEDGE-PEER-CIDR6",
        }
    }

    /// Keeps only the CIDRs of this family.
    pub fn filter<'a, I>(self, cidrs: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        cidrs
            .into_iter()
            .filter(|c| Self::of_cidr(c) == self)
            .cloned()
            .collect()
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("10.1.0.0/24", IpFamily::V4 ; "ipv4 cidr")]
    #[test_case("192.168.1.1", IpFamily::V4 ; "ipv4 address")]
    #[test_case("fd00::/64", IpFamily::V6 ; "ipv6 cidr")]
    #[test_case("::1", IpFamily::V6 ; "ipv6 loopback")]
    fn test_of_cidr(cidr: &str, expected: IpFamily) {
        assert_eq!(IpFamily::of_cidr(cidr), expected);
    }

    #[test]
    fn test_names_per_family() {
        assert_eq!(IpFamily::V4.peer_set_name(), "FABEDGE-PEER-CIDR");
        assert_eq!(IpFamily::V6.peer_set_name(), "FABEDGE-PEER-CIDR6");
        assert_eq!(IpFamily::V6.iptables_program(), "ip6tables");
        assert_eq!(IpFamily::V6.ipset_family(), "inet6");
    }

    #[test]
    fn test_filter() {
        let cidrs = vec!["10.1.0.0/24".to_string(), "fd00::/64".to_string()];
        assert_eq!(IpFamily::V6.filter(&cidrs), vec!["fd00::/64".to_string()]);
    }
}
