use std::net::Ipv4Addr;

use ip_network::Ipv4Network;

use crate::PeerId;

/// The CIDR block an overlay network is carved out of.
///
/// A thin wrapper around `Ipv4Network` so that the allocator and the
/// wire types in this crate don't each have to restate the
/// network/broadcast-address exclusion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OverlayPrefix(Ipv4Network);

impl OverlayPrefix {
    pub fn new(network: Ipv4Addr, netmask: u8) -> Result<Self, ip_network::IpNetworkError> {
        Ok(Self(Ipv4Network::new(network, netmask)?))
    }

    pub fn network(&self) -> Ipv4Network {
        self.0
    }

    pub fn network_address(&self) -> Ipv4Addr {
        self.0.network_address()
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        self.0.broadcast_address()
    }

    pub fn netmask(&self) -> u8 {
        self.0.netmask()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.0.contains(addr)
    }

    /// All host addresses in the prefix excluding network and
    /// broadcast, in ascending order.
    pub fn host_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let network = self.network_address();
        let broadcast = self.broadcast_address();
        self.0
            .hosts()
            .filter(move |&a| a != network && a != broadcast)
    }
}

impl std::fmt::Display for OverlayPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.0.network_address(), self.0.netmask())
    }
}

impl TryFrom<String> for OverlayPrefix {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let net: Ipv4Network = s.parse().map_err(|_| format!("invalid CIDR prefix: {s}"))?;
        Ok(Self(net))
    }
}

impl From<OverlayPrefix> for String {
    fn from(prefix: OverlayPrefix) -> Self {
        prefix.to_string()
    }
}

impl std::str::FromStr for OverlayPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

/// Returned to a node on successful login: its assigned identity
/// within the overlay.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OverlayConfig {
    pub peer_id: PeerId,
    pub tunnel_ip: Ipv4Addr,
    pub prefix: OverlayPrefix,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_addresses_excludes_network_and_broadcast() {
        let prefix = OverlayPrefix::new(Ipv4Addr::new(100, 70, 0, 0), 24).unwrap();
        let hosts: Vec<_> = prefix.host_addresses().collect();
        assert_eq!(hosts.first(), Some(&Ipv4Addr::new(100, 70, 0, 1)));
        assert_eq!(hosts.last(), Some(&Ipv4Addr::new(100, 70, 0, 254)));
        assert_eq!(hosts.len(), 254);
    }

    #[test]
    fn display_round_trips_through_try_from() {
        let prefix = OverlayPrefix::new(Ipv4Addr::new(10, 10, 0, 0), 24).unwrap();
        let text = prefix.to_string();
        let parsed = OverlayPrefix::try_from(text).unwrap();
        assert_eq!(prefix, parsed);
    }
}
