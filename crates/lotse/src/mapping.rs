//! Port mapping data model.
//!
//! A [`PortMapping`] describes one host-to-container forwarding rule. The
//! full set submitted for a container, together with its network, forms a
//! [`MappingRecord`] — the unit of persistence.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use lotse_common::{ContainerId, LotseError, LotseResult};
use serde::{Deserialize, Serialize};

/// Protocol for a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Get the protocol string as used by iptables.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = LotseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(LotseError::InvalidProtocol {
                value: s.to_string(),
            }),
        }
    }
}

/// One host-to-container port forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address the forward listens on.
    pub host_address: IpAddr,
    /// Port number on the host.
    pub host_port: u16,
    /// Port number inside the container.
    pub container_port: u16,
    /// Protocol of the mapping.
    pub protocol: Protocol,
}

impl PortMapping {
    /// Create a new TCP port mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if `host_address` is not a valid IP address.
    pub fn tcp(host_address: &str, host_port: u16, container_port: u16) -> LotseResult<Self> {
        Ok(Self {
            host_address: parse_host_address(host_address)?,
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        })
    }

    /// Create a new UDP port mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if `host_address` is not a valid IP address.
    pub fn udp(host_address: &str, host_port: u16, container_port: u16) -> LotseResult<Self> {
        Ok(Self {
            host_address: parse_host_address(host_address)?,
            host_port,
            container_port,
            protocol: Protocol::Udp,
        })
    }

    /// The reservation key of this mapping.
    #[must_use]
    pub fn key(&self) -> PortKey {
        PortKey {
            address: self.host_address,
            port: self.host_port,
            protocol: self.protocol,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}/{}",
            self.host_address, self.host_port, self.container_port, self.protocol
        )
    }
}

/// Parse a host address string into an [`IpAddr`].
///
/// # Errors
///
/// Returns [`LotseError::InvalidAddress`] if the text is not an IP address.
pub fn parse_host_address(value: &str) -> LotseResult<IpAddr> {
    value.parse().map_err(|_| LotseError::InvalidAddress {
        value: value.to_string(),
    })
}

/// The tuple a mapping claims on the host: address, port, and protocol.
///
/// Two records may never claim the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortKey {
    /// Host address.
    pub address: IpAddr,
    /// Host port.
    pub port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.address, self.port, self.protocol)
    }
}

/// The persisted association between a container and its port mappings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    /// Container ID owning the mappings.
    pub id: ContainerId,
    /// Network the container is attached to.
    pub network: String,
    /// Ordered mapping set as submitted by the caller.
    pub mappings: Vec<PortMapping>,
}

impl MappingRecord {
    /// Create a new record.
    #[must_use]
    pub fn new(id: ContainerId, network: impl Into<String>, mappings: Vec<PortMapping>) -> Self {
        Self {
            id,
            network: network.into(),
            mappings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parsing() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
        assert!("".parse::<Protocol>().is_err());
    }

    #[test]
    fn protocol_display() {
        assert_eq!(format!("{}", Protocol::Tcp), "tcp");
        assert_eq!(format!("{}", Protocol::Udp), "udp");
    }

    #[test]
    fn mapping_construction() {
        let mapping = PortMapping::tcp("0.0.0.0", 8080, 80).unwrap();
        assert_eq!(mapping.host_port, 8080);
        assert_eq!(mapping.container_port, 80);
        assert_eq!(mapping.protocol, Protocol::Tcp);
        assert_eq!(mapping.to_string(), "0.0.0.0:8080->80/tcp");
    }

    #[test]
    fn mapping_rejects_bad_address() {
        assert!(PortMapping::tcp("not-an-address", 8080, 80).is_err());
        assert!(PortMapping::udp("0.0.0.0:53", 53, 53).is_err());
    }

    #[test]
    fn keys_differ_by_protocol() {
        let tcp = PortMapping::tcp("127.0.0.1", 8080, 80).unwrap();
        let udp = PortMapping::udp("127.0.0.1", 8080, 80).unwrap();
        assert_ne!(tcp.key(), udp.key());
    }

    #[test]
    fn record_serde_round_trip() {
        let record = MappingRecord::new(
            ContainerId::new("c1").unwrap(),
            "bridge0",
            vec![
                PortMapping::tcp("0.0.0.0", 8080, 80).unwrap(),
                PortMapping::udp("::", 5353, 53).unwrap(),
            ],
        );
        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: MappingRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
