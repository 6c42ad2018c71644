//! Registration payloads exchanged through the signaling endpoint.
//!
//! Both roles publish a JSON document into their room slot: the client a
//! [`ClientRegistration`] carrying its network info and requested mappings,
//! the server a [`ServerRegistration`] carrying its network info and the
//! ports it allocated for those mappings. Early versions of the protocol
//! published a bare `"public|private"` string before allocation finished;
//! that shape is still recognized and treated as "peer not ready yet".

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::config::PortMapping;
use crate::error::{Error, Result};

/// NAT classification by mapping behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    /// Direct internet connection, no translation.
    None,
    /// Any external source may reach the mapped port.
    FullCone,
    /// Source IP must match a prior outbound destination.
    RestrictedCone,
    /// Source IP and port must match a prior outbound destination.
    PortRestricted,
    /// Mapped port differs per destination.
    Symmetric,
    Unknown,
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NatType::None => "no NAT",
            NatType::FullCone => "full cone NAT",
            NatType::RestrictedCone => "restricted cone NAT",
            NatType::PortRestricted => "port restricted NAT",
            NatType::Symmetric => "symmetric NAT",
            NatType::Unknown => "unknown NAT",
        };
        write!(f, "{}", s)
    }
}

/// Network endpoints and NAT classification for one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Reflexive endpoint learned via STUN.
    pub public_addr: SocketAddr,
    /// Kernel-reported address of the outbound interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_addr: Option<IpAddr>,
    pub nat_type: NatType,
    pub can_hole_punch: bool,
    /// Local UDP port observed during the probe, which the hole-punch engine
    /// will try to rebind. Advisory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hole_punch_port: Option<u16>,
}

/// Client slot payload: network info plus the requested mapping set in
/// `"proto:local:remote"` string form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub network_info: NetworkInfo,
    pub mappings: Vec<String>,
}

/// One server-side allocation: the client's mapping and the ephemeral port
/// the server listens on for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAllocation {
    pub client_mapping: PortMapping,
    pub allocated_port: u16,
}

/// Server slot payload: network info plus all current allocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRegistration {
    pub network_info: NetworkInfo,
    pub port_mappings: Vec<ServerAllocation>,
}

/// Returns true if a payload is the legacy pipe-delimited bootstrap string
/// rather than a structured registration. Such payloads mean the peer has
/// not finished allocation yet.
pub fn is_legacy_payload(data: &str) -> bool {
    let trimmed = data.trim_start();
    trimmed.contains('|') && !trimmed.starts_with('{')
}

impl ClientRegistration {
    pub fn new(network_info: NetworkInfo, mappings: &[PortMapping]) -> Self {
        Self {
            network_info,
            mappings: mappings.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::signaling_with_source("failed to encode client registration", e))
    }

    pub fn decode(data: &str) -> Result<Self> {
        if is_legacy_payload(data) {
            return Err(Error::signaling(
                "client registration is in legacy format (peer not ready)",
            ));
        }
        serde_json::from_str(data)
            .map_err(|e| Error::signaling_with_source("failed to decode client registration", e))
    }

    /// Parse the mapping strings, logging and skipping malformed entries.
    pub fn parsed_mappings(&self) -> Vec<PortMapping> {
        self.mappings
            .iter()
            .filter_map(|s| match s.parse::<PortMapping>() {
                Ok(m) => Some(m),
                Err(e) => {
                    log::warn!("skipping malformed mapping '{}': {}", s, e);
                    None
                }
            })
            .collect()
    }
}

impl ServerRegistration {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::signaling_with_source("failed to encode server registration", e))
    }

    pub fn decode(data: &str) -> Result<Self> {
        if is_legacy_payload(data) {
            return Err(Error::signaling(
                "server registration is in legacy format (allocation not ready)",
            ));
        }
        serde_json::from_str(data)
            .map_err(|e| Error::signaling_with_source("failed to decode server registration", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_info() -> NetworkInfo {
        NetworkInfo {
            public_addr: "203.0.113.9:40001".parse().unwrap(),
            private_addr: Some("192.168.1.10".parse().unwrap()),
            nat_type: NatType::RestrictedCone,
            can_hole_punch: true,
            hole_punch_port: Some(40001),
        }
    }

    #[test]
    fn test_client_registration_roundtrip() {
        let mappings: Vec<PortMapping> = vec![
            "tcp:15001:22".parse().unwrap(),
            "udp:16000:7".parse().unwrap(),
        ];
        let reg = ClientRegistration::new(network_info(), &mappings);
        let encoded = reg.encode().expect("encode");
        let decoded = ClientRegistration::decode(&encoded).expect("decode");
        assert_eq!(decoded.mappings, vec!["tcp:15001:22", "udp:16000:7"]);
        assert_eq!(decoded.parsed_mappings(), mappings);
        assert_eq!(decoded.network_info.nat_type, NatType::RestrictedCone);
    }

    #[test]
    fn test_server_registration_roundtrip() {
        let reg = ServerRegistration {
            network_info: network_info(),
            port_mappings: vec![ServerAllocation {
                client_mapping: "tcp:15001:22".parse().unwrap(),
                allocated_port: 50123,
            }],
        };
        let encoded = reg.encode().expect("encode");
        assert!(encoded.contains("\"allocatedPort\":50123"));
        let decoded = ServerRegistration::decode(&encoded).expect("decode");
        assert_eq!(decoded.port_mappings[0].allocated_port, 50123);
        assert_eq!(
            decoded.port_mappings[0].client_mapping,
            "tcp:15001:22".parse().unwrap()
        );
    }

    #[test]
    fn test_legacy_payload_detection() {
        assert!(is_legacy_payload("203.0.113.9:40001|192.168.1.10:0"));
        assert!(!is_legacy_payload("{\"networkInfo\":{}}"));
        // A JSON body containing a pipe is still structured.
        assert!(!is_legacy_payload("{\"data\":\"a|b\"}"));
    }

    #[test]
    fn test_decode_rejects_legacy_payload() {
        let err = ServerRegistration::decode("203.0.113.9:40001|192.168.1.10:0")
            .expect_err("legacy payload");
        assert!(err.to_string().contains("not ready"));
    }

    #[test]
    fn test_malformed_mappings_are_skipped() {
        let reg = ClientRegistration {
            network_info: network_info(),
            mappings: vec![
                "tcp:15001:22".to_string(),
                "bogus".to_string(),
                "udp:0:7".to_string(),
            ],
        };
        let parsed = reg.parsed_mappings();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], "tcp:15001:22".parse().unwrap());
    }

    #[test]
    fn test_network_info_omits_empty_optionals() {
        let info = NetworkInfo {
            public_addr: "203.0.113.9:40001".parse().unwrap(),
            private_addr: None,
            nat_type: NatType::Unknown,
            can_hole_punch: true,
            hole_punch_port: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("privateAddr"));
        assert!(!json.contains("holePunchPort"));
        assert!(json.contains("\"canHolePunch\":true"));
    }
}
