use std::fmt;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::protocol::DEFAULT_PORT;

/// A reachable endpoint: host plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Address on the default robot port
    pub fn with_default_port(ip: impl Into<String>) -> Self {
        Self::new(ip, DEFAULT_PORT)
    }

    /// Whether this address is link-local (169.254.0.0/16 or fe80::/10),
    /// i.e. a direct USB/ethernet connection to the robot.
    pub fn is_link_local(&self) -> bool {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => v4.is_link_local(),
            Ok(IpAddr::V6(v6)) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            Err(_) => false,
        }
    }

    /// Base URL for HTTP requests; IPv6 literals are bracketed.
    pub fn base_url(&self) -> String {
        if self.ip.contains(':') {
            format!("http://[{}]:{}", self.ip, self.port)
        } else {
            format!("http://{}:{}", self.ip, self.port)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// Body of a health probe response. Only `name` drives discovery; every other
/// field is kept verbatim for display and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub name: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl HealthResponse {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: serde_json::Map::new(),
        }
    }
}

/// One address a service has been seen at, with the outcome of its probes.
///
/// `ok` / `server_ok` are `None` until the first probe lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    /// `None` once the address has been taken over by another service
    pub ip: Option<String>,
    pub port: u16,
    pub local: Option<bool>,
    pub advertising: bool,
    pub ok: Option<bool>,
    pub server_ok: Option<bool>,
    pub health: Option<HealthResponse>,
    pub server_health: Option<HealthResponse>,
    pub updated_at: DateTime<Utc>,
}

impl AddressRecord {
    /// Fresh, never-probed record for `address`
    pub fn new(address: &Address) -> Self {
        Self {
            ip: Some(address.ip.clone()),
            port: address.port,
            local: Some(address.is_link_local()),
            advertising: false,
            ok: None,
            server_ok: None,
            health: None,
            server_health: None,
            updated_at: Utc::now(),
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.ip.as_ref().map(|ip| Address::new(ip.clone(), self.port))
    }

    pub fn is_at(&self, address: &Address) -> bool {
        self.ip.as_deref() == Some(address.ip.as_str()) && self.port == address.port
    }

    /// Compares everything except `updated_at`
    pub fn same_state(&self, other: &AddressRecord) -> bool {
        self.ip == other.ip
            && self.port == other.port
            && self.local == other.local
            && self.advertising == other.advertising
            && self.ok == other.ok
            && self.server_ok == other.server_ok
            && self.health == other.health
            && self.server_health == other.server_health
    }
}

/// A logical robot, keyed by name, possibly reachable at several addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub addresses: Vec<AddressRecord>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: Vec::new(),
        }
    }

    pub fn record(&self, address: &Address) -> Option<&AddressRecord> {
        self.addresses.iter().find(|r| r.is_at(address))
    }

    pub fn record_mut(&mut self, address: &Address) -> Option<&mut AddressRecord> {
        self.addresses.iter_mut().find(|r| r.is_at(address))
    }

    pub fn owns(&self, address: &Address) -> bool {
        self.record(address).is_some()
    }

    /// Compares names and record state, ignoring timestamps
    pub fn same_state(&self, other: &Service) -> bool {
        self.name == other.name
            && self.addresses.len() == other.addresses.len()
            && self
                .addresses
                .iter()
                .zip(&other.addresses)
                .all(|(a, b)| a.same_state(b))
    }
}

/// An address suspected of hosting a robot, not yet confirmed by a probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub ip: String,
    pub port: u16,
}

impl Candidate {
    pub fn address(&self) -> Address {
        Address::new(self.ip.clone(), self.port)
    }
}

impl From<Address> for Candidate {
    fn from(address: Address) -> Self {
        Self {
            ip: address.ip,
            port: address.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_local_detection() {
        assert!(Address::with_default_port("169.254.12.34").is_link_local());
        assert!(Address::with_default_port("fe80::1").is_link_local());
        assert!(!Address::with_default_port("192.168.1.42").is_link_local());
        assert!(!Address::with_default_port("fd00::1").is_link_local());
        assert!(!Address::with_default_port("opentrons.local").is_link_local());
    }

    #[test]
    fn test_base_url_brackets_ipv6() {
        assert_eq!(
            Address::new("192.168.1.42", 31950).base_url(),
            "http://192.168.1.42:31950"
        );
        assert_eq!(Address::new("fe80::1", 31950).base_url(), "http://[fe80::1]:31950");
    }

    #[test]
    fn test_health_response_keeps_extra_fields() {
        let body = r#"{"name":"opentrons-dev","api_version":"3.2.0"}"#;
        let health: HealthResponse = serde_json::from_str(body).unwrap();
        assert_eq!(health.name, "opentrons-dev");
        assert_eq!(health.fields["api_version"], "3.2.0");
    }

    #[test]
    fn test_health_response_requires_name() {
        let body = r#"{"api_version":"3.2.0"}"#;
        assert!(serde_json::from_str::<HealthResponse>(body).is_err());
    }

    #[test]
    fn test_same_state_ignores_timestamp() {
        let address = Address::with_default_port("192.168.1.42");
        let a = AddressRecord::new(&address);
        let mut b = a.clone();
        b.updated_at = a.updated_at + chrono::Duration::seconds(5);
        assert!(a.same_state(&b));
        b.ok = Some(true);
        assert!(!a.same_state(&b));
    }
}
