//! Read-side views over the directory: per-address status tiers and the
//! helpers the UI and notification layers consume.

use serde::Serialize;
use shared::types::{AddressRecord, Service};

/// How usable an address is, derived from its probe flags on every read
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressStatus {
    Unreachable,
    Reachable,
    Connectable,
}

impl AddressStatus {
    pub fn of(record: &AddressRecord) -> Self {
        let ok = record.ok == Some(true);
        let server_ok = record.server_ok == Some(true);

        if ok && server_ok {
            AddressStatus::Connectable
        } else if server_ok || record.advertising {
            AddressStatus::Reachable
        } else {
            AddressStatus::Unreachable
        }
    }
}

/// The address the UI should show for `service`: best status tier first,
/// most recently updated within a tier.
pub fn representative(service: &Service) -> Option<&AddressRecord> {
    service
        .addresses
        .iter()
        .max_by_key(|r| (AddressStatus::of(r), r.updated_at))
}

/// IPs of every connectable address across `services`, for consumers that
/// open one connection per healthy robot.
pub fn healthy_addresses(services: &[Service]) -> Vec<String> {
    let mut ips: Vec<String> = Vec::new();
    for record in services.iter().flat_map(|s| &s.addresses) {
        if AddressStatus::of(record) != AddressStatus::Connectable {
            continue;
        }
        if let Some(ip) = &record.ip {
            if !ips.contains(ip) {
                ips.push(ip.clone());
            }
        }
    }
    ips
}
