use std::time::Duration;
use serde::Deserialize;
use shared::protocol::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_PROBE_TIMEOUT_MS};
use shared::types::{Candidate, Service};
use crate::candidates::Filters;

/// Construction options for a discovery client. Persisted `services` and
/// `candidates` seed the directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryOptions {
    pub services: Vec<Service>,
    pub candidates: Vec<Candidate>,
    pub poll_interval_ms: Option<u64>,
    pub name_filter: Vec<String>,
    pub ip_filter: Vec<String>,
    pub port_filter: Vec<u16>,
}

impl DiscoveryOptions {
    pub fn poll_interval(&self) -> Duration {
        poll_interval_or_default(self.poll_interval_ms.unwrap_or(0))
    }

    pub fn filters(&self) -> Filters {
        Filters {
            name: self.name_filter.clone(),
            ip: self.ip_filter.clone(),
            port: self.port_filter.clone(),
        }
    }
}

/// Zero means "use the default"
pub fn poll_interval_or_default(ms: u64) -> Duration {
    if ms == 0 {
        Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
    } else {
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeOptions {
    pub probe_timeout_ms: u64,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl ProbeOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
