//! Multicast listener adapter: turns browser traffic into `(name, address)`
//! sightings for the discovery client.

pub mod browser;

use std::net::IpAddr;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::types::Address;

pub use browser::MdnsBrowser;

/// A robot advertisement as seen on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct MulticastRecord {
    pub name: String,
    pub addresses: Vec<String>,
    pub port: u16,
}

impl MulticastRecord {
    /// First IPv4 address, else first IPv6 address. Unparseable entries are
    /// skipped; `None` if nothing usable is left.
    pub fn preferred_address(&self) -> Option<Address> {
        let parsed: Vec<IpAddr> = self
            .addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();

        parsed
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| parsed.iter().find(|ip| ip.is_ipv6()))
            .map(|ip| Address::new(ip.to_string(), self.port))
    }
}

/// Everything a browser session can report
#[derive(Debug)]
pub enum BrowserEvent {
    /// The browser is up and able to send queries
    Ready,
    Update(MulticastRecord),
    /// The named robot withdrew its advertisement
    Removed(String),
    Error(anyhow::Error),
}

/// Source of multicast sightings. One session runs per `start` call, until
/// `cancel` fires.
pub trait MulticastBrowser: Send + 'static {
    fn start(&mut self, tx: mpsc::Sender<BrowserEvent>, cancel: CancellationToken) -> Result<()>;

    /// Ask the network for fresh announcements. Browsers that query on their
    /// own schedule can leave this as is.
    fn discover(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release whatever `start` acquired. The session task itself ends
    /// through its cancellation token.
    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(addresses: &[&str]) -> MulticastRecord {
        MulticastRecord {
            name: "opentrons-dev".to_string(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            port: 31950,
        }
    }

    #[test]
    fn test_prefers_ipv4() {
        let r = record(&["fe80::1", "192.168.1.42", "10.0.0.1"]);
        assert_eq!(r.preferred_address(), Some(Address::new("192.168.1.42", 31950)));
    }

    #[test]
    fn test_falls_back_to_ipv6() {
        let r = record(&["not-an-ip", "fd00::2"]);
        assert_eq!(r.preferred_address(), Some(Address::new("fd00::2", 31950)));
    }

    #[test]
    fn test_no_usable_address() {
        assert_eq!(record(&[]).preferred_address(), None);
        assert_eq!(record(&["garbage"]).preferred_address(), None);
    }
}
