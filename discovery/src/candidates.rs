use serde::Deserialize;
use shared::types::{Address, Candidate};

/// Filters applied to records coming off the multicast browser.
///
/// An empty list means "no filter". A record must match at least one entry
/// of every non-empty list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Filters {
    /// Case-insensitive substring match on the advertised name
    pub name: Vec<String>,
    /// Substring match on the ip
    pub ip: Vec<String>,
    /// Exact match on the port
    pub port: Vec<u16>,
}

impl Filters {
    pub fn passes(&self, name: &str, address: &Address) -> bool {
        let name = name.to_lowercase();
        let name_ok = self.name.is_empty()
            || self.name.iter().any(|f| name.contains(&f.to_lowercase()));
        let ip_ok = self.ip.is_empty() || self.ip.iter().any(|f| address.ip.contains(f.as_str()));
        let port_ok = self.port.is_empty() || self.port.contains(&address.port);

        name_ok && ip_ok && port_ok
    }
}

struct Entry {
    candidate: Candidate,
    advertised: bool,
}

/// Addresses that might host a robot but have not answered a probe yet.
#[derive(Default)]
pub struct CandidateSet {
    entries: Vec<Entry>,
}

impl CandidateSet {
    pub fn new(seed: Vec<Candidate>) -> Self {
        let mut set = Self::default();
        for candidate in seed {
            set.insert(candidate.address(), false);
        }
        set
    }

    /// Insert unless already present. Returns true if the set grew.
    pub fn insert(&mut self, address: Address, advertised: bool) -> bool {
        if let Some(entry) = self.entry_mut(&address) {
            entry.advertised |= advertised;
            return false;
        }
        self.entries.push(Entry {
            candidate: Candidate::from(address),
            advertised,
        });
        true
    }

    /// Remove the candidate at `address`, returning whether it had been
    /// seen on multicast.
    pub fn take(&mut self, address: &Address) -> Option<bool> {
        let idx = self.entries.iter().position(|e| is_at(&e.candidate, address))?;
        Some(self.entries.remove(idx).advertised)
    }

    /// Drop every candidate whose address is in `addresses`
    pub fn remove_all(&mut self, addresses: &[Address]) -> Vec<Candidate> {
        let (removed, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| addresses.iter().any(|a| is_at(&e.candidate, a)));
        self.entries = kept;
        removed.into_iter().map(|e| e.candidate).collect()
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.entries.iter().map(|e| e.candidate.address())
    }

    pub fn snapshot(&self) -> Vec<Candidate> {
        self.entries.iter().map(|e| e.candidate.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, address: &Address) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| is_at(&e.candidate, address))
    }
}

fn is_at(candidate: &Candidate, address: &Address) -> bool {
    candidate.ip == address.ip && candidate.port == address.port
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str) -> Address {
        Address::with_default_port(ip)
    }

    #[test]
    fn test_insert_dedups_by_ip_and_port() {
        let mut set = CandidateSet::default();
        assert!(set.insert(addr("192.168.1.42"), false));
        assert!(!set.insert(addr("192.168.1.42"), false));
        assert!(set.insert(Address::new("192.168.1.42", 8080), false));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_take_reports_advertised_flag() {
        let mut set = CandidateSet::default();
        set.insert(addr("10.0.0.1"), false);
        set.insert(addr("10.0.0.1"), true);
        set.insert(addr("10.0.0.2"), false);

        assert_eq!(set.take(&addr("10.0.0.1")), Some(true));
        assert_eq!(set.take(&addr("10.0.0.2")), Some(false));
        assert_eq!(set.take(&addr("10.0.0.3")), None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_all() {
        let mut set = CandidateSet::new(vec![
            Candidate::from(addr("10.0.0.1")),
            Candidate::from(addr("10.0.0.2")),
        ]);
        let removed = set.remove_all(&[addr("10.0.0.2"), addr("10.0.0.9")]);
        assert_eq!(removed, vec![Candidate::from(addr("10.0.0.2"))]);
        assert_eq!(set.snapshot(), vec![Candidate::from(addr("10.0.0.1"))]);
    }

    #[test]
    fn test_name_filter_is_case_insensitive_substring() {
        let filters = Filters {
            name: vec!["OPENTRONS".to_string()],
            ..Default::default()
        };
        assert!(!filters.passes("apentrons", &addr("10.0.0.1")));
        assert!(filters.passes("Opentrons-2", &addr("10.0.0.1")));
    }

    #[test]
    fn test_every_configured_filter_must_match() {
        let filters = Filters {
            name: vec!["opentrons".to_string()],
            ip: vec!["192.168.".to_string(), "169.254".to_string()],
            port: vec![31950],
        };
        assert!(filters.passes("opentrons-dev", &addr("192.168.1.42")));
        assert!(filters.passes("opentrons-dev", &addr("169.254.1.2")));
        assert!(!filters.passes("opentrons-dev", &addr("10.0.0.1")));
        assert!(!filters.passes("opentrons-dev", &Address::new("192.168.1.42", 80)));
        assert!(!filters.passes("ot2", &addr("192.168.1.42")));
    }

    #[test]
    fn test_empty_filters_pass_everything() {
        assert!(Filters::default().passes("anything", &Address::new("1.2.3.4", 1)));
    }
}
