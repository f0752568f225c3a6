use chrono::Utc;
use shared::types::{Address, AddressRecord, Candidate, HealthResponse, Service};
use crate::candidates::CandidateSet;

/// What a multicast sighting did to the tracked state
#[derive(Debug, PartialEq)]
pub enum MulticastOutcome {
    /// Address belongs to a service; carries the service if its
    /// `advertising` flag flipped.
    Advertising(Option<Service>),
    /// Address was unknown and is now a candidate
    NewCandidate,
    /// Address was already a candidate
    KnownCandidate,
}

/// Records and candidates dropped by [`Directory::remove`]
#[derive(Debug, Default)]
pub struct Removal {
    pub records: Vec<AddressRecord>,
    pub candidates: Vec<Candidate>,
}

/// The set of known robots. Every `ip:port` is owned by at most one service.
#[derive(Debug, Default)]
pub struct Directory {
    services: Vec<Service>,
}

impl Directory {
    /// Build from persisted services. Duplicate names and doubly-owned
    /// addresses are dropped (first one wins); nothing is advertising until
    /// the browser says so again.
    pub fn new(seed: Vec<Service>) -> Self {
        let mut directory = Self::default();
        for mut service in seed {
            if directory.get(&service.name).is_some() {
                tracing::warn!("Dropping duplicate persisted service {}", service.name);
                continue;
            }
            service
                .addresses
                .retain(|r| r.address().map_or(true, |a| directory.owner(&a).is_none()));
            for record in &mut service.addresses {
                record.advertising = false;
            }
            directory.services.push(service);
        }
        directory
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Name of the service currently owning `address`
    pub fn owner(&self, address: &Address) -> Option<&str> {
        self.services
            .iter()
            .find(|s| s.owns(address))
            .map(|s| s.name.as_str())
    }

    pub fn snapshot(&self) -> Vec<Service> {
        self.services.clone()
    }

    /// Apply one probe pair for `address`. Returns every service whose state
    /// changed, in its post-update form.
    pub fn upsert_health(
        &mut self,
        candidates: &mut CandidateSet,
        address: &Address,
        device: Option<HealthResponse>,
        server: Option<HealthResponse>,
    ) -> Vec<Service> {
        let claimed = server
            .as_ref()
            .or(device.as_ref())
            .map(|h| h.name.clone());

        let Some(name) = claimed else {
            return self.mark_unreachable(address);
        };

        let mut changed = Vec::new();

        for service in self
            .services
            .iter_mut()
            .filter(|s| s.name != name && s.owns(address))
        {
            tracing::info!(
                "{} now answers as {}, detaching it from {}",
                address,
                name,
                service.name
            );
            strip_address(service, address);
            changed.push(service.clone());
        }

        let advertised = candidates.take(address);
        if advertised.is_some() {
            tracing::debug!("Promoting candidate {} to service {}", address, name);
        }

        let idx = match self.services.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                tracing::info!("Discovered robot {} at {}", name, address);
                self.services.push(Service::new(name.clone()));
                self.services.len() - 1
            }
        };

        let service = &mut self.services[idx];
        let before = service.clone();

        if !service.owns(address) {
            service.addresses.push(AddressRecord::new(address));
        }
        // A real address supersedes any ghost left by an earlier conflict
        service.addresses.retain(|r| r.ip.is_some());

        if let Some(record) = service.record_mut(address) {
            record.local = Some(address.is_link_local());
            record.advertising |= advertised.unwrap_or(false);
            record.ok = Some(device.as_ref().map_or(false, |h| h.name == name));
            record.server_ok = Some(server.as_ref().map_or(false, |h| h.name == name));
            record.health = device;
            record.server_health = server;
            record.updated_at = Utc::now();
        }

        if before.addresses.is_empty() || !before.same_state(service) {
            changed.push(service.clone());
        }

        changed
    }

    /// Both probes failed: every record at `address` drops to unreachable
    /// but stays listed.
    fn mark_unreachable(&mut self, address: &Address) -> Vec<Service> {
        let now = Utc::now();
        let mut changed = Vec::new();

        for service in &mut self.services {
            let Some(record) = service.record_mut(address) else {
                continue;
            };
            let flipped = record.ok != Some(false) || record.server_ok != Some(false);
            record.ok = Some(false);
            record.server_ok = Some(false);
            record.updated_at = now;
            if flipped {
                tracing::debug!("{} at {} is unreachable", service.name, address);
                changed.push(service.clone());
            }
        }

        changed
    }

    /// Multicast saw a robot at `address`. Owned addresses are only flagged as
    /// advertising; anything else becomes a candidate.
    pub fn add_multicast_candidate(
        &mut self,
        candidates: &mut CandidateSet,
        address: Address,
    ) -> MulticastOutcome {
        if let Some(service) = self.services.iter_mut().find(|s| s.owns(&address)) {
            let mut flipped = false;
            if let Some(record) = service.record_mut(&address) {
                flipped = !record.advertising;
                record.advertising = true;
            }
            return MulticastOutcome::Advertising(flipped.then(|| service.clone()));
        }

        if candidates.insert(address, true) {
            MulticastOutcome::NewCandidate
        } else {
            MulticastOutcome::KnownCandidate
        }
    }

    /// The robot called `name` stopped advertising
    pub fn mark_withdrawn(&mut self, name: &str) -> Option<Service> {
        let service = self.services.iter_mut().find(|s| s.name == name)?;
        let mut flipped = false;
        for record in service.addresses.iter_mut().filter(|r| r.advertising) {
            record.advertising = false;
            flipped = true;
        }
        flipped.then(|| service.clone())
    }

    /// Delete the service called `name` along with any candidate sitting at
    /// one of its addresses.
    pub fn remove(&mut self, candidates: &mut CandidateSet, name: &str) -> Option<Removal> {
        let idx = self.services.iter().position(|s| s.name == name)?;
        let service = self.services.remove(idx);
        let addresses: Vec<Address> = service
            .addresses
            .iter()
            .filter_map(AddressRecord::address)
            .collect();

        Some(Removal {
            candidates: candidates.remove_all(&addresses),
            records: service.addresses,
        })
    }

    /// Every address that should be probed: service addresses first, then
    /// candidates, without duplicates.
    pub fn poll_targets(&self, candidates: &CandidateSet) -> Vec<Address> {
        let mut targets: Vec<Address> = Vec::new();
        let owned = self
            .services
            .iter()
            .flat_map(|s| s.addresses.iter().filter_map(AddressRecord::address));
        for address in owned.chain(candidates.addresses()) {
            if !targets.contains(&address) {
                targets.push(address);
            }
        }
        targets
    }
}

/// Detach `address` from `service`. A service left with no addresses keeps a
/// single unreachable ghost record so it stays visible.
fn strip_address(service: &mut Service, address: &Address) {
    let Some(idx) = service.addresses.iter().position(|r| r.is_at(address)) else {
        return;
    };
    let mut record = service.addresses.remove(idx);
    if service.addresses.is_empty() {
        record.ip = None;
        record.local = None;
        record.advertising = false;
        record.ok = Some(false);
        record.server_ok = Some(false);
        record.updated_at = Utc::now();
        service.addresses.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str) -> Address {
        Address::with_default_port(ip)
    }

    fn named(name: &str) -> Option<HealthResponse> {
        Some(HealthResponse::named(name))
    }

    fn setup() -> (Directory, CandidateSet) {
        (Directory::default(), CandidateSet::default())
    }

    #[test]
    fn test_matching_probes_mark_connectable() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");

        let changed = dir.upsert_health(&mut cands, &a, named("foo"), named("foo"));
        assert_eq!(changed.len(), 1);

        let record = dir.get("foo").unwrap().record(&a).unwrap();
        assert_eq!(record.ok, Some(true));
        assert_eq!(record.server_ok, Some(true));
        assert_eq!(record.local, Some(false));
    }

    #[test]
    fn test_failed_probes_keep_service() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");
        dir.upsert_health(&mut cands, &a, named("foo"), named("foo"));

        let changed = dir.upsert_health(&mut cands, &a, None, None);
        assert_eq!(changed.len(), 1);

        let record = dir.get("foo").unwrap().record(&a).unwrap();
        assert_eq!(record.ok, Some(false));
        assert_eq!(record.server_ok, Some(false));

        // Repeated failure is not a change
        assert!(dir.upsert_health(&mut cands, &a, None, None).is_empty());
    }

    #[test]
    fn test_failed_probe_on_unknown_address_creates_nothing() {
        let (mut dir, mut cands) = setup();
        cands.insert(addr("10.0.0.1"), false);
        assert!(dir.upsert_health(&mut cands, &addr("10.0.0.1"), None, None).is_empty());
        assert!(dir.snapshot().is_empty());
        assert_eq!(cands.len(), 1);
    }

    #[test]
    fn test_server_name_wins_and_mismatch_flags_device() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");

        dir.upsert_health(&mut cands, &a, named("old-name"), named("new-name"));

        assert!(dir.get("old-name").is_none());
        let record = dir.get("new-name").unwrap().record(&a).unwrap();
        assert_eq!(record.ok, Some(false));
        assert_eq!(record.server_ok, Some(true));
    }

    #[test]
    fn test_device_only_response() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");

        dir.upsert_health(&mut cands, &a, named("foo"), None);

        let record = dir.get("foo").unwrap().record(&a).unwrap();
        assert_eq!(record.ok, Some(true));
        assert_eq!(record.server_ok, Some(false));
        assert!(record.server_health.is_none());
    }

    #[test]
    fn test_promotion_removes_candidate_and_keeps_advertising() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");
        assert_eq!(
            dir.add_multicast_candidate(&mut cands, a.clone()),
            MulticastOutcome::NewCandidate
        );

        dir.upsert_health(&mut cands, &a, named("foo"), named("foo"));

        assert!(cands.is_empty());
        let services = dir.snapshot();
        assert_eq!(services.len(), 1);
        assert!(services[0].record(&a).unwrap().advertising);
    }

    #[test]
    fn test_ip_conflict_moves_address_to_new_claimant() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");
        dir.upsert_health(&mut cands, &a, named("foo"), named("foo"));

        let changed = dir.upsert_health(&mut cands, &a, named("bar"), named("bar"));
        assert_eq!(changed.len(), 2);

        let foo = dir.get("foo").unwrap();
        assert!(!foo.owns(&a));
        assert_eq!(foo.addresses.len(), 1);
        assert_eq!(foo.addresses[0].ip, None);
        assert_eq!(foo.addresses[0].local, None);
        assert_eq!(foo.addresses[0].ok, Some(false));

        assert!(dir.get("bar").unwrap().owns(&a));
        assert_eq!(dir.owner(&a), Some("bar"));
    }

    #[test]
    fn test_conflict_with_other_addresses_leaves_no_ghost() {
        let (mut dir, mut cands) = setup();
        let wired = addr("169.254.1.2");
        let wifi = addr("192.168.1.42");
        dir.upsert_health(&mut cands, &wired, named("foo"), named("foo"));
        dir.upsert_health(&mut cands, &wifi, named("foo"), named("foo"));

        dir.upsert_health(&mut cands, &wifi, named("bar"), named("bar"));

        let foo = dir.get("foo").unwrap();
        assert_eq!(foo.addresses.len(), 1);
        assert!(foo.owns(&wired));
        assert_eq!(foo.addresses[0].local, Some(true));
    }

    #[test]
    fn test_ghost_dropped_when_service_returns() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");
        let b = addr("192.168.1.43");
        dir.upsert_health(&mut cands, &a, named("foo"), named("foo"));
        dir.upsert_health(&mut cands, &a, named("bar"), named("bar"));

        dir.upsert_health(&mut cands, &b, named("foo"), named("foo"));

        let foo = dir.get("foo").unwrap();
        assert_eq!(foo.addresses.len(), 1);
        assert!(foo.owns(&b));
    }

    #[test]
    fn test_multicast_on_owned_address_marks_advertising() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");
        dir.upsert_health(&mut cands, &a, named("foo"), named("foo"));

        match dir.add_multicast_candidate(&mut cands, a.clone()) {
            MulticastOutcome::Advertising(Some(service)) => assert_eq!(service.name, "foo"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            dir.add_multicast_candidate(&mut cands, a.clone()),
            MulticastOutcome::Advertising(None)
        );
        assert!(cands.is_empty());

        let withdrawn = dir.mark_withdrawn("foo").unwrap();
        assert!(!withdrawn.record(&a).unwrap().advertising);
        assert!(dir.mark_withdrawn("foo").is_none());
    }

    #[test]
    fn test_remove_drops_service_and_matching_candidates() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");
        dir.upsert_health(&mut cands, &a, named("foo"), named("foo"));
        cands.insert(a.clone(), false);
        cands.insert(addr("10.0.0.1"), false);

        let removal = dir.remove(&mut cands, "foo").unwrap();
        assert_eq!(removal.records.len(), 1);
        assert_eq!(removal.candidates.len(), 1);
        assert!(dir.get("foo").is_none());
        assert_eq!(cands.len(), 1);

        assert!(dir.remove(&mut cands, "foo").is_none());
    }

    #[test]
    fn test_poll_targets_dedup() {
        let (mut dir, mut cands) = setup();
        let a = addr("192.168.1.42");
        dir.upsert_health(&mut cands, &a, named("foo"), named("foo"));
        cands.insert(a.clone(), false);
        cands.insert(addr("10.0.0.1"), false);

        assert_eq!(dir.poll_targets(&cands), vec![a, addr("10.0.0.1")]);
    }

    #[test]
    fn test_seed_resets_advertising_and_drops_duplicates() {
        let a = addr("192.168.1.42");
        let mut record = AddressRecord::new(&a);
        record.advertising = true;
        let foo = Service {
            name: "foo".to_string(),
            addresses: vec![record.clone()],
        };
        let bar = Service {
            name: "bar".to_string(),
            addresses: vec![record],
        };

        let dir = Directory::new(vec![foo.clone(), foo, bar]);
        let services = dir.snapshot();
        assert_eq!(services.len(), 2);
        assert!(!services[0].addresses[0].advertising);
        assert!(services[1].addresses.is_empty());
    }
}
