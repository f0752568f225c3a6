use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{Candidate, Service};

/// Only the fields that matter to consumers; health bodies and timestamps
/// change on every probe and are left out.
#[derive(Serialize)]
struct RecordView<'a> {
    ip: Option<&'a str>,
    port: u16,
    local: Option<bool>,
    advertising: bool,
    ok: Option<bool>,
    server_ok: Option<bool>,
}

#[derive(Serialize)]
struct ServiceView<'a> {
    name: &'a str,
    addresses: Vec<RecordView<'a>>,
}

#[derive(Serialize)]
struct DirectoryView<'a> {
    services: Vec<ServiceView<'a>>,
    candidates: Vec<(&'a str, u16)>,
}

/// SHA-256 over the directory, independent of service and candidate order.
pub fn compute_fingerprint(services: &[Service], candidates: &[Candidate]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by(|&a, &b| services[a].name.cmp(&services[b].name));

    let services = indices
        .iter()
        .map(|&i| {
            let s = &services[i];
            ServiceView {
                name: &s.name,
                addresses: s
                    .addresses
                    .iter()
                    .map(|r| RecordView {
                        ip: r.ip.as_deref(),
                        port: r.port,
                        local: r.local,
                        advertising: r.advertising,
                        ok: r.ok,
                        server_ok: r.server_ok,
                    })
                    .collect(),
            }
        })
        .collect();

    let mut candidates: Vec<(&str, u16)> = candidates
        .iter()
        .map(|c| (c.ip.as_str(), c.port))
        .collect();
    candidates.sort();

    // Plain structs of strings, bools and ints always serialize
    let json = serde_json::to_string(&DirectoryView { services, candidates })
        .unwrap_or_default();

    hex::encode(Sha256::digest(json.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{Address, AddressRecord, HealthResponse};

    fn service(name: &str, ip: &str) -> Service {
        Service {
            name: name.to_string(),
            addresses: vec![AddressRecord::new(&Address::with_default_port(ip))],
        }
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let a = service("a", "10.0.0.1");
        let b = service("b", "10.0.0.2");
        let c1 = Candidate::from(Address::with_default_port("10.0.0.3"));
        let c2 = Candidate::from(Address::with_default_port("10.0.0.4"));

        assert_eq!(
            compute_fingerprint(&[a.clone(), b.clone()], &[c1.clone(), c2.clone()]),
            compute_fingerprint(&[b, a], &[c2, c1])
        );
    }

    #[test]
    fn test_fingerprint_changes_on_flag_flip() {
        let before = service("a", "10.0.0.1");
        let mut after = before.clone();
        after.addresses[0].ok = Some(true);

        assert_ne!(compute_fingerprint(&[before], &[]), compute_fingerprint(&[after], &[]));
    }

    #[test]
    fn test_fingerprint_ignores_health_body_and_timestamps() {
        let before = service("a", "10.0.0.1");
        let mut after = before.clone();
        after.addresses[0].health = Some(HealthResponse::named("a"));
        after.addresses[0].updated_at = before.addresses[0].updated_at + chrono::Duration::seconds(60);

        assert_eq!(compute_fingerprint(&[before], &[]), compute_fingerprint(&[after], &[]));
    }
}
