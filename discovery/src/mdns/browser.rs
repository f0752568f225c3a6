use anyhow::{anyhow, Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use super::{BrowserEvent, MulticastBrowser, MulticastRecord};

/// Browses one service type on an `mdns-sd` daemon.
///
/// `discover` keeps the default no-op: the daemon sends its own queries,
/// with backoff, for as long as a browse is active.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    service_type: String,
    browsing: bool,
}

impl MdnsBrowser {
    pub fn new(daemon: ServiceDaemon, service_type: impl Into<String>) -> Self {
        Self {
            daemon,
            service_type: service_type.into(),
            browsing: false,
        }
    }

    fn stop_browse(&mut self) {
        if !self.browsing {
            return;
        }
        self.browsing = false;
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            tracing::warn!("Failed to stop browsing {}: {}", self.service_type, e);
        }
    }
}

impl MulticastBrowser for MdnsBrowser {
    fn start(&mut self, tx: mpsc::Sender<BrowserEvent>, cancel: CancellationToken) -> Result<()> {
        // The daemon allows one browse per type; end the previous session
        // before its task notices the cancellation.
        self.stop_browse();

        let receiver = self
            .daemon
            .browse(&self.service_type)
            .with_context(|| format!("Failed to browse {}", self.service_type))?;
        self.browsing = true;

        tokio::spawn(run_browser(receiver, self.service_type.clone(), tx, cancel));
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_browse();
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        self.stop_browse();
    }
}

async fn run_browser(
    receiver: flume::Receiver<ServiceEvent>,
    service_type: String,
    tx: mpsc::Sender<BrowserEvent>,
    cancel: CancellationToken,
) {
    tracing::info!("Browsing for {}", service_type);
    let mut ready = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = receiver.recv_async() => event,
        };

        let out = match event {
            Ok(ServiceEvent::SearchStarted(_)) if !ready => {
                ready = true;
                BrowserEvent::Ready
            }
            Ok(ServiceEvent::ServiceResolved(info)) => match convert_service_info(&info) {
                Some(record) => {
                    tracing::debug!("Resolved {} at {:?}", record.name, record.addresses);
                    BrowserEvent::Update(record)
                }
                None => continue,
            },
            Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                tracing::debug!("Service removed: {}", fullname);
                BrowserEvent::Removed(instance_name(&fullname, &service_type).to_string())
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = tx
                    .send(BrowserEvent::Error(anyhow!("mDNS browse channel closed: {}", e)))
                    .await;
                break;
            }
        };

        if tx.send(out).await.is_err() {
            tracing::warn!("Browser event receiver dropped");
            break;
        }
    }

    tracing::info!("Stopped browsing for {}", service_type);
}

/// Convert an mdns-sd ServiceInfo to a MulticastRecord. Addresses are sorted
/// so the preferred pick does not depend on hash-set order.
fn convert_service_info(info: &ServiceInfo) -> Option<MulticastRecord> {
    let mut addresses: Vec<String> = info
        .get_addresses()
        .iter()
        .map(|ip| ip.to_string())
        .collect();

    if addresses.is_empty() {
        tracing::debug!("Skipping {} - no addresses", info.get_fullname());
        return None;
    }
    addresses.sort();

    Some(MulticastRecord {
        name: instance_name(info.get_fullname(), info.get_type()).to_string(),
        addresses,
        port: info.get_port(),
    })
}

/// "opentrons-dev._http._tcp.local." -> "opentrons-dev"
fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use shared::protocol::ROBOT_SERVICE_TYPE;

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("opentrons-dev._http._tcp.local.", ROBOT_SERVICE_TYPE),
            "opentrons-dev"
        );
        assert_eq!(instance_name("weird-name", ROBOT_SERVICE_TYPE), "weird-name");
    }

    #[test]
    fn test_convert_service_info() {
        let info = ServiceInfo::new(
            ROBOT_SERVICE_TYPE,
            "opentrons-dev",
            "opentrons-dev.local.",
            "192.168.1.42",
            31950,
            HashMap::<String, String>::new(),
        )
        .unwrap();

        let record = convert_service_info(&info).unwrap();
        assert_eq!(record.name, "opentrons-dev");
        assert_eq!(record.addresses, vec!["192.168.1.42".to_string()]);
        assert_eq!(record.port, 31950);
    }
}
