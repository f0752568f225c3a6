use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use mdns_sd::ServiceDaemon;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use shared::protocol::DEFAULT_PORT;
use shared::types::{Address, AddressRecord, Candidate, Service};
use crate::candidates::{CandidateSet, Filters};
use crate::directory::{Directory, MulticastOutcome};
use crate::fingerprint::compute_fingerprint;
use crate::mdns::{BrowserEvent, MdnsBrowser, MulticastBrowser};
use crate::options::{poll_interval_or_default, DiscoveryOptions, ProbeOptions};
use crate::poller::{HealthPoller, HealthReport, PollHandle, PollRequest, Poller};
use crate::probe::HttpProbe;

const COMMAND_CAPACITY: usize = 64;
const HEALTH_CAPACITY: usize = 256;
const BROWSER_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 128;

/// Notifications for the rest of the application
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Directory state changed; re-read the snapshot. Carries the service
    /// that changed, or `None` when only the candidate set grew.
    Service(Option<Service>),
    /// A service was removed; carries the records it had
    ServiceRemoved(Vec<AddressRecord>),
    /// Multicast transport failure, passed through unchanged
    Error(Arc<anyhow::Error>),
}

/// Copy of the directory handed to readers
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub services: Vec<Service>,
    pub candidates: Vec<Candidate>,
    pub fingerprint: String,
}

struct ActivePoll {
    handle: PollHandle,
    targets: Vec<Address>,
    interval: Duration,
}

/// The discovery state machine. Every mutation of the directory and the
/// candidate set goes through `&mut self`, so there is exactly one writer.
pub struct Discovery {
    directory: Directory,
    candidates: CandidateSet,
    filters: Filters,
    poll_interval: Duration,
    poller: Box<dyn Poller>,
    browser: Box<dyn MulticastBrowser>,
    running: bool,
    generation: u64,
    active: Option<ActivePoll>,
    health_rx: Option<mpsc::Receiver<HealthReport>>,
    session: Option<CancellationToken>,
    browser_rx: Option<mpsc::Receiver<BrowserEvent>>,
    events: broadcast::Sender<DiscoveryEvent>,
    snapshot: watch::Sender<Snapshot>,
}

impl Discovery {
    pub fn new(
        options: DiscoveryOptions,
        poller: impl Poller,
        browser: impl MulticastBrowser,
    ) -> Self {
        let poll_interval = options.poll_interval();
        let filters = options.filters();
        let directory = Directory::new(options.services);
        let candidates = CandidateSet::new(options.candidates);

        let services = directory.snapshot();
        let candidate_list = candidates.snapshot();
        let fingerprint = compute_fingerprint(&services, &candidate_list);
        let (snapshot, _) = watch::channel(Snapshot {
            services,
            candidates: candidate_list,
            fingerprint,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            directory,
            candidates,
            filters,
            poll_interval,
            poller: Box::new(poller),
            browser: Box::new(browser),
            running: false,
            generation: 0,
            active: None,
            health_rx: None,
            session: None,
            browser_rx: None,
            events,
            snapshot,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn services(&self) -> Vec<Service> {
        self.directory.snapshot()
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates.snapshot()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Begin browsing and polling. A running client is torn down and started
    /// fresh.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            tracing::debug!("Restarting discovery");
        }
        self.stop_browser();
        self.stop_poller();
        self.running = false;

        let (tx, rx) = mpsc::channel(BROWSER_CAPACITY);
        let session = CancellationToken::new();
        self.browser
            .start(tx, session.clone())
            .context("Failed to start multicast browser")?;
        self.session = Some(session);
        self.browser_rx = Some(rx);

        self.running = true;
        tracing::info!("Discovery started, polling every {:?}", self.poll_interval);
        self.reconcile();
        Ok(())
    }

    /// Pause discovery. Services and candidates are kept.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.stop_browser();
        self.stop_poller();
        self.running = false;
        tracing::info!("Discovery stopped");
    }

    /// Track `address` as a candidate. Returns false if it is already known.
    pub fn add(&mut self, address: Address) -> bool {
        if self.directory.owner(&address).is_some() || !self.candidates.insert(address.clone(), false) {
            tracing::debug!("{} is already tracked", address);
            return false;
        }
        tracing::info!("Added candidate {}", address);
        self.publish();
        self.reconcile();
        true
    }

    /// Forget the service called `name`, returning the records it had.
    pub fn remove(&mut self, name: &str) -> Option<Vec<AddressRecord>> {
        let removal = self.directory.remove(&mut self.candidates, name)?;
        tracing::info!(
            "Removed {} ({} addresses, {} candidates)",
            name,
            removal.records.len(),
            removal.candidates.len()
        );
        self.publish();
        self.reconcile();
        self.emit(DiscoveryEvent::ServiceRemoved(removal.records.clone()));
        Some(removal.records)
    }

    pub fn set_poll_interval(&mut self, ms: u64) {
        self.poll_interval = poll_interval_or_default(ms);
        tracing::info!("Poll interval set to {:?}", self.poll_interval);
        self.reconcile();
    }

    /// Apply one health report from the current poll generation
    pub fn apply_health(&mut self, report: HealthReport) {
        let current = self.active.as_ref().map(|a| a.handle.generation());
        debug_assert_eq!(
            current,
            Some(report.generation),
            "stale health report for {}",
            report.address
        );
        if current != Some(report.generation) {
            tracing::error!(
                "Dropping stale health report for {} (generation {}, current {:?})",
                report.address,
                report.generation,
                current
            );
            return;
        }

        let changed = self.directory.upsert_health(
            &mut self.candidates,
            &report.address,
            report.device,
            report.server,
        );
        if changed.is_empty() {
            return;
        }

        self.publish();
        self.reconcile();
        for service in changed {
            self.emit(DiscoveryEvent::Service(Some(service)));
        }
    }

    pub fn handle_browser_event(&mut self, event: BrowserEvent) {
        match event {
            BrowserEvent::Ready => {
                tracing::debug!("Multicast browser ready, sending discovery query");
                if let Err(e) = self.browser.discover() {
                    self.emit(DiscoveryEvent::Error(Arc::new(e)));
                }
            }
            BrowserEvent::Update(record) => {
                let Some(address) = record.preferred_address() else {
                    tracing::debug!("Ignoring {}: no usable address", record.name);
                    return;
                };
                if !self.filters.passes(&record.name, &address) {
                    tracing::debug!("Ignoring {} at {}: filtered out", record.name, address);
                    return;
                }

                match self
                    .directory
                    .add_multicast_candidate(&mut self.candidates, address.clone())
                {
                    MulticastOutcome::Advertising(Some(service)) => {
                        self.publish();
                        self.emit(DiscoveryEvent::Service(Some(service)));
                    }
                    MulticastOutcome::NewCandidate => {
                        tracing::info!("New candidate {} at {}", record.name, address);
                        self.publish();
                        self.reconcile();
                        self.emit(DiscoveryEvent::Service(None));
                    }
                    MulticastOutcome::Advertising(None) | MulticastOutcome::KnownCandidate => {}
                }
            }
            BrowserEvent::Removed(name) => {
                if let Some(service) = self.directory.mark_withdrawn(&name) {
                    self.publish();
                    self.emit(DiscoveryEvent::Service(Some(service)));
                }
            }
            BrowserEvent::Error(e) => {
                tracing::warn!("Multicast browser error: {:#}", e);
                self.emit(DiscoveryEvent::Error(Arc::new(e)));
            }
        }
    }

    /// Bring the running poller in line with the current address set and
    /// interval. Restarts only when one of them differs.
    fn reconcile(&mut self) {
        if !self.running {
            return;
        }

        let targets = self.directory.poll_targets(&self.candidates);
        if let Some(active) = &self.active {
            if same_addresses(&active.targets, &targets) && active.interval == self.poll_interval {
                return;
            }
        }

        self.stop_poller();
        self.generation += 1;

        let (tx, rx) = mpsc::channel(HEALTH_CAPACITY);
        let handle = self.poller.poll(
            PollRequest {
                generation: self.generation,
                targets: targets.clone(),
                interval: self.poll_interval,
            },
            tx,
        );
        self.active = Some(ActivePoll {
            handle,
            targets,
            interval: self.poll_interval,
        });
        self.health_rx = Some(rx);
    }

    fn stop_poller(&mut self) {
        if let Some(active) = self.active.take() {
            self.poller.stop(active.handle);
        }
        self.health_rx = None;
    }

    fn stop_browser(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel();
            self.browser.stop();
        }
        self.browser_rx = None;
    }

    /// Refresh the published snapshot. Watchers are only woken when the
    /// fingerprint moves; the stored value always carries the latest health.
    fn publish(&self) {
        let services = self.directory.snapshot();
        let candidates = self.candidates.snapshot();
        let fingerprint = compute_fingerprint(&services, &candidates);

        self.snapshot.send_if_modified(|current| {
            let changed = current.fingerprint != fingerprint;
            *current = Snapshot {
                services,
                candidates,
                fingerprint,
            };
            changed
        });
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
    Add(Address, oneshot::Sender<bool>),
    Remove(String, oneshot::Sender<Option<Vec<AddressRecord>>>),
    SetPollInterval(u64, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a discovery client running on its own task
#[derive(Clone)]
pub struct DiscoveryClient {
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl DiscoveryClient {
    /// Spawn the client task around `discovery`
    pub fn spawn(discovery: Discovery) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let snapshot = discovery.snapshot.subscribe();
        let events = discovery.events.clone();

        tokio::spawn(run(discovery, rx));

        Self { tx, snapshot, events }
    }

    /// Client with HTTP probes and an mDNS browser on `daemon`
    pub fn spawn_default(
        options: DiscoveryOptions,
        probe: ProbeOptions,
        daemon: ServiceDaemon,
        service_type: &str,
    ) -> Result<Self> {
        let poller = HealthPoller::new(HttpProbe::new(probe.timeout())?, probe.timeout());
        let browser = MdnsBrowser::new(daemon, service_type);
        Ok(Self::spawn(Discovery::new(options, poller, browser)))
    }

    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start(reply)).await?;
        rx.await.context("Discovery task dropped the reply")?
    }

    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop(reply)).await?;
        rx.await.context("Discovery task dropped the reply")
    }

    /// Add a candidate; `port` defaults to the robot API port
    pub async fn add(&self, ip: impl Into<String>, port: Option<u16>) -> Result<bool> {
        let address = Address::new(ip, port.unwrap_or(DEFAULT_PORT));
        let (reply, rx) = oneshot::channel();
        self.send(Command::Add(address, reply)).await?;
        rx.await.context("Discovery task dropped the reply")
    }

    pub async fn remove(&self, name: impl Into<String>) -> Result<Option<Vec<AddressRecord>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Remove(name.into(), reply)).await?;
        rx.await.context("Discovery task dropped the reply")
    }

    pub async fn set_poll_interval(&self, ms: u64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetPollInterval(ms, reply)).await?;
        rx.await.context("Discovery task dropped the reply")
    }

    /// Stop everything and end the client task
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown(reply)).await?;
        rx.await.context("Discovery task dropped the reply")
    }

    pub fn services(&self) -> Vec<Service> {
        self.snapshot.borrow().services.clone()
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.snapshot.borrow().candidates.clone()
    }

    pub fn fingerprint(&self) -> String {
        self.snapshot.borrow().fingerprint.clone()
    }

    /// Receiver that wakes whenever the directory fingerprint changes
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("Discovery task is not running"))
    }
}

/// Client event loop: commands, health reports and browser events all land
/// here and are applied one at a time.
async fn run(mut discovery: Discovery, mut rx: mpsc::Receiver<Command>) {
    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    tracing::debug!("All discovery handles dropped");
                    break;
                };
                match command {
                    Command::Start(reply) => {
                        let _ = reply.send(discovery.start());
                    }
                    Command::Stop(reply) => {
                        discovery.stop();
                        let _ = reply.send(());
                    }
                    Command::Add(address, reply) => {
                        let _ = reply.send(discovery.add(address));
                    }
                    Command::Remove(name, reply) => {
                        let _ = reply.send(discovery.remove(&name));
                    }
                    Command::SetPollInterval(ms, reply) => {
                        discovery.set_poll_interval(ms);
                        let _ = reply.send(());
                    }
                    Command::Shutdown(reply) => {
                        discovery.stop();
                        let _ = reply.send(());
                        tracing::info!("Discovery task shutting down");
                        return;
                    }
                }
            }
            Some(report) = recv_opt(&mut discovery.health_rx) => {
                discovery.apply_health(report);
            }
            Some(event) = recv_opt(&mut discovery.browser_rx) => {
                discovery.handle_browser_event(event);
            }
        }
    }

    discovery.stop();
}

/// Order-insensitive: promotion and conflicts reorder the target list
/// without changing what gets polled.
fn same_addresses(a: &[Address], b: &[Address]) -> bool {
    a.len() == b.len() && a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
