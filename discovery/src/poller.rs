use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use shared::types::{Address, HealthResponse};
use crate::probe::HealthProbe;

/// One poll generation: probe every target once per interval
#[derive(Debug, Clone, PartialEq)]
pub struct PollRequest {
    pub generation: u64,
    pub targets: Vec<Address>,
    pub interval: Duration,
}

/// Result of one probe pair against one address
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub generation: u64,
    pub address: Address,
    pub device: Option<HealthResponse>,
    pub server: Option<HealthResponse>,
}

/// Handle to a running poll generation. Consumed by [`Poller::stop`], so a
/// generation can only be stopped once.
#[derive(Debug)]
pub struct PollHandle {
    generation: u64,
    cancel: CancellationToken,
}

impl PollHandle {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            cancel: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Drives repeated health probes. After `stop` returns, nothing more may be
/// sent for that handle's generation.
pub trait Poller: Send + 'static {
    fn poll(&mut self, request: PollRequest, sink: mpsc::Sender<HealthReport>) -> PollHandle;

    fn stop(&mut self, handle: PollHandle);
}

/// Poller that spawns one task per address, staggered across the interval.
pub struct HealthPoller<P> {
    probe: Arc<P>,
    probe_timeout: Duration,
}

impl<P: HealthProbe> HealthPoller<P> {
    pub fn new(probe: P, probe_timeout: Duration) -> Self {
        Self {
            probe: Arc::new(probe),
            probe_timeout,
        }
    }
}

impl<P: HealthProbe> Poller for HealthPoller<P> {
    fn poll(&mut self, request: PollRequest, sink: mpsc::Sender<HealthReport>) -> PollHandle {
        let handle = PollHandle::new(request.generation);
        if request.targets.is_empty() {
            return handle;
        }

        let timeout = self.probe_timeout.min(request.interval);
        let count = request.targets.len() as u32;

        tracing::debug!(
            "Polling {} addresses every {:?} (generation {})",
            count,
            request.interval,
            request.generation
        );

        for (i, address) in request.targets.into_iter().enumerate() {
            let task = AddressTask {
                probe: Arc::clone(&self.probe),
                address,
                generation: request.generation,
                offset: request.interval * i as u32 / count,
                interval: request.interval,
                timeout,
                sink: sink.clone(),
                cancel: handle.cancel_token(),
            };
            tokio::spawn(task.run());
        }

        handle
    }

    fn stop(&mut self, handle: PollHandle) {
        tracing::debug!("Stopping poll generation {}", handle.generation);
        handle.cancel.cancel();
    }
}

struct AddressTask<P> {
    probe: Arc<P>,
    address: Address,
    generation: u64,
    offset: Duration,
    interval: Duration,
    timeout: Duration,
    sink: mpsc::Sender<HealthReport>,
    cancel: CancellationToken,
}

impl<P: HealthProbe> AddressTask<P> {
    async fn run(self) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.offset) => {}
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let probes = async {
                tokio::join!(
                    tokio::time::timeout(self.timeout, self.probe.device_health(&self.address)),
                    tokio::time::timeout(self.timeout, self.probe.server_health(&self.address)),
                )
            };

            let (device, server) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                results = probes => results,
            };

            if self.cancel.is_cancelled() {
                break;
            }

            let report = HealthReport {
                generation: self.generation,
                address: self.address.clone(),
                device: device.ok().flatten(),
                server: server.ok().flatten(),
            };

            if self.sink.send(report).await.is_err() {
                tracing::debug!("Health sink for {} closed", self.address);
                break;
            }
        }
    }
}
