//! Robot discovery engine.
//!
//! Finds robots through mDNS advertisements and manually added addresses,
//! health-checks every known address on a fixed interval, resolves address
//! conflicts between robots, and publishes a deduplicated directory.
//!
//! [`DiscoveryClient`] is the entry point: spawn it around a [`Discovery`]
//! (or use [`DiscoveryClient::spawn_default`]), call `start`, then read
//! snapshots or subscribe to [`DiscoveryEvent`]s.

pub mod candidates;
pub mod client;
pub mod directory;
pub mod fingerprint;
pub mod mdns;
pub mod options;
pub mod poller;
pub mod probe;
pub mod status;

pub use candidates::Filters;
pub use client::{Discovery, DiscoveryClient, DiscoveryEvent, Snapshot};
pub use options::{DiscoveryOptions, ProbeOptions};
pub use status::{healthy_addresses, representative, AddressStatus};
