//! lanwatch: continuous LAN device discovery with presence history.
//!
//! The [`engine`] sweeps one subnet on a fixed interval,
//! folds each sweep into per-device history in the [`store::PresenceStore`],
//! and publishes an immutable [`models::Snapshot`] that readers and pushed
//! observers see.

pub mod categorize;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod hub;
pub mod logging;
pub mod models;
pub mod network;
pub mod reconcile;
pub mod resolve;
pub mod scanner;
pub mod server;
pub mod store;

pub use discovery::{Discovery, DiscoveryMethod, DiscoveryProvider};
pub use engine::{Engine, EngineConfig, ScanHandle, TriggerOutcome};
pub use hub::{HubConfig, HubEvent, Observer};
pub use models::{DeviceCategory, DeviceStatus, Snapshot};
pub use store::PresenceStore;
