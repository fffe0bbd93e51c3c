//! Node Core - Hardware-independent logic for the ESP32 home node
//!
//! Update pipeline, connectivity state machine and configuration portal.
//! Everything talks to the hardware through the traits in [`hal`],
//! [`storage`] and [`fetcher`], so the crate builds and tests on the host.

pub mod collaborators;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod hal;
pub mod installer;
pub mod portal;
pub mod storage;
pub mod version;

#[cfg(test)]
mod fakes;

pub use config::DeviceConfig;
pub use connectivity::{ConnectivityState, ConnectivityStateMachine, SharedConnectivity};
pub use error::{ConfigError, FetchError, NetworkError, RadioError, StorageError, SwapError};
pub use installer::{UpdateCheck, UpdateInstaller};
pub use portal::ConfigPortal;
