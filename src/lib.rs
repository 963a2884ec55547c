//! Overlay relay router: bridges overlay-network peers to local HTTP
//! services. See `server::bootstrap` for the process lifecycle.

pub mod bridge;
pub mod config;
pub mod config_persist;
pub mod error;
pub mod firewall;
pub mod identity;
pub mod metrics;
pub mod overlay;
pub mod relay;
pub mod router;
pub mod server;
