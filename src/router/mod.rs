//! Router: owns every Relay Node, the service→node assignment map,
//! the status monitor / port-discovery loop, and seed rotation.

pub mod state;

pub use state::{Router, ServiceStatus};
