//! Port-isolation firewall: a per-service whitelist of destination
//! ports, validated on every outgoing HTTP call, extended by log-tail and
//! TCP-probe discovery either on demand or on the Router's periodic sweep.

pub mod discovery;
pub mod whitelist;

pub use discovery::{on_demand, periodic_sweep, Discovered};
pub use whitelist::{request_port, target_port, Whitelist};
