pub mod protocol;
pub mod supervisor;

pub use supervisor::{BridgeSupervisor, InboundEnvelope};
