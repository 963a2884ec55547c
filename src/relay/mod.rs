//! Relay Node: overlay-event classification, the HTTP worker pool,
//! chunked-upload reassembly, response replay, and the three response
//! framings.

pub mod job;
pub mod node;
pub mod ratelimit;
pub mod replay;
pub mod streaming;
pub mod upload;

pub use node::{AssignmentTable, RelayNode, RotationTrigger};
