//! stagegridd: the staging agent daemon.
//!
//! Wires the subsystems together:
//! - Desired-state store fed by the control plane
//! - Reconciler driving the local kind cluster
//! - Redirections, proxy routes and the public tunnel
//! - Status reporter and self-registration
//! - REST API

pub mod agent;

pub use agent::Agent;
