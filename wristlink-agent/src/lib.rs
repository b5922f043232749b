//! WristLink agent library
//!
//! Bridges a wearable companion device (persistent line-oriented serial link)
//! to a telemetry backend:
//! - Device link state machine with orchestrated reconnects
//! - Line-protocol decoding with identity recovery fallback
//! - Backend dispatch and haptic feedback relay

pub mod backend;
pub mod config;
pub mod identity;
pub mod link;
pub mod orchestrator;
pub mod platform;
pub mod protocol;
pub mod retry;
