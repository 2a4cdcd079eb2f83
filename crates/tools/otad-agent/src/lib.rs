//! Over-the-air update agent for A/B partitioned systems.
//!
//! A client uploads an update bundle over HTTP; the agent validates it,
//! writes it to the currently unused root partition, verifies the write,
//! and atomically switches the boot target. The running system is never
//! written to, so a failed update leaves the device bootable.

pub mod config;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod session;
pub mod validate;
