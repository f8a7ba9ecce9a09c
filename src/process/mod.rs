//! Spawned service instances: ports, generated files and lifecycle

pub mod genesis;
pub mod ports;
pub mod supervisor;

pub use ports::PortAllocator;
pub use supervisor::{LaunchSpec, ProcessHandle, ServicePorts};
