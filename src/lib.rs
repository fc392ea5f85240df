//! Network quality monitoring and IP delivery-mode testing.
//!
//! [`scheduler::MonitorScheduler`] measures throughput, latency statistics
//! and HTTP responsiveness on a fixed interval.
//! [`packet::PacketTestEngine`] runs continuous unicast, broadcast,
//! multicast and anycast probes, each with its own lifecycle.
//! [`upnp::UpnpController`] discovers the gateway and manages port
//! mappings.

pub mod config;
pub mod errors;
pub mod measurements;
pub mod net;
pub mod packet;
pub mod persistence;
pub mod probes;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod tools;
pub mod upnp;
