#![warn(missing_docs)]

//! netrdma transport: zero-copy RDMA connection setup and completion events.
//!
//! Two cooperating processes open a [`DeviceContext`], register a shared
//! [`MemoryRegion`], rendezvous through a [`SideChannel`] to bring up a
//! reliable-connected queue pair each, and then feed hardware completions
//! into an ordinary readiness-based event loop through a
//! [`CompletionBridge`]. [`RdmaTransport`] bundles that sequence.
//!
//! All hardware access goes through the [`Verbs`] trait. [`SimFabric`]
//! implements it in software for hosts without RDMA hardware.

pub mod bridge;
pub mod config;
pub mod deadline;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod rendezvous;
pub mod sidechannel;
pub mod sim;
pub mod transport;
pub mod verbs;
pub mod wire;

pub use bridge::{CompletionBridge, CompletionKind, CompletionRecord, CompletionStatus};
pub use config::RdmaConfig;
pub use device::{DeviceContext, ResourceCounts};
pub use endpoint::{ConnectionEndpoint, EndpointState, Role};
pub use error::{ErrorKind, RdmaError, Result};
pub use memory::{MemoryRegion, RegionDescriptor};
pub use rendezvous::Establishment;
pub use sidechannel::{FileSideChannel, MemorySideChannel, SideChannel, Slot};
pub use sim::{SimFabric, SimFabricConfig, SimPort};
pub use transport::RdmaTransport;
pub use verbs::Verbs;
pub use wire::ConnectionInfo;
