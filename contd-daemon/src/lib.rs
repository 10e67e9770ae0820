//! Container manager daemon: RPC service, registries, side-transport
//! listener, local FIFO fast path (§2, §4.10).

#[macro_use]
extern crate tracing;

pub mod config;
pub mod error;
pub mod local_pipes;
pub mod registry;
pub mod sender_writer;
pub mod service;
pub mod side_transport;

pub use config::ContdConfig;
pub use error::DaemonError;
pub use registry::{ConnectionRegistry, ContainerRegistry, EventRegistry};
pub use service::ContdService;
