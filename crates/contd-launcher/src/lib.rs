//! Namespace-isolated process launcher (§4.6-§4.9): PTY allocation,
//! namespace/clone-flag setup, the parent-side container launch
//! sequence, and the child-side init entry it re-execs into.

#[macro_use]
extern crate tracing;

mod config;
mod error;
mod init;
mod launcher;
mod logging;
mod ns;
mod pty;

pub use config::{InitPipeConfig, LaunchConfig, LoggingConfig, NamespaceFlags, SharedNamespaces};
pub use error::{LaunchError, Result};
pub use init::run_init;
pub use launcher::{ContainerProcess, LaunchIo, Launcher};
pub use pty::Pty;
