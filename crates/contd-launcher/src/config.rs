use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which namespaces a container shares with an already-running target
/// process, identified by its host pid.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedNamespaces {
    pub flags: NamespaceFlags,
    pub pid: i32,
}

impl SharedNamespaces {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

bitflags::bitflags! {
    /// Mirrors the clone-namespace set a container can either create fresh
    /// or join from a target process. Only `NET` is ever actually shared in
    /// practice (mounts are deliberately never shared), but the bit for
    /// every namespace kind is kept so the share set is explicit.
    #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub struct NamespaceFlags: u32 {
        const USER    = 0b0000001;
        const MOUNT   = 0b0000010;
        const UTS     = 0b0000100;
        const PID     = 0b0001000;
        const NET     = 0b0010000;
        const IPC     = 0b0100000;
        const CGROUP  = 0b1000000;
    }
}

/// Logging knobs for a single container's stdout/stderr tee.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Directory that will hold this container's `logs.log`.
    pub path: PathBuf,
}

/// Everything the launcher needs to start one container. Stdin/stdout/
/// stderr are handles owned by the caller (the daemon, wiring up
/// `Receiver`/`Sender` pipes); only the pieces that must cross the
/// init-pipe to the re-exec'd child are carried in [`InitPipeConfig`].
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub hostname: String,
    pub workdir: PathBuf,
    pub cmd: String,
    pub args: Vec<String>,
    pub interactive: bool,
    pub shared_namespaces: SharedNamespaces,
    pub logging: LoggingConfig,
}

/// The subset of [`LaunchConfig`] sent down the init pipe: everything the
/// child needs to finish its own setup once it has been re-exec'd as
/// `init`. Encoded with `bincode`, the compact binary serialization this
/// workspace already uses for process-to-process IPC payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitPipeConfig {
    pub hostname: String,
    pub workdir: PathBuf,
    pub interactive: bool,
    pub shared_namespaces: SharedNamespaces,
}

impl From<&LaunchConfig> for InitPipeConfig {
    fn from(config: &LaunchConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            workdir: config.workdir.clone(),
            interactive: config.interactive,
            shared_namespaces: config.shared_namespaces,
        }
    }
}

/// Name of the environment variable carrying the init pipe's read-end fd.
pub const INIT_PIPE_ENV: &str = "_LIBCONTAINER_INITPIPE";
/// First fd (inclusive) of the inherited shared-namespace fd range.
pub const NS_START_ENV: &str = "_NS_START";
/// Last fd (exclusive) of the inherited shared-namespace fd range.
pub const NS_END_ENV: &str = "_NS_END";
