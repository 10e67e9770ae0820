use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("io error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("namespace operation failed: {0}")]
    Namespace(#[source] nix::Error),

    #[error("pty setup failed: {0}")]
    Pty(#[source] nix::Error),

    #[error("cannot encode init pipe config: {0}")]
    EncodeInitConfig(#[source] bincode::Error),

    #[error("cannot decode init pipe config: {0}")]
    DecodeInitConfig(#[source] bincode::Error),

    #[error("missing or malformed {0} environment variable")]
    MissingEnv(&'static str),

    #[error("process exited without a status")]
    NoExitStatus,
}

impl LaunchError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| LaunchError::Io { context, source }
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;
