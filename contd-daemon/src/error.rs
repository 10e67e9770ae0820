//! Daemon-internal error type and its conversion to `tonic::Status` at the
//! RPC boundary (§7). Everything below the RPC layer (launch, mux, io)
//! keeps its own error type; this one exists only to give the service
//! methods a single `?`-able return type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("malformed id: {0}")]
    InvalidId(#[from] contd_proto::IdError),

    #[error("no running container with id {0}")]
    UnknownContainer(contd_proto::ContainerId),

    #[error("no connection registered for client id {0}")]
    UnknownClient(contd_proto::ClientId),

    #[error("launch failed: {0}")]
    Launch(#[from] contd_launcher::LaunchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DaemonError> for tonic::Status {
    fn from(error: DaemonError) -> Self {
        match error {
            DaemonError::InvalidId(_) => tonic::Status::invalid_argument(error.to_string()),
            DaemonError::UnknownContainer(_) | DaemonError::UnknownClient(_) => tonic::Status::not_found(error.to_string()),
            DaemonError::Launch(_) | DaemonError::Io(_) => tonic::Status::internal(error.to_string()),
        }
    }
}
