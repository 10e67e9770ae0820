use core::fmt;

use uuid::Uuid;

/// A container's identity. Freshly generated on every `Run`, 128 bits, opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(Uuid);

/// A client's identity. Freshly generated on every connect to the side transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

macro_rules! impl_opaque_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            pub fn as_bytes(&self) -> [u8; 16] {
                *self.0.as_bytes()
            }

            pub fn parse(value: &[u8]) -> Result<Self, IdError> {
                let bytes: [u8; 16] = value.try_into().map_err(|_| IdError::WrongLength(value.len()))?;
                Ok(Self::from_bytes(bytes))
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

impl_opaque_id!(ContainerId);
impl_opaque_id!(ClientId);

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("expected a 16-byte id, got {0} bytes")]
    WrongLength(usize),
}

/// Index of one of the three standard streams within a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdioKind {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl StdioKind {
    pub const ALL: [StdioKind; 3] = [StdioKind::Stdin, StdioKind::Stdout, StdioKind::Stderr];
}

/// `"<container-id>-<index>"`. The textual form is the wire key; there is no
/// separate numeric tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(container_id: ContainerId, kind: StdioKind) -> Self {
        Self(format!("{container_id}-{}", kind as u8))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All three canonical stream-ids owned by a container, in stdin/stdout/stderr order.
    pub fn triple(container_id: ContainerId) -> [StreamId; 3] {
        StdioKind::ALL.map(|kind| StreamId::new(container_id, kind))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_triple_is_indexed_by_kind() {
        let container_id = ContainerId::new();
        let [stdin, stdout, stderr] = StreamId::triple(container_id);
        assert_eq!(stdin.as_str(), format!("{container_id}-0"));
        assert_eq!(stdout.as_str(), format!("{container_id}-1"));
        assert_eq!(stderr.as_str(), format!("{container_id}-2"));
    }

    #[test]
    fn round_trips_through_bytes() {
        let id = ContainerId::new();
        let parsed = ContainerId::parse(&id.as_bytes()).unwrap();
        assert_eq!(id, parsed);
    }
}
