use bytes::Bytes;

use crate::ids::ContainerId;
use crate::rpc;

/// Domain-level lifecycle event, independent of the gRPC wire encoding.
/// Ordering `Created ≺ Started ≺ (Done|Killed)`, or a singleton `Failed`, is
/// enforced by whoever publishes these, not by this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Failed { message: String },
    Created,
    Started,
    Done { message: String },
    Killed,
}

impl Event {
    pub fn into_rpc(self, container_id: ContainerId) -> rpc::Event {
        let (r#type, message) = match self {
            Event::Failed { message } => (rpc::EventType::Failed, message),
            Event::Created => (rpc::EventType::Created, String::new()),
            Event::Started => (rpc::EventType::Started, String::new()),
            Event::Done { message } => (rpc::EventType::Done, message),
            Event::Killed => (rpc::EventType::Killed, String::new()),
        };

        rpc::Event {
            id: container_id.as_bytes().to_vec(),
            r#type: r#type as i32,
            message,
            source: String::new(),
            data: Bytes::new().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_wire_enum() {
        let container_id = ContainerId::new();
        let rpc_event = Event::Done {
            message: "exit 0".into(),
        }
        .into_rpc(container_id);
        assert_eq!(rpc_event.r#type, rpc::EventType::Done as i32);
        assert_eq!(rpc_event.message, "exit 0");
        assert_eq!(rpc_event.id, container_id.as_bytes().to_vec());
    }
}
