//! Wire types shared by the daemon and every client: opaque ids, the
//! multiplexer's frame format, and the generated RPC surface.

pub mod event;
pub mod ids;
pub mod packet;

pub use event::Event;
pub use ids::{ClientId, ContainerId, IdError, StdioKind, StreamId};
pub use packet::{FrameError, Packet, PacketCodec, MAX_PAYLOAD_LEN};

/// Generated from `proto/contd.proto` by `build.rs`.
pub mod rpc {
    tonic::include_proto!("contd");
}
