//! The stream multiplexer: fans packets tagged with a textual stream-id out
//! by M-writers-to-N-readers over any number of transport connections,
//! tracking ownership so that closing one transport only tears down the
//! streams it created.

#[macro_use]
extern crate tracing;

mod client;
mod error;
mod mux;
mod pipe;
mod stream;

pub use client::MultiplexClient;
pub use error::MuxError;
pub use mux::{Mux, MuxId};
pub use pipe::Closed as PipeClosed;
pub use stream::{Receiver, Sender, Stream};
