//! Adapts a [`contd_mux::Sender`] (a synchronous, fan-out broadcast write)
//! into `tokio::io::AsyncWrite` so a container's stdout/stderr can be
//! plugged directly into `contd_launcher::LaunchIo`, which expects boxed
//! `AsyncWrite` handles. `Sender::write` never blocks — it hands the
//! payload to each mux's unbounded outbound queue and returns — so the
//! adapter can report every poll as immediately ready.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use contd_mux::Sender;
use tokio::io::AsyncWrite;

pub struct SenderWriter {
    sender: Sender,
}

impl SenderWriter {
    pub fn new(sender: Sender) -> Self {
        Self { sender }
    }
}

impl AsyncWrite for SenderWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.sender.write(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sender closed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.sender.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contd_mux::MultiplexClient;
    use contd_proto::{ContainerId, StdioKind, StreamId};
    use tokio::io::{split, AsyncWriteExt as _};

    /// Mirrors the real topology: a "daemon" client broadcasting a
    /// container's stdout over its one registered mux, and a "CLI" client
    /// on the other end of that transport receiving it.
    #[tokio::test]
    async fn writes_reach_a_receiver_on_the_far_side_of_the_mux() {
        let daemon_client = MultiplexClient::new();
        let cli_client = MultiplexClient::new();

        let (a, b) = tokio::io::duplex(4096);
        let (a_read, a_write) = split(a);
        let (b_read, b_write) = split(b);

        let _daemon_mux = daemon_client.new_mux(a_read, a_write);
        let _cli_mux = cli_client.new_mux(b_read, b_write);

        let id = StreamId::new(ContainerId::new(), StdioKind::Stdout);
        let mut receiver = cli_client.new_receiver(id.clone());
        let mut writer = SenderWriter::new(daemon_client.new_sender(id));

        writer.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut receiver, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
