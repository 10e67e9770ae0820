//! Side-transport listener (§4.10, §6): accepts raw TCP connections used
//! for bulk container stdio. Each connection starts with an 8-byte
//! length-prefixed client-id, then becomes a `contd_mux` transport for the
//! rest of its lifetime. Grounded in
//! `original_source/daemon/streaming.go`'s `acceptStreamConnections`.

use std::sync::Arc;

use contd_mux::MultiplexClient;
use contd_proto::ClientId;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};

use crate::registry::{ConnectionRegistry, ContainerRegistry};

/// Accepts connections until the listener itself errors (§7: the accept
/// failure is the one error fatal to the daemon).
pub async fn accept_loop(
    listener: TcpListener,
    mux_client: MultiplexClient,
    containers: Arc<ContainerRegistry>,
    connections: Arc<ConnectionRegistry>,
) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "accepted a streaming connection");

        let mux_client = mux_client.clone();
        let containers = Arc::clone(&containers);
        let connections = Arc::clone(&connections);
        tokio::spawn(async move {
            if let Err(error) = handle_connection(socket, mux_client, containers, connections).await {
                warn!(%peer, %error, "streaming connection setup failed");
            }
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    mux_client: MultiplexClient,
    containers: Arc<ContainerRegistry>,
    connections: Arc<ConnectionRegistry>,
) -> std::io::Result<()> {
    let client_id = read_client_id(&mut socket).await?;

    let (reader, writer) = tokio::io::split(socket);

    // Fires once the mux's reader task stops for any reason (peer
    // disconnect, transport error, or explicit `Kill`-driven teardown),
    // scrubbing `client_id` out of the connection registry and out of
    // every container's streamers map in one place (P5).
    let on_close_connections = Arc::clone(&connections);
    let on_close_containers = Arc::clone(&containers);
    let mux = mux_client.new_mux_with_on_close(reader, writer, move || {
        on_close_connections.remove(client_id);
        on_close_containers.remove_streamer_everywhere(client_id);
        info!(%client_id, "streaming client disconnected");
    });
    connections.insert(client_id, mux);

    info!(%client_id, "registered a mux for a streaming client");
    Ok(())
}

async fn read_client_id(socket: &mut TcpStream) -> std::io::Result<ClientId> {
    let len = socket.read_u64().await?;
    if len != 16 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, format!("expected a 16-byte client id, got length {len}")));
    }
    let mut bytes = [0u8; 16];
    socket.read_exact(&mut bytes).await?;
    Ok(ClientId::from_bytes(bytes))
}
