use bytes::Bytes;
use contd_mux::MultiplexClient;
use contd_proto::StreamId;
use tokio::io::{duplex, AsyncReadExt as _};
use tokio::time::{timeout, Duration};

#[tokio::test]
async fn payload_written_on_one_mux_is_received_on_the_peer() {
    let sender_client = MultiplexClient::new();
    let receiver_client = MultiplexClient::new();

    let (a, b) = duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let sender_mux = sender_client.new_mux(a_read, a_write);
    let _receiver_mux = receiver_client.new_mux(b_read, b_write);

    let id = StreamId::from("container-1-1");
    let mut receiver = receiver_client.new_receiver(id.clone());
    let sender = sender_client.new_sender(id);

    sender.write(Bytes::from_static(b"hello")).unwrap();

    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(1), receiver.read_exact(&mut buf))
        .await
        .expect("did not receive payload in time")
        .unwrap();
    assert_eq!(&buf, b"hello");

    drop(sender_mux);
}

#[tokio::test]
async fn two_streams_do_not_interleave_payloads() {
    let sender_client = MultiplexClient::new();
    let receiver_client = MultiplexClient::new();

    let (a, b) = duplex(256 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let _sender_mux = sender_client.new_mux(a_read, a_write);
    let _receiver_mux = receiver_client.new_mux(b_read, b_write);

    let big_id = StreamId::from("container-1-1");
    let small_id = StreamId::from("container-2-1");

    let mut big_receiver = receiver_client.new_receiver(big_id.clone());
    let mut small_receiver = receiver_client.new_receiver(small_id.clone());

    let big_sender = sender_client.new_sender(big_id);
    let small_sender = sender_client.new_sender(small_id);

    let big_payload = Bytes::from(vec![0xAAu8; 100 * 1024]);
    big_sender.write(big_payload.clone()).unwrap();
    small_sender.write(Bytes::from_static(b"tick")).unwrap();

    let mut small_buf = [0u8; 4];
    timeout(Duration::from_secs(1), small_receiver.read_exact(&mut small_buf))
        .await
        .expect("small payload not received in time")
        .unwrap();
    assert_eq!(&small_buf, b"tick");

    let mut big_buf = vec![0u8; big_payload.len()];
    timeout(Duration::from_secs(1), big_receiver.read_exact(&mut big_buf))
        .await
        .expect("big payload not received in time")
        .unwrap();
    assert_eq!(big_buf, big_payload.to_vec());
}

#[tokio::test]
async fn on_close_fires_once_when_the_mux_is_explicitly_closed() {
    let client_a = MultiplexClient::new();
    let client_b = MultiplexClient::new();

    let (a, b) = duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
    let mux_a = client_a.new_mux_with_on_close(a_read, a_write, move || {
        closed_tx.send(()).unwrap();
    });
    let _mux_b = client_b.new_mux(b_read, b_write);

    mux_a.close();

    timeout(Duration::from_secs(1), closed_rx.recv()).await.expect("on_close did not fire in time").unwrap();
    assert!(closed_rx.try_recv().is_err(), "on_close fired more than once");
}

#[tokio::test]
async fn on_close_fires_when_the_peer_disconnects() {
    let client_a = MultiplexClient::new();
    let client_b = MultiplexClient::new();

    let (a, b) = duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
    let _mux_a = client_a.new_mux_with_on_close(a_read, a_write, move || {
        closed_tx.send(()).unwrap();
    });
    let mux_b = client_b.new_mux(b_read, b_write);

    drop(mux_b);

    timeout(Duration::from_secs(1), closed_rx.recv()).await.expect("on_close did not fire in time").unwrap();
}

#[tokio::test]
async fn closing_a_mux_ends_the_streams_it_owns() {
    let client_a = MultiplexClient::new();
    let client_b = MultiplexClient::new();

    let (a, b) = duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let mux_a = client_a.new_mux(a_read, a_write);
    let _mux_b = client_b.new_mux(b_read, b_write);

    let id = StreamId::from("container-3-0");
    let mut owned_stream = mux_a.new_stream(id);

    mux_a.close();

    let mut out = Vec::new();
    timeout(Duration::from_secs(1), owned_stream.read_to_end(&mut out))
        .await
        .expect("stream did not observe eof in time")
        .unwrap();
    assert!(out.is_empty());
}
