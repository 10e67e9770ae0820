//! Thin gRPC client plus the two attach strategies (§6): local FIFOs when
//! the daemon runs on the same host, the mux/side-transport for everything
//! else. Grounded in `original_source/cmd/common.go`'s `setupLocalPipes` /
//! `setupRemotePipes` split and in `contd-daemon::service` for the RPC
//! shapes this drives.

use anyhow::Context as _;
use contd_proto::rpc::contd_client::ContdClient;
use contd_proto::rpc::{ContainerId as RpcContainerId, ContainerOpts, ContainerRequest, Event as RpcEvent, EventType, PsRequest, ShareOptions, StreamBindingRequest};
use contd_proto::StreamId;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tonic::transport::Channel;
use uuid::Uuid;

pub const DEFAULT_API_PORT: u16 = 9000;
pub const DEFAULT_STREAMING_PORT: u16 = 9001;

pub struct RunOptions {
    pub name: String,
    pub hostname: String,
    pub workdir: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub interactive: bool,
    pub detached: bool,
    pub share_ns: Option<Uuid>,
}

pub async fn connect(host: &str) -> anyhow::Result<ContdClient<Channel>> {
    let endpoint = format!("http://{host}:{DEFAULT_API_PORT}");
    debug!(%host, "connecting to daemon");
    let client = ContdClient::connect(endpoint).await.with_context(|| format!("couldn't reach contd daemon at {host}"))?;
    Ok(client)
}

pub async fn run(host: &str, opts: RunOptions) -> anyhow::Result<()> {
    let mut client = connect(host).await?;

    let share = opts.share_ns.map(|id| ShareOptions {
        flags: 0,
        share_id: id.as_bytes().to_vec(),
    });

    let request = ContainerRequest {
        name: opts.name,
        hostname: opts.hostname,
        workdir: opts.workdir,
        cmd: opts.cmd,
        args: opts.args,
        opts: Some(ContainerOpts {
            interactive: opts.interactive,
            share,
        }),
    };

    let response = client.run(request).await?.into_inner();
    let container_id = Uuid::from_slice(&response.uuid).context("daemon returned a malformed container id")?;
    info!(%container_id, "launched");
    println!("{container_id}");

    if opts.detached {
        return Ok(());
    }

    attach(host, &mut client, container_id, opts.interactive).await
}

pub async fn ps(host: &str) -> anyhow::Result<()> {
    let mut client = connect(host).await?;
    let response = client.ps(PsRequest {}).await?.into_inner();

    println!("{:<36}  {:<20}  {:>8}  CMD", "ID", "NAME", "PID");
    for process in response.processes {
        println!("{:<36}  {:<20}  {:>8}  {}", process.id, process.name, process.pid, process.cmd);
    }

    Ok(())
}

pub async fn kill(host: &str, container_id: Uuid) -> anyhow::Result<()> {
    let mut client = connect(host).await?;
    client
        .kill(RpcContainerId {
            id: container_id.as_bytes().to_vec(),
        })
        .await?;
    Ok(())
}

pub async fn attach_standalone(host: &str, container_id: Uuid, interactive: bool) -> anyhow::Result<()> {
    let mut client = connect(host).await?;
    attach(host, &mut client, container_id, interactive).await
}

/// Streams the container's stdio and its lifecycle events concurrently;
/// returns once `Events` terminates (a `Done`/`Killed`/`Failed` event, or
/// the stream itself closing), matching §6's "Events termination causes
/// run/attach to unblock".
async fn attach(host: &str, client: &mut ContdClient<Channel>, container_id: Uuid, interactive: bool) -> anyhow::Result<()> {
    let events = client
        .events(RpcContainerId {
            id: container_id.as_bytes().to_vec(),
        })
        .await?
        .into_inner();

    let io = if host == "localhost" {
        spawn_local_io(container_id).await?
    } else {
        spawn_remote_io(host, container_id).await?
    };

    let _ = interactive;
    let exit_message = drain_events(events).await?;
    io.abort();

    if let Some(message) = exit_message {
        anyhow::bail!(message);
    }

    Ok(())
}

struct IoTasks {
    tasks: Vec<tokio::task::JoinHandle<()>>,
    // Kept alive for the attach session: dropping a `Mux` tears down its
    // reader/writer tasks immediately (see `contd_mux::Mux`'s `Drop` impl).
    _mux: Option<contd_mux::Mux>,
}

impl IoTasks {
    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn spawn_local_io(container_id: Uuid) -> anyhow::Result<IoTasks> {
    let pipes = crate::pipes::open(container_id).await?;
    let crate::pipes::LocalPipes { mut stdin, mut stdout, mut stderr } = pipes;

    let to_container = tokio::spawn(async move {
        let mut input = tokio::io::stdin();
        let mut buf = [0u8; 8192];
        loop {
            match input.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stdin.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let from_stdout = tokio::spawn(async move {
        let mut output = tokio::io::stdout();
        let mut buf = [0u8; 8192];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if output.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                    let _ = output.flush().await;
                }
            }
        }
    });

    let from_stderr = tokio::spawn(async move {
        let mut output = tokio::io::stderr();
        let mut buf = [0u8; 8192];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if output.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    Ok(IoTasks {
        tasks: vec![to_container, from_stdout, from_stderr],
        _mux: None,
    })
}

async fn spawn_remote_io(host: &str, container_id: Uuid) -> anyhow::Result<IoTasks> {
    let mux_client = contd_mux::MultiplexClient::new();
    let client_id = contd_proto::ClientId::new();

    let mut socket = TcpStream::connect((host, DEFAULT_STREAMING_PORT)).await.context("couldn't dial the streaming port")?;
    socket.write_u64(16).await?;
    socket.write_all(&client_id.as_bytes()).await?;

    let (reader, writer) = tokio::io::split(socket);
    let mux = mux_client.new_mux(reader, writer);

    let mut api = connect(host).await?;
    let (request_tx, request_rx) = tokio::sync::mpsc::channel(1);
    request_tx
        .send(StreamBindingRequest {
            container_id: container_id.as_bytes().to_vec(),
            client_id: client_id.as_bytes().to_vec(),
        })
        .await
        .ok();
    drop(request_tx);

    let mut bindings = api
        .request_stream(tokio_stream::wrappers::ReceiverStream::new(request_rx))
        .await?
        .into_inner();

    let binding = tokio_stream::StreamExt::next(&mut bindings)
        .await
        .context("daemon closed the stream-binding reply before answering")??;

    let stdin_sender = mux_client.new_sender(StreamId::from(binding.in_id));
    let mut stdout_receiver = mux_client.new_receiver(StreamId::from(binding.out_id));
    let mut stderr_receiver = mux_client.new_receiver(StreamId::from(binding.err_id));

    let to_container = tokio::spawn(async move {
        let mut input = tokio::io::stdin();
        let mut buf = [0u8; 8192];
        loop {
            match input.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stdin_sender.write(bytes::Bytes::copy_from_slice(&buf[..n])).is_err() {
                        return;
                    }
                }
            }
        }
    });

    let from_stdout = tokio::spawn(async move {
        let mut output = tokio::io::stdout();
        let mut buf = [0u8; 8192];
        loop {
            match stdout_receiver.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if output.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                    let _ = output.flush().await;
                }
            }
        }
    });

    let from_stderr = tokio::spawn(async move {
        let mut output = tokio::io::stderr();
        let mut buf = [0u8; 8192];
        loop {
            match stderr_receiver.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if output.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    Ok(IoTasks {
        tasks: vec![to_container, from_stdout, from_stderr],
        _mux: Some(mux),
    })
}

/// Consumes the event stream, printing lifecycle transitions to stderr the
/// way a terminal-attached CLI would; returns `Some(message)` if the
/// terminal event was `Failed`, signalling a non-zero exit.
async fn drain_events(mut events: tonic::Streaming<RpcEvent>) -> anyhow::Result<Option<String>> {
    while let Some(event) = events.message().await? {
        match EventType::try_from(event.r#type).unwrap_or(EventType::Failed) {
            EventType::Created => eprintln!("created"),
            EventType::Started => eprintln!("started"),
            EventType::Done => return Ok(None),
            EventType::Killed => return Ok(None),
            EventType::Failed => return Ok(Some(event.message)),
        }
    }

    Ok(None)
}
