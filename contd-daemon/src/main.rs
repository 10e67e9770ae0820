//! Daemon entry point (§2, §4.9): dispatches to the child-side init entry
//! when re-exec'd as `init`, otherwise boots the RPC service. Grounded in
//! `original_source/cmd/daemon/main.go`'s top-level dispatch and in
//! `jetsocat`'s `run`/`exit` helpers for the async-main/exit-code plumbing.

#[macro_use]
extern crate tracing;

use std::sync::Arc;

use camino::Utf8PathBuf;
use contd_daemon::{ConnectionRegistry, ContainerRegistry, ContdConfig, ContdService, EventRegistry};
use contd_proto::rpc::contd_server::ContdServer;
use tokio::net::TcpListener;
use tokio::runtime;

fn main() {
    let mut args = std::env::args();
    let _argv0 = args.next();

    if args.next().as_deref() == Some("init") {
        let rest: Vec<String> = args.collect();
        let cmd = rest.first().cloned().unwrap_or_default();
        let cmd_args = rest.get(1..).map(<[String]>::to_vec).unwrap_or_default();

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime build failed");

        let code = match rt.block_on(contd_launcher::run_init(&cmd, &cmd_args)) {
            Ok(code) => code,
            Err(error) => {
                eprintln!("{error:?}");
                128
            }
        };
        std::process::exit(code);
    }

    exit(run());
}

fn run() -> anyhow::Result<()> {
    let config = ContdConfig::load(std::env::var_os("CONTD_CONFIG").map(|value| Utf8PathBuf::from(value.to_string_lossy().into_owned())).as_deref())?;

    let _log_guard = contd_log::init::<ContdConfig>(&config.log_dir, &config.log_filter, std::env::var("CONTD_LOG_DEBUG").ok().as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting contd");

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(serve(config))
}

async fn serve(config: ContdConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.container_log_root)?;

    let (shutdown_handle, shutdown_signal) = contd_task::ShutdownHandle::new();
    let _log_retention_task = contd_task::spawn_task(contd_log::LogRetentionTask::<ContdConfig>::new(config.container_log_root.clone()), shutdown_signal);

    let mux_client = contd_mux::MultiplexClient::new();
    let containers = Arc::new(ContainerRegistry::default());
    let events = Arc::new(EventRegistry::default());
    let connections = Arc::new(ConnectionRegistry::default());

    let streaming_listener = TcpListener::bind(&config.streaming_bind).await?;
    info!(addr = %config.streaming_bind, "streaming listener bound");

    tokio::spawn({
        let mux_client = mux_client.clone();
        let containers = Arc::clone(&containers);
        let connections = Arc::clone(&connections);
        async move {
            if let Err(error) = contd_daemon::side_transport::accept_loop(streaming_listener, mux_client, containers, connections).await {
                error!(%error, "streaming listener stopped accepting connections");
            }
        }
    });

    let service = ContdService::new(mux_client, containers, events, connections, config.container_log_root.clone());

    let api_addr: std::net::SocketAddr = config.api_bind.parse()?;
    info!(addr = %config.api_bind, "api listener bound");

    tokio::select! {
        result = tonic::transport::Server::builder().add_service(ContdServer::new(service)).serve(api_addr) => {
            result?;
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received ctrl-c, shutting down");
        }
    }

    shutdown_handle.signal();

    Ok(())
}

fn exit(result: anyhow::Result<()>) -> ! {
    match result {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("{error:?}");
            std::process::exit(1);
        }
    }
}
