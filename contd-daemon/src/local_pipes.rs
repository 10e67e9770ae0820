//! The local-pipes fast path (§6): when a CLI client runs on the same host
//! as the daemon, it can read/write a container's stdio through named
//! FIFOs under the OS temp directory instead of dialing the side-transport
//! and paying the mux/TCP round trip. Grounded in `original_source/pipes.go`
//! (`CreatePipes`/`OpenPipes`/`RemovePipes`), with `unix.Mkfifo` replaced
//! by `nix::unistd::mkfifo`.
//!
//! The daemon creates one triple per container unconditionally (the cost
//! is three `mkfifo` calls) and bridges it to the container's existing
//! stdin/stdout/stderr stream-ids the same way a remote CLI attachment
//! does: a second `MultiplexClient` joined to the service's real one by an
//! in-process transport (`tokio::io::duplex` standing in for the TCP
//! socket a remote client would dial), so a `Sender`/`Receiver` pair on
//! either client actually crosses to the other. A bare `Sender`/`Receiver`
//! pair created straight on the service's own client would never see each
//! other's traffic — broadcasting and fan-out both only happen across
//! registered `Mux` transports, and a local pipe triple has none of its
//! own unless this bridge gives it one.

use std::path::{Path, PathBuf};

use contd_mux::{Mux, MultiplexClient};
use contd_proto::{ContainerId, StreamId};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::{split, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::unix::pipe;

/// Size of the in-process duplex standing in for a real transport. Well
/// above the 8 KiB read buffer the pump loops use, so a single `poll_write`
/// never has to wait on the other side draining.
const LOOPBACK_BUF_SIZE: usize = 64 * 1024;

fn pipe_path(id: ContainerId) -> PathBuf {
    std::env::temp_dir().join(id.to_string())
}

struct PipeNames {
    r#in: PathBuf,
    out: PathBuf,
    err: PathBuf,
}

fn pipe_names(base: &Path) -> PipeNames {
    PipeNames {
        r#in: base.with_extension("in"),
        out: base.with_extension("out"),
        err: base.with_extension("err"),
    }
}

/// Creates the `.in`/`.out`/`.err` FIFO triple for `id`. Idempotent removal
/// is the caller's responsibility via [`remove`].
pub fn create(id: ContainerId) -> std::io::Result<()> {
    let names = pipe_names(&pipe_path(id));
    for path in [&names.out, &names.r#in, &names.err] {
        mkfifo(path.as_path(), Mode::from_bits_truncate(0o666)).map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    }
    Ok(())
}

pub fn remove(id: ContainerId) {
    let names = pipe_names(&pipe_path(id));
    for path in [&names.r#in, &names.out, &names.err] {
        let _ = std::fs::remove_file(path);
    }
}

/// Opens `path` with `O_RDWR`, the way `pipes.go`'s `OpenPipes` does —
/// opening a FIFO with both read and write access lets the open complete
/// immediately instead of blocking until a peer opens the opposite end.
fn open_rdwr(path: &Path) -> std::io::Result<std::fs::File> {
    let fd = nix::fcntl::open(path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    Ok(std::fs::File::from(fd))
}

/// Everything the bridge for one container keeps alive: the pump tasks,
/// plus the loopback mux pair wiring the local client to `mux_client`.
/// Dropping this tears the whole bridge down — both muxes close (stopping
/// their reader/writer tasks) and the three pumps are aborted.
pub struct Bridge {
    _tasks: Vec<contd_task::ChildTask<()>>,
    _local_mux: Mux,
    _daemon_mux: Mux,
}

/// Spawns the bidirectional bridge between `id`'s FIFO triple and its
/// mux-routed stream-ids.
///
/// A private [`MultiplexClient`] is created for the FIFO-facing end and
/// joined to `mux_client` — the one the container's real stdio already
/// lives on — by an in-process duplex transport registered as a `Mux` on
/// each side. Without a registered transport a `Sender`/`Receiver` pair
/// only ever talks to muxes on its own client: a bare pair created
/// straight on `mux_client` under the same stream-ids would never see the
/// container's own traffic, since broadcasting and fan-out both happen
/// across a mux's reader/writer tasks, not between two local endpoints of
/// the same client.
pub fn spawn_bridge(mux_client: &MultiplexClient, id: ContainerId) -> std::io::Result<Bridge> {
    let names = pipe_names(&pipe_path(id));
    let [stdin_id, stdout_id, stderr_id] = StreamId::triple(id);

    // `.in` carries bytes the CLI writes and the daemon reads, then
    // forwards into the container's stdin broadcast set; `.out`/`.err`
    // carry bytes the daemon writes (fed by the container's own
    // stdout/stderr) for the CLI to read.
    let stdin_fifo = pipe::Receiver::from_file(open_rdwr(&names.r#in)?)?;
    let stdout_fifo = pipe::Sender::from_file(open_rdwr(&names.out)?)?;
    let stderr_fifo = pipe::Sender::from_file(open_rdwr(&names.err)?)?;

    let local_client = MultiplexClient::new();
    let (daemon_side, local_side) = tokio::io::duplex(LOOPBACK_BUF_SIZE);
    let (daemon_read, daemon_write) = split(daemon_side);
    let (local_read, local_write) = split(local_side);
    let daemon_mux = mux_client.new_mux(daemon_read, daemon_write);
    let local_mux = local_client.new_mux(local_read, local_write);

    let stdin_sender = local_client.new_sender(stdin_id);
    let stdout_receiver = local_client.new_receiver(stdout_id);
    let stderr_receiver = local_client.new_receiver(stderr_id);

    let stdin_task = contd_task::ChildTask::spawn(pump_fifo_to_sender(stdin_fifo, stdin_sender));
    let stdout_task = contd_task::ChildTask::spawn(pump_receiver_to_fifo(stdout_receiver, stdout_fifo));
    let stderr_task = contd_task::ChildTask::spawn(pump_receiver_to_fifo(stderr_receiver, stderr_fifo));

    Ok(Bridge {
        _tasks: vec![stdin_task, stdout_task, stderr_task],
        _local_mux: local_mux,
        _daemon_mux: daemon_mux,
    })
}

async fn pump_fifo_to_sender(mut fifo: pipe::Receiver, sender: contd_mux::Sender) {
    let mut buf = [0u8; 8192];
    loop {
        match fifo.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if sender.write(bytes::Bytes::copy_from_slice(&buf[..n])).is_err() {
                    return;
                }
            }
        }
    }
}

async fn pump_receiver_to_fifo(mut receiver: contd_mux::Receiver, mut fifo: pipe::Sender) {
    let mut buf = [0u8; 8192];
    loop {
        match tokio::io::AsyncReadExt::read(&mut receiver, &mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if fifo.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_use_the_in_out_err_extensions_under_the_container_id() {
        let id = ContainerId::new();
        let names = pipe_names(&pipe_path(id));

        let base = std::env::temp_dir().join(id.to_string());
        assert_eq!(names.r#in, base.with_extension("in"));
        assert_eq!(names.out, base.with_extension("out"));
        assert_eq!(names.err, base.with_extension("err"));
    }
}
