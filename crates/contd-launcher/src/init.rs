//! Child-side init entry (§4.9): the process `/proc/self/exe init <cmd>
//! <args…>` re-execs into after `Launcher::start`'s `clone()` call.
//!
//! Grounded in `original_source/container/run_child.go`'s `RunChild` and
//! `tty/start.go`'s `Start`/`Snoop`: decode the init-pipe config, join any
//! namespaces shared from another container (`setns()` into the inherited
//! `_NS_START.._NS_END` fd range), finish the rest of namespace setup
//! (hostname, fresh `/proc`, workdir), then run the real command as a
//! child of this process rather than exec'ing over it, so cleanup
//! (unmounting `proc`) can run once it exits.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt as _;
use std::path::Path;

use nix::mount::{mount, umount, MsFlags};
use nix::unistd::sethostname;
use tokio::process::Command;

use crate::config::{InitPipeConfig, INIT_PIPE_ENV, NS_END_ENV, NS_START_ENV};
use crate::error::{LaunchError, Result};
use crate::pty::{Pty, RawModeGuard};

/// Decodes the [`InitPipeConfig`] the launcher wrote across the init pipe
/// named by [`INIT_PIPE_ENV`], matching `setup.go`'s `getEnv`.
fn read_init_config() -> Result<InitPipeConfig> {
    let fd_str = std::env::var(INIT_PIPE_ENV).map_err(|_| LaunchError::MissingEnv(INIT_PIPE_ENV))?;
    let fd: i32 = fd_str.parse().map_err(|_| LaunchError::MissingEnv(INIT_PIPE_ENV))?;
    let file = unsafe { std::fs::File::from_raw_fd(fd) };
    let config = bincode::deserialize_from(file).map_err(LaunchError::DecodeInitConfig)?;
    Ok(config)
}

/// Reads the `_NS_START`/`_NS_END` fd range `Launcher::start` wrote when
/// the container shares any namespaces, matching `setup.go`'s `getNses`.
/// Absent when nothing is shared, since `build_envp` only sets these two
/// variables `if has_shared_ns`.
fn read_shared_namespace_fd_range() -> Result<Option<(i32, i32)>> {
    let start = match std::env::var(NS_START_ENV) {
        Ok(value) => value.parse().map_err(|_| LaunchError::MissingEnv(NS_START_ENV))?,
        Err(_) => return Ok(None),
    };
    let end = std::env::var(NS_END_ENV)
        .map_err(|_| LaunchError::MissingEnv(NS_END_ENV))?
        .parse()
        .map_err(|_| LaunchError::MissingEnv(NS_END_ENV))?;
    Ok(Some((start, end)))
}

/// Runs the init entry: finishes namespace setup, starts `cmd`/`args` as
/// this process's child, and waits for it to exit, returning its exit
/// code. Mirrors `RunChild`'s control flow, including mounting `proc`
/// before the command runs and unmounting it (non-interactive path only,
/// matching the original) after.
pub async fn run_init(cmd: &str, args: &[String]) -> Result<i32> {
    let config = read_init_config()?;

    if let Some((ns_start, ns_end)) = read_shared_namespace_fd_range()? {
        crate::ns::join_shared_namespaces(config.shared_namespaces, ns_start, ns_end)?;
    }

    sethostname(&config.hostname).map_err(LaunchError::Namespace)?;
    std::env::set_current_dir("/").map_err(LaunchError::io("chdir to root before mounting proc"))?;
    mount(Some("proc"), "proc", Some("proc"), MsFlags::empty(), None::<&str>).map_err(LaunchError::Namespace)?;
    std::env::set_current_dir(&config.workdir).map_err(LaunchError::io("chdir to container workdir"))?;

    let status = if config.interactive {
        run_interactive(cmd, args).await?
    } else {
        run_plain(cmd, args).await?
    };

    if !config.interactive {
        std::env::set_current_dir("/").map_err(LaunchError::io("chdir to root before unmounting proc"))?;
        umount(Path::new("proc")).map_err(LaunchError::Namespace)?;
    }

    Ok(status)
}

/// Non-interactive path: the child inherits this process's own stdio
/// directly, the way `cmd.Stdin/Stdout/Stderr = os.Stdin/Stdout/Stderr`
/// does in `RunChild`.
async fn run_plain(cmd: &str, args: &[String]) -> Result<i32> {
    let mut child = Command::new(cmd)
        .args(args)
        .spawn()
        .map_err(LaunchError::io("spawning container command"))?;
    let status = child.wait().await.map_err(LaunchError::io("waiting for container command"))?;
    Ok(status.code().unwrap_or(128))
}

/// Interactive path: this process's own stdio is the outer PTY slave
/// handed down by the launcher. A second, inner PTY is opened here; the
/// real command gets its slave as a fresh controlling terminal (new
/// session, `setsid`+`TIOCSCTTY`), while this process snoops between its
/// own stdio and the inner master — matching `tty.Start`'s `Snoop`.
async fn run_interactive(cmd: &str, args: &[String]) -> Result<i32> {
    let own_stdin = unsafe { BorrowedFd::borrow_raw(0) };
    let own_stdout = unsafe { BorrowedFd::borrow_raw(1) };
    let backup = RawModeGuard::enable(own_stdin)?;

    let pty = Pty::open()?;
    backup.apply_saved_to(pty.slave.as_fd())?;
    crate::pty::propagate_window_size(own_stdin, pty.slave.as_fd());

    let stdin_dup: OwnedFd = own_stdin.try_clone_to_owned().map_err(LaunchError::io("duplicating own stdin"))?;
    let stdout_dup: OwnedFd = own_stdout.try_clone_to_owned().map_err(LaunchError::io("duplicating own stdout"))?;
    let slave_for_winch: OwnedFd = pty.slave.try_clone().map_err(LaunchError::io("cloning inner pty slave"))?.into();

    let sigwinch_task = crate::pty::spawn_sigwinch_forwarder(
        stdin_dup.try_clone().map_err(LaunchError::io("cloning own stdin"))?,
        slave_for_winch,
    );

    let master_read = pty.master.try_clone().map_err(LaunchError::io("cloning inner pty master"))?;
    let master_write = pty.master.try_clone().map_err(LaunchError::io("cloning inner pty master"))?;
    crate::pty::set_nonblocking(unsafe { BorrowedFd::borrow_raw(master_read.as_raw_fd()) })?;
    crate::pty::set_nonblocking(unsafe { BorrowedFd::borrow_raw(master_write.as_raw_fd()) })?;

    let snoop_out = contd_task::ChildTask::spawn(snoop_to_stdout(master_read, stdout_dup));
    let snoop_in = contd_task::ChildTask::spawn(snoop_from_stdin(master_write, stdin_dup));

    let slave_fd = pty.slave.as_raw_fd();
    let mut command = Command::new(cmd);
    command.args(args);
    unsafe {
        command.pre_exec(move || {
            if dup_onto(slave_fd, 0).is_err() || dup_onto(slave_fd, 1).is_err() || dup_onto(slave_fd, 2).is_err() {
                return Err(std::io::Error::last_os_error());
            }
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            set_controlling_tty(0)?;
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(LaunchError::io("spawning interactive container command"))?;
    let status = child.wait().await.map_err(LaunchError::io("waiting for container command"))?;

    drop(sigwinch_task);
    drop(snoop_out);
    drop(snoop_in);

    Ok(status.code().unwrap_or(128))
}

fn dup_onto(src: i32, dst: i32) -> std::result::Result<(), ()> {
    if src != dst && unsafe { libc::dup2(src, dst) } < 0 {
        return Err(());
    }
    Ok(())
}

nix::ioctl_write_int_bad!(ioctl_set_ctty, libc::TIOCSCTTY);

fn set_controlling_tty(fd: i32) -> std::io::Result<()> {
    unsafe { ioctl_set_ctty(fd, 0) }.map(|_| ()).map_err(std::io::Error::from)
}

async fn snoop_to_stdout(master: std::fs::File, stdout: OwnedFd) {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    crate::pty::set_nonblocking(stdout.as_fd()).ok();
    let Ok(mut reader) = tokio::net::unix::pipe::Receiver::from_file(master) else {
        return;
    };
    let Ok(mut writer) = tokio::net::unix::pipe::Sender::from_file(std::fs::File::from(stdout)) else {
        return;
    };
    let mut buf = [0u8; 2048];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn snoop_from_stdin(master: std::fs::File, stdin: OwnedFd) {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    crate::pty::set_nonblocking(stdin.as_fd()).ok();
    let Ok(mut reader) = tokio::net::unix::pipe::Receiver::from_file(std::fs::File::from(stdin)) else {
        return;
    };
    let Ok(mut writer) = tokio::net::unix::pipe::Sender::from_file(master) else {
        return;
    };
    let mut buf = [0u8; 2048];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

