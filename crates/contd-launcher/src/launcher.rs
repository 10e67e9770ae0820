//! Parent-side container launch (§4.8) and the process handle it returns.
//!
//! Grounded in `original_source/container/run.go`'s `Start`/`Run`: build
//! the re-exec command, tee stdout/stderr through the log file, open a
//! PTY when interactive, set the clone flags and id mappings, hand the
//! child its init-pipe config, start it.

use std::ffi::CString;
use std::io::Write as _;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;
use std::pin::Pin;

use nix::fcntl::OFlag;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execve, pipe, pipe2, read, write, Pid};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;

use crate::config::{InitPipeConfig, LaunchConfig, INIT_PIPE_ENV, NS_END_ENV, NS_START_ENV};
use crate::error::{LaunchError, Result};
use crate::logging::LogTee;
use crate::ns;

const CLONE_STACK_SIZE: usize = 1024 * 1024;
const REEXEC_SELF: &str = "/proc/self/exe";

/// The caller-owned ends of a container's standard streams. Stdin is read
/// by the launcher and forwarded to the child; stdout/stderr are written
/// by the launcher as it tees the child's output through the log file.
pub struct LaunchIo {
    pub stdin: Pin<Box<dyn AsyncRead + Send>>,
    pub stdout: Pin<Box<dyn AsyncWrite + Send>>,
    pub stderr: Pin<Box<dyn AsyncWrite + Send>>,
}

/// A running container process.
pub struct ContainerProcess {
    pid: Pid,
    _stack: Box<[u8]>,
    _tasks: Vec<contd_task::ChildTask<()>>,
}

impl ContainerProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Sends `SIGKILL` to the container process, the way `Kill`'s
    /// cancellation handle terminates a running container.
    pub fn kill(&self) -> Result<()> {
        signal::kill(self.pid, Signal::SIGKILL).map_err(LaunchError::Namespace)
    }

    /// Blocks (on the calling blocking-pool thread) until the process
    /// exits, returning its exit code (or `128 + signal` if killed).
    pub async fn wait(self) -> Result<i32> {
        let pid = self.pid;
        tokio::task::spawn_blocking(move || match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(128 + sig as i32),
            Ok(_) => Err(LaunchError::NoExitStatus),
            Err(error) => Err(LaunchError::Namespace(error)),
        })
        .await
        .map_err(|_| LaunchError::NoExitStatus)?
    }
}

pub struct Launcher;

impl Launcher {
    /// `Start`: see module docs. Returns once the process has been
    /// created; does not wait for it to finish.
    pub fn start(config: LaunchConfig, io: LaunchIo) -> Result<ContainerProcess> {
        let log_tee_out = LogTee::create(&config.logging)?;
        let log_tee_err = LogTee::create(&config.logging)?;

        let ns_files = ns::open_shared_namespace_files(config.shared_namespaces)?;
        let flags = ns::clone_flags(config.shared_namespaces);
        let creates_user_ns = flags.contains(CloneFlags::CLONE_NEWUSER);

        let init_config = InitPipeConfig::from(&config);
        let (init_pipe_read, init_pipe_write) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Namespace)?;
        let (sync_read, sync_write) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Namespace)?;

        let ns_start_fd: i32 = 3;
        let ns_end_fd = ns_start_fd + ns_files.len() as i32;
        let init_pipe_fd = ns_end_fd;

        let argv = build_argv(&config.cmd, &config.args)?;
        let envp = build_envp(init_pipe_fd, ns_start_fd, ns_end_fd, !ns_files.is_empty())?;

        let (stdio_child_fds, stdio_tasks) = wire_stdio(&config, io, log_tee_out, log_tee_err)?;

        let mut child_ns_fds: Vec<OwnedFd> = ns_files.into_iter().map(OwnedFd::from).collect();
        let mut child_init_read = Some(init_pipe_read);
        let mut child_sync_read = Some(sync_read);
        let mut child_stdio = Some(stdio_child_fds);

        let mut stack = vec![0u8; CLONE_STACK_SIZE].into_boxed_slice();

        let cb = Box::new(move || -> isize {
            let mut byte = [0u8; 1];
            let _ = read(child_sync_read.take().unwrap().into_raw_fd(), &mut byte);

            if let Some([in_fd, out_fd, err_fd]) = child_stdio.take() {
                for (fd, target) in [(in_fd, 0), (out_fd, 1), (err_fd, 2)] {
                    let raw = fd.into_raw_fd();
                    if dup2(raw, target).is_err() {
                        unsafe { libc::_exit(126) };
                    }
                    if raw != target {
                        let _ = close(raw);
                    }
                }
            }

            for (offset, fd) in child_ns_fds.drain(..).enumerate() {
                let target = ns_start_fd + offset as i32;
                let raw = fd.into_raw_fd();
                let _ = dup2(raw, target);
                if raw != target {
                    let _ = close(raw);
                }
            }

            let raw = child_init_read.take().unwrap().into_raw_fd();
            let _ = dup2(raw, init_pipe_fd);
            if raw != init_pipe_fd {
                let _ = close(raw);
            }

            match execve(argv[0].as_c_str(), &argv, &envp) {
                Ok(_) => unreachable!("execve does not return on success"),
                Err(_) => unsafe { libc::_exit(127) },
            }
        });

        // SAFETY: the callback only calls async-signal-safe operations
        // (read/dup2/close/execve) before replacing the process image.
        let pid = unsafe { clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(LaunchError::Namespace)?;

        if creates_user_ns {
            write_id_mappings(pid)?;
        }
        let _ = write(&sync_write, &[0u8]);
        let _ = close(sync_write.into_raw_fd());

        write_init_config(init_pipe_write, &init_config)?;

        Ok(ContainerProcess { pid, _stack: stack, _tasks: stdio_tasks })
    }

    /// `Run` = `Start` + wait.
    pub async fn run(config: LaunchConfig, io: LaunchIo) -> Result<i32> {
        Self::start(config, io)?.wait().await
    }
}

/// Sets up the child's stdio. Non-interactive: three plain pipes. Interactive:
/// a PTY whose slave becomes all three of the child's standard descriptors,
/// with forwarders between the caller's stdio and the master (§4.8 step 3).
fn wire_stdio(
    config: &LaunchConfig,
    io: LaunchIo,
    log_tee_out: LogTee,
    log_tee_err: LogTee,
) -> Result<([OwnedFd; 3], Vec<contd_task::ChildTask<()>>)> {
    if config.interactive {
        let pty = crate::pty::Pty::open()?;
        crate::pty::set_nonblocking(pty.master.as_fd())?;

        let slave_fd = OwnedFd::from(pty.slave.try_clone().map_err(LaunchError::io("cloning pty slave"))?);
        let slave_fd2 = OwnedFd::from(pty.slave.try_clone().map_err(LaunchError::io("cloning pty slave"))?);

        let master_reader = pipe::Receiver::from_file(
            pty.master.try_clone().map_err(LaunchError::io("cloning pty master for reading"))?,
        )
        .map_err(LaunchError::io("wrapping pty master as async reader"))?;
        let master_writer = pipe::Sender::from_file(pty.master).map_err(LaunchError::io("wrapping pty master as async writer"))?;

        let stdin_task = contd_task::ChildTask::spawn(forward_stdin(io.stdin, master_writer));
        let output_task = contd_task::ChildTask::spawn(log_tee_out.pump(master_reader, io.stdout));
        drop(io.stderr);
        drop(log_tee_err);

        Ok(([OwnedFd::from(pty.slave), slave_fd, slave_fd2], vec![stdin_task, output_task]))
    } else {
        let (stdin_read, stdin_write) = pipe().map_err(LaunchError::Namespace)?;
        let (stdout_read, stdout_write) = pipe().map_err(LaunchError::Namespace)?;
        let (stderr_read, stderr_write) = pipe().map_err(LaunchError::Namespace)?;

        crate::pty::set_nonblocking(stdin_write.as_fd())?;
        crate::pty::set_nonblocking(stdout_read.as_fd())?;
        crate::pty::set_nonblocking(stderr_read.as_fd())?;

        let stdin_sender = pipe::Sender::from_file(std::fs::File::from(stdin_write)).map_err(LaunchError::io("wrapping stdin pipe"))?;
        let stdout_receiver = pipe::Receiver::from_file(std::fs::File::from(stdout_read)).map_err(LaunchError::io("wrapping stdout pipe"))?;
        let stderr_receiver = pipe::Receiver::from_file(std::fs::File::from(stderr_read)).map_err(LaunchError::io("wrapping stderr pipe"))?;

        let stdin_task = contd_task::ChildTask::spawn(forward_stdin(io.stdin, stdin_sender));
        let stdout_task = contd_task::ChildTask::spawn(log_tee_out.pump(stdout_receiver, io.stdout));
        let stderr_task = contd_task::ChildTask::spawn(log_tee_err.pump(stderr_receiver, io.stderr));

        Ok((
            [
                OwnedFd::from(stdin_read),
                OwnedFd::from(stdout_write),
                OwnedFd::from(stderr_write),
            ],
            vec![stdin_task, stdout_task, stderr_task],
        ))
    }
}

async fn forward_stdin(mut source: Pin<Box<dyn AsyncRead + Send>>, mut sink: pipe::Sender) {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    let mut buf = [0u8; 8192];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if sink.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn build_argv(cmd: &str, args: &[String]) -> Result<Vec<CString>> {
    let mut argv = Vec::with_capacity(args.len() + 3);
    argv.push(to_cstring(REEXEC_SELF)?);
    argv.push(to_cstring("init")?);
    argv.push(to_cstring(cmd)?);
    for arg in args {
        argv.push(to_cstring(arg)?);
    }
    Ok(argv)
}

fn build_envp(init_pipe_fd: i32, ns_start_fd: i32, ns_end_fd: i32, has_shared_ns: bool) -> Result<Vec<CString>> {
    let mut envp = Vec::new();
    for (key, value) in std::env::vars() {
        envp.push(to_cstring(format!("{key}={value}"))?);
    }
    envp.push(to_cstring(format!("{INIT_PIPE_ENV}={init_pipe_fd}"))?);
    if has_shared_ns {
        envp.push(to_cstring(format!("{NS_START_ENV}={ns_start_fd}"))?);
        envp.push(to_cstring(format!("{NS_END_ENV}={ns_end_fd}"))?);
    }
    Ok(envp)
}

fn to_cstring(s: impl AsRef<str>) -> Result<CString> {
    CString::new(s.as_ref()).map_err(|_| LaunchError::MissingEnv("argument contains a NUL byte"))
}

/// Identity-maps the caller's uid/gid into container uid/gid 0, size 1
/// (rootless), matching `run.go`'s `UidMappings`/`GidMappings`. Must run
/// after `clone()` (so `pid` exists) and before the child is released
/// past the sync pipe.
fn write_id_mappings(pid: Pid) -> Result<()> {
    let (uid, gid) = ns::identity_id_mappings();

    write_proc_file(pid, "uid_map", &format!("0 {uid} 1\n"))?;
    write_proc_file(pid, "setgroups", "deny\n")?;
    write_proc_file(pid, "gid_map", &format!("0 {gid} 1\n"))?;
    Ok(())
}

fn write_proc_file(pid: Pid, name: &str, contents: &str) -> Result<()> {
    let path: PathBuf = PathBuf::from("/proc").join(pid.as_raw().to_string()).join(name);
    std::fs::File::options()
        .write(true)
        .open(&path)
        .and_then(|mut f| f.write_all(contents.as_bytes()))
        .map_err(LaunchError::io("writing id mapping"))
}

fn write_init_config(write_fd: OwnedFd, config: &InitPipeConfig) -> Result<()> {
    let mut file = std::fs::File::from(write_fd);
    let bytes = bincode::serialize(config).map_err(LaunchError::EncodeInitConfig)?;
    file.write_all(&bytes).map_err(LaunchError::io("writing init pipe config"))
}
