//! The CLI side of the local-pipes fast path (§6): when `--host localhost`
//! is used, stdio is bridged through the named FIFO triple the daemon
//! creates for the container rather than dialing the streaming port.
//! Grounded in `contd-daemon::local_pipes`, mirrored from the opposite
//! direction: the CLI writes `.in` and reads `.out`/`.err`.

use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tokio::net::unix::pipe;

fn pipe_path(container_id: uuid::Uuid) -> PathBuf {
    std::env::temp_dir().join(container_id.to_string())
}

pub struct LocalPipes {
    pub stdin: pipe::Sender,
    pub stdout: pipe::Receiver,
    pub stderr: pipe::Receiver,
}

fn open_rdwr(path: &Path) -> std::io::Result<std::fs::File> {
    let fd = nix::fcntl::open(path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    // SAFETY: `fd` came from a successful `nix::fcntl::open` call above.
    Ok(std::fs::File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Opens the three FIFOs the daemon already created for `container_id`.
/// Retries briefly since the daemon creates them only after `Run`'s
/// background task has started, which races this open.
pub async fn open(container_id: uuid::Uuid) -> anyhow::Result<LocalPipes> {
    let base = pipe_path(container_id);

    let mut attempt = 0;
    loop {
        match try_open(&base) {
            Ok(pipes) => return Ok(pipes),
            Err(error) if attempt < 20 => {
                attempt += 1;
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                let _ = error;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

fn try_open(base: &Path) -> std::io::Result<LocalPipes> {
    let stdin = pipe::Sender::from_file(open_rdwr(&base.with_extension("in"))?)?;
    let stdout = pipe::Receiver::from_file(open_rdwr(&base.with_extension("out"))?)?;
    let stderr = pipe::Receiver::from_file(open_rdwr(&base.with_extension("err"))?)?;
    Ok(LocalPipes { stdin, stdout, stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_path_matches_the_daemon_side_naming_convention() {
        let id = uuid::Uuid::new_v4();
        let base = pipe_path(id);

        assert_eq!(base, std::env::temp_dir().join(id.to_string()));
        assert_eq!(base.with_extension("in").extension().unwrap(), "in");
        assert_eq!(base.with_extension("out").extension().unwrap(), "out");
        assert_eq!(base.with_extension("err").extension().unwrap(), "err");
    }
}
