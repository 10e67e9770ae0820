//! PTY allocation and raw-mode termios handling.
//!
//! Grounded in `tty/tty.go`'s `OpenPTY`/`PTSName`, `tty/termios.go`'s
//! `Raw()`, and `tty/start.go`'s session wiring, reimplemented on top of
//! `nix`'s `posix_openpt`/`grantpt`/`unlockpt` rather than the raw
//! `TIOCSPTLCK`/`TIOCGPTN` ioctls the Go original issues by hand.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios};

use crate::error::{LaunchError, Result};

nix::ioctl_read_bad!(ioctl_get_winsize, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(ioctl_set_winsize, libc::TIOCSWINSZ, libc::winsize);

/// A freshly allocated pseudo-terminal pair: `master` is kept open by the
/// caller, `slave` is handed to the child as its controlling stdio.
pub struct Pty {
    pub master: File,
    pub slave: File,
    pub slave_path: PathBuf,
}

impl Pty {
    /// Opens `/dev/ptmx`, unlocks the slave, resolves its path, and opens
    /// it with `O_NOCTTY` so opening it here does not itself attach a
    /// controlling terminal to this process.
    pub fn open() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(LaunchError::Pty)?;
        grantpt(&master).map_err(LaunchError::Pty)?;
        unlockpt(&master).map_err(LaunchError::Pty)?;

        let slave_name = ptsname_r(&master).map_err(LaunchError::Pty)?;
        let slave_path = PathBuf::from(&slave_name);

        let slave_fd = nix::fcntl::open(slave_path.as_path(), OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())
            .map_err(LaunchError::Pty)?;

        Ok(Self {
            // SAFETY: `master.into_raw_fd()` yields a freshly-owned, valid fd.
            master: File::from(unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) }),
            // SAFETY: `slave_fd` came from a successful `nix::fcntl::open` call above.
            slave: File::from(unsafe { OwnedFd::from_raw_fd(slave_fd) }),
            slave_path,
        })
    }
}

/// Captures a file descriptor's termios on construction and restores it on
/// drop, even if the caller panics in between — matches the `defer
/// backupTerm.Set(...)` pattern in `tty/start.go`.
pub struct RawModeGuard {
    fd: OwnedFd,
    saved: Termios,
}

impl RawModeGuard {
    /// Puts `fd` into raw mode, returning a guard that restores the prior
    /// termios settings when dropped.
    pub fn enable(fd: BorrowedFd<'_>) -> Result<Self> {
        let saved = termios::tcgetattr(fd).map_err(LaunchError::Pty)?;
        let mut raw = saved.clone();
        apply_raw_mode(&mut raw);
        termios::tcsetattr(fd, SetArg::TCSANOW, &raw).map_err(LaunchError::Pty)?;
        Ok(Self { fd: fd.try_clone_to_owned().map_err(LaunchError::io("duplicating tty fd"))?, saved })
    }

    /// Applies the saved (pre-raw) termios to a different fd, the way
    /// `tty/start.go` copies the caller's backup attributes onto the PTY
    /// slave before handing it to the child.
    pub fn apply_saved_to(&self, fd: BorrowedFd<'_>) -> Result<()> {
        termios::tcsetattr(fd, SetArg::TCSANOW, &self.saved).map_err(LaunchError::Pty)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd.as_fd(), SetArg::TCSANOW, &self.saved);
    }
}

/// Clears ignore-break/strip/CR-translate/flow-control input flags,
/// post-processing output flag, and echo/canonical/signal-generation
/// local flags; forces 8-bit characters; sets `VMIN=1, VTIME=0`. The exact
/// flag set `tty/termios.go`'s `Raw()` clears.
fn apply_raw_mode(termios: &mut Termios) {
    termios.input_flags.remove(
        InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON,
    );
    termios.output_flags.remove(OutputFlags::OPOST);
    termios.local_flags.remove(LocalFlags::ECHO | LocalFlags::ECHONL | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN);
    termios.control_flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
    termios.control_flags.insert(ControlFlags::CS8);
    termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
}

/// Reads the window size (rows/cols/pixel geometry) of the terminal
/// attached to `fd` via `TIOCGWINSZ`.
pub fn window_size(fd: BorrowedFd<'_>) -> Result<libc::winsize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    unsafe { ioctl_get_winsize(fd.as_raw_fd(), &mut ws) }.map_err(LaunchError::Pty)?;
    Ok(ws)
}

/// Applies `ws` to the terminal attached to `fd` via `TIOCSWINSZ`.
pub fn set_window_size(fd: BorrowedFd<'_>, ws: &libc::winsize) -> Result<()> {
    unsafe { ioctl_set_winsize(fd.as_raw_fd(), ws) }.map_err(LaunchError::Pty)?;
    Ok(())
}

/// Copies the window size from `from` to `to`, logging and ignoring
/// failures the way a `SIGWINCH` handler that outlives its terminal would.
pub fn propagate_window_size(from: BorrowedFd<'_>, to: BorrowedFd<'_>) {
    match window_size(from) {
        Ok(ws) => {
            if let Err(error) = set_window_size(to, &ws) {
                warn!(%error, "failed to propagate window size");
            }
        }
        Err(error) => warn!(%error, "failed to read window size"),
    }
}

/// Puts `fd` into non-blocking mode, required before handing it to
/// `tokio::net::unix::pipe::{Sender, Receiver}`.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let current = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(LaunchError::Pty)?;
    let flags = OFlag::from_bits_truncate(current) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(LaunchError::Pty)?;
    Ok(())
}

/// Forwards `SIGWINCH` from `from` to `to` for as long as the returned
/// task is kept alive. One instance per interactive session.
pub fn spawn_sigwinch_forwarder(from: OwnedFd, to: OwnedFd) -> contd_task::ChildTask<()> {
    contd_task::ChildTask::spawn(async move {
        let Ok(mut signal) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) else {
            warn!("failed to install SIGWINCH handler");
            return;
        };
        loop {
            if signal.recv().await.is_none() {
                return;
            }
            propagate_window_size(from.as_fd(), to.as_fd());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_mode_clears_echo_and_canonical_mode() {
        let mut termios = Termios::default();
        termios.local_flags.insert(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
        apply_raw_mode(&mut termios);
        assert!(!termios.local_flags.contains(LocalFlags::ECHO));
        assert!(!termios.local_flags.contains(LocalFlags::ICANON));
        assert!(!termios.local_flags.contains(LocalFlags::ISIG));
    }

    #[test]
    fn raw_mode_sets_eight_bit_characters() {
        let mut termios = Termios::default();
        termios.control_flags.insert(ControlFlags::PARENB);
        apply_raw_mode(&mut termios);
        assert!(termios.control_flags.contains(ControlFlags::CS8));
        assert!(!termios.control_flags.contains(ControlFlags::PARENB));
    }

    #[test]
    fn raw_mode_sets_vmin_one_vtime_zero() {
        let mut termios = Termios::default();
        apply_raw_mode(&mut termios);
        assert_eq!(termios.control_chars[SpecialCharacterIndices::VMIN as usize], 1);
        assert_eq!(termios.control_chars[SpecialCharacterIndices::VTIME as usize], 0);
    }
}
