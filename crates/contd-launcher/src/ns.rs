//! Namespace clone-flag construction and shared-namespace fd discovery.
//!
//! Grounded in `original_source/container/run.go`'s `Cloneflags`
//! construction and `setup.go`'s `getNses`, extended from the original's
//! `net`-only sharing to every namespace kind `spec.md` names.

use std::fs::File;
use std::os::fd::BorrowedFd;

use nix::sched::{setns, CloneFlags};
use nix::unistd::{Gid, Uid};

use crate::config::{NamespaceFlags, SharedNamespaces};
use crate::error::{LaunchError, Result};

/// Namespace kinds in the fixed order their `/proc/<pid>/ns/*` files must
/// be opened and inherited: the user namespace file must come first, or
/// the child's `setns()` sequence fails (the kernel requires joining the
/// user namespace before any namespace it governs).
const NS_ORDER: &[(NamespaceFlags, &str)] = &[
    (NamespaceFlags::USER, "user"),
    (NamespaceFlags::MOUNT, "mnt"),
    (NamespaceFlags::UTS, "uts"),
    (NamespaceFlags::PID, "pid"),
    (NamespaceFlags::NET, "net"),
    (NamespaceFlags::IPC, "ipc"),
    (NamespaceFlags::CGROUP, "cgroup"),
];

/// The full set of namespaces a container gets when it shares nothing.
fn all_new() -> CloneFlags {
    CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWCGROUP
}

fn to_clone_flags(shared: NamespaceFlags) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    for (bit, clone_bit) in [
        (NamespaceFlags::USER, CloneFlags::CLONE_NEWUSER),
        (NamespaceFlags::MOUNT, CloneFlags::CLONE_NEWNS),
        (NamespaceFlags::UTS, CloneFlags::CLONE_NEWUTS),
        (NamespaceFlags::PID, CloneFlags::CLONE_NEWPID),
        (NamespaceFlags::NET, CloneFlags::CLONE_NEWNET),
        (NamespaceFlags::IPC, CloneFlags::CLONE_NEWIPC),
        (NamespaceFlags::CGROUP, CloneFlags::CLONE_NEWCGROUP),
    ] {
        if shared.contains(bit) {
            flags |= clone_bit;
        }
    }
    flags
}

/// Every namespace a container doesn't share is created fresh; namespaces
/// named in `shared.flags` are left out of the clone flags entirely (the
/// child `setns()`s into them instead).
pub fn clone_flags(shared: SharedNamespaces) -> CloneFlags {
    all_new() ^ to_clone_flags(shared.flags)
}

/// Opens `/proc/<pid>/ns/<kind>` for every namespace kind in `shared`, in
/// the fixed order required for `setns()`, ready to be inherited by the
/// child via its extra file descriptors.
pub fn open_shared_namespace_files(shared: SharedNamespaces) -> Result<Vec<File>> {
    let mut files = Vec::new();
    for (bit, name) in NS_ORDER {
        if shared.flags.contains(*bit) {
            let path = format!("/proc/{}/ns/{name}", shared.pid);
            let file = File::open(&path).map_err(LaunchError::io("opening shared namespace file"))?;
            files.push(file);
        }
    }
    Ok(files)
}

/// Identity-maps the caller's uid/gid to container uid/gid 0, the
/// rootless single-entry mapping `run.go`'s `UidMappings`/`GidMappings`
/// set up.
pub fn identity_id_mappings() -> (Uid, Gid) {
    (Uid::current(), Gid::current())
}

/// `setns()`s into every namespace named by `shared.flags`, consuming the
/// fd range `[ns_start, ns_end)` the parent inherited the child into via
/// [`open_shared_namespace_files`]. The range holds exactly one fd per set
/// bit, in `NS_ORDER`, since that's the order the parent opened them in —
/// this must walk the same order to pair each fd with its namespace kind.
///
/// Called from the re-exec'd init process, before anything else that could
/// depend on being in the target namespaces (mounting `proc`, binding the
/// hostname). Mirrors `setup.go`'s `setNses`.
pub fn join_shared_namespaces(shared: SharedNamespaces, ns_start: i32, ns_end: i32) -> Result<()> {
    if shared.is_empty() {
        return Ok(());
    }

    let mut fd = ns_start;
    for (bit, _name) in NS_ORDER {
        if !shared.flags.contains(*bit) {
            continue;
        }
        if fd >= ns_end {
            return Err(LaunchError::MissingEnv("shared namespace fd range shorter than the flag set"));
        }

        // SAFETY: `fd` is one of the range `_NS_START.._NS_END` the parent
        // dup2'd the open namespace files onto before `execve`; it stays
        // open and valid for the lifetime of this process.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        setns(borrowed, to_clone_flags(*bit)).map_err(LaunchError::Namespace)?;
        fd += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharing_nothing_clones_every_namespace() {
        assert_eq!(clone_flags(SharedNamespaces::none()), all_new());
    }

    #[test]
    fn sharing_net_drops_only_the_net_bit() {
        let shared = SharedNamespaces { flags: NamespaceFlags::NET, pid: 1 };
        let flags = clone_flags(shared);
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn user_namespace_is_first_in_ns_order() {
        assert_eq!(NS_ORDER[0].0, NamespaceFlags::USER);
    }

    #[test]
    fn open_shared_namespace_files_is_empty_when_nothing_shared() {
        let files = open_shared_namespace_files(SharedNamespaces::none()).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn join_shared_namespaces_is_a_noop_when_nothing_shared() {
        assert!(join_shared_namespaces(SharedNamespaces::none(), 3, 3).is_ok());
    }

    #[test]
    fn join_shared_namespaces_rejects_a_fd_range_shorter_than_the_flag_set() {
        let shared = SharedNamespaces { flags: NamespaceFlags::NET, pid: 1 };
        let error = join_shared_namespaces(shared, 3, 3).unwrap_err();
        assert!(matches!(error, LaunchError::MissingEnv(_)));
    }
}
