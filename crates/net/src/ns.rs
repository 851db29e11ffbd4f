//! Network namespace switching, pinned to the calling OS thread.
//!
//! `setns` only affects the calling thread, which is why every step that
//! touches a target process's namespace must run on a dedicated OS thread
//! that nothing else shares.

use crate::error::Error;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount, MsFlags};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use numadv_procio::Pid;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

fn open_netns(path: &str) -> Result<OwnedFd, Error> {
    let fd = open(path, OFlag::O_RDONLY, Mode::empty()).map_err(Error::Nix)?;
    // `open` hands back ownership of a freshly created fd; wrap it so it
    // closes itself when dropped.
    #[allow(unsafe_code)]
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Holds the caller's original net namespace so it can be restored, and the
/// scratch sysfs mount point used while inside the target's namespace.
pub struct NamespaceSession {
    original: OwnedFd,
    scratch: PathBuf,
    mounted: bool,
}

impl NamespaceSession {
    /// Enters `pid`'s network namespace and mounts a private sysfs view at
    /// `scratch`, creating the directory if needed.
    pub fn enter(pid: Pid, scratch: &Path) -> Result<Self, Error> {
        let original = open_netns("/proc/self/ns/net")?;
        let target = open_netns(&format!("/proc/{pid}/ns/net"))?;
        setns(&target, CloneFlags::CLONE_NEWNET)?;
        drop(target);

        std::fs::create_dir_all(scratch).map_err(|e| Error::Io {
            path: scratch.to_path_buf(),
            source: e,
        })?;
        mount(
            Some("sysfs"),
            scratch,
            Some("sysfs"),
            MsFlags::empty(),
            None::<&str>,
        )?;

        Ok(Self {
            original,
            scratch: scratch.to_path_buf(),
            mounted: true,
        })
    }

    /// Leaves the target namespace for the root namespace (`/proc/1/ns/net`
    /// per the resolution protocol, not necessarily the caller's original
    /// namespace) and remounts sysfs at the same scratch path so host-side
    /// device names resolve correctly.
    pub fn return_to_root_and_remount(&mut self) -> Result<(), Error> {
        if self.mounted {
            let _ = umount(&self.scratch);
            self.mounted = false;
        }
        let root = open_netns("/proc/1/ns/net")?;
        setns(&root, CloneFlags::CLONE_NEWNET)?;
        drop(root);

        mount(
            Some("sysfs"),
            &self.scratch,
            Some("sysfs"),
            MsFlags::empty(),
            None::<&str>,
        )?;
        self.mounted = true;
        Ok(())
    }

    /// The scratch sysfs mount point (`<scratch>/class/net` is where
    /// interface entries live).
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }
}

impl Drop for NamespaceSession {
    fn drop(&mut self) {
        if self.mounted {
            let _ = umount(&self.scratch);
        }
        let _ = setns(&self.original, CloneFlags::CLONE_NEWNET);
        // `self.original` closes itself when dropped.
    }
}
