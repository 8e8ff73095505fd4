//! Size-bounded tmpfs mounts (Linux only, needs CAP_SYS_ADMIN).

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::Mounter;
use crate::types::Volume;

pub const DEFAULT_MAX_SIZE_MB: u64 = 100;
pub const DEFAULT_MOUNT_MODE: u32 = 0o700;
pub const DEFAULT_MOUNT_FLAGS: libc::c_ulong = libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC;

const TMPFS: &[u8] = b"tmpfs\0";

/// Mounts a tmpfs over each volume directory.
#[derive(Debug, Clone)]
pub struct TmpfsMounter {
    root: PathBuf,
    max_size_mb: u64,
    mode: u32,
    mount_flags: libc::c_ulong,
    unmount_flags: libc::c_int,
}

impl TmpfsMounter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            mode: DEFAULT_MOUNT_MODE,
            mount_flags: DEFAULT_MOUNT_FLAGS,
            unmount_flags: 0,
        }
    }

    /// Size limit of each mount, in megabytes.
    pub fn with_max_size_mb(mut self, max_size_mb: u64) -> Self {
        self.max_size_mb = max_size_mb;
        self
    }

    /// Permission bits of the mount's root directory.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Flags passed to mount(2), replacing the defaults.
    pub fn with_mount_flags(mut self, flags: libc::c_ulong) -> Self {
        self.mount_flags = flags;
        self
    }

    /// Flags passed to umount2(2), e.g. `MNT_DETACH`.
    pub fn with_unmount_flags(mut self, flags: libc::c_int) -> Self {
        self.unmount_flags = flags;
        self
    }

    fn mount_data(&self) -> String {
        format!("size={}M,mode={:o}", self.max_size_mb, self.mode)
    }
}

/// EINVAL means `path` is not a mount point: the mount never happened, so
/// there is nothing to undo. Any other error stands.
fn not_mounted(err: io::Error, id: &str, path: &Path) -> io::Result<()> {
    if err.raw_os_error() != Some(libc::EINVAL) {
        return Err(err);
    }
    tracing::debug!(id = %id, path = %path.display(), "volume was not mounted");
    Ok(())
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

impl Mounter for TmpfsMounter {
    fn mount(&self, volume: &Volume) -> io::Result<()> {
        let path = self.path(&volume.id);
        let target = c_path(&path)?;
        let data = CString::new(self.mount_data())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: every pointer is a NUL-terminated string that outlives the call.
        let rc = unsafe {
            libc::mount(
                TMPFS.as_ptr().cast(),
                target.as_ptr(),
                TMPFS.as_ptr().cast(),
                self.mount_flags,
                data.as_ptr().cast(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(id = %volume.id, path = %path.display(), data = %self.mount_data(), "mounted tmpfs");
        Ok(())
    }

    fn unmount(&self, id: &str) -> io::Result<()> {
        let path = self.path(id);
        let target = c_path(&path)?;

        // SAFETY: `target` is NUL-terminated and outlives the call.
        let rc = unsafe { libc::umount2(target.as_ptr(), self.unmount_flags) };
        if rc != 0 {
            return not_mounted(io::Error::last_os_error(), id, &path);
        }
        tracing::debug!(id = %id, path = %path.display(), "unmounted tmpfs");
        Ok(())
    }

    fn root(&self) -> &Path {
        &self.root
    }
}
