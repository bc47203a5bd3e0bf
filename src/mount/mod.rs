//! Scoped bind mounts.
//!
//! A [`ScopedMount`] owns exactly one active mount. It has two release
//! paths: [`ScopedMount::close`] (best effort, lazy detach, used on error
//! paths and from `Drop`) and [`ScopedMount::clean_close`] (strict unmount,
//! verified against `/proc/self/mountinfo`, used when the owning phase
//! succeeded). Both are idempotent. Whichever path runs, the target is no
//! longer a mount point afterwards.

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

mod native;

pub use native::NativeBindMount;

/// Parameters for a new mount.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
    /// Permit stacking the mount on a target that is already a mount point.
    pub allow_ro_rebind_in_use: bool,
}

impl MountRequest {
    /// Read-only bind mount of `source` at `target`.
    pub fn bind_read_only(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: None,
            flags: MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            data: None,
            allow_ro_rebind_in_use: true,
        }
    }
}

/// Implementation behind a [`ScopedMount`].
pub trait MountBackend {
    fn target(&self) -> &Path;

    /// Detach the mount. `lazy` selects `MNT_DETACH`, which cannot fail on
    /// a busy target.
    fn unmount(&mut self, lazy: bool) -> Result<()>;

    /// Whether the layer this backend created is still mounted. Mounts
    /// that were already stacked on the target before it do not count.
    fn is_mounted(&self) -> Result<bool>;
}

/// Handle to one active mount. Released on drop if not released explicitly.
pub struct ScopedMount {
    backend: Box<dyn MountBackend>,
    released: bool,
}

impl ScopedMount {
    /// Create a native mount described by `request`.
    pub fn new(request: &MountRequest) -> Result<Self> {
        let backend = NativeBindMount::create(request)?;
        Ok(Self::with_backend(Box::new(backend)))
    }

    pub fn with_backend(backend: Box<dyn MountBackend>) -> Self {
        Self {
            backend,
            released: false,
        }
    }

    pub fn target(&self) -> &Path {
        self.backend.target()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Best-effort release. A no-op once the mount has been released.
    pub fn close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.backend.unmount(true)
    }

    /// Verified release. A no-op once the mount has been released.
    ///
    /// If the strict unmount fails, the mount is lazily detached before the
    /// error is returned. If the unmount succeeded but the layer still shows
    /// up, nothing further is detached: whatever is left on the target is
    /// not ours to remove.
    pub fn clean_close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let target = self.backend.target().to_path_buf();
        if let Err(err) = self.backend.unmount(false) {
            if let Err(detach_err) = self.backend.unmount(true) {
                warn!(
                    target = %target.display(),
                    error = %detach_err,
                    "lazy detach after failed clean unmount also failed"
                );
            }
            return Err(err.context(format!("failed to cleanly unmount '{}'", target.display())));
        }

        if self.backend.is_mounted()? {
            bail!(
                "failed to cleanly unmount '{}': mount is still present after unmount",
                target.display()
            );
        }

        debug!(target = %target.display(), "mount cleanly closed");
        Ok(())
    }
}

impl Drop for ScopedMount {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to unmount scoped mount on drop");
        }
    }
}

/// Whether `path` is currently a mount point of this process.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    Ok(mount_count(path)? > 0)
}

/// Number of mounts stacked on `path` in this process's mount table.
pub fn mount_count(path: &Path) -> Result<usize> {
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mountinfo = fs::read_to_string("/proc/self/mountinfo")
        .context("reading /proc/self/mountinfo")?;
    let count = mount_points(&mountinfo)
        .filter(|mount_point| *mount_point == path)
        .count();
    Ok(count)
}

/// Mount points listed in a mountinfo table (field 5, octal escapes decoded).
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mountinfo(field)))
}

fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            let value = std::str::from_utf8(digits)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
