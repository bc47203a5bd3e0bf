//! Native bind mount using mount(2). Requires CAP_SYS_ADMIN.

use anyhow::{bail, Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{mount_count, MountBackend, MountRequest};

pub struct NativeBindMount {
    target: PathBuf,
    /// The target directory did not exist and was created for this mount.
    created_target: bool,
    /// Mounts already stacked on the target before this one.
    base_layers: usize,
}

impl NativeBindMount {
    pub fn create(request: &MountRequest) -> Result<Self> {
        let source = request.source.as_path();
        let target = request.target.as_path();

        if !source.exists() {
            bail!("bind mount source does not exist: {}", source.display());
        }

        let created_target = !target.exists();
        let base_layers = if created_target {
            fs::create_dir_all(target).with_context(|| {
                format!("creating bind mount target directory '{}'", target.display())
            })?;
            0
        } else {
            mount_count(target)?
        };
        if base_layers > 0 && !request.allow_ro_rebind_in_use {
            bail!("mount target '{}' is already in use", target.display());
        }

        let read_only = request.flags.contains(MsFlags::MS_RDONLY);
        let initial_flags = request.flags.difference(MsFlags::MS_RDONLY);

        if let Err(e) = mount(
            Some(source),
            target,
            request.fstype.as_deref(),
            initial_flags,
            request.data.as_deref(),
        ) {
            if created_target {
                let _ = fs::remove_dir(target);
            }
            bail!(
                "failed to mount '{}' at '{}': {}",
                source.display(),
                target.display(),
                e
            );
        }

        let mut handle = Self {
            target: target.to_path_buf(),
            created_target,
            base_layers,
        };

        // MS_RDONLY is ignored on the initial bind; it only takes effect on a remount.
        if read_only && initial_flags.contains(MsFlags::MS_BIND) {
            if let Err(e) = mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            ) {
                let _ = handle.unmount(true);
                bail!("failed to remount '{}' read-only: {}", target.display(), e);
            }
        }

        debug!(
            source = %source.display(),
            target = %target.display(),
            read_only,
            base_layers,
            "bind mount created"
        );

        Ok(handle)
    }
}

impl MountBackend for NativeBindMount {
    fn target(&self) -> &Path {
        &self.target
    }

    fn unmount(&mut self, lazy: bool) -> Result<()> {
        // Our layer is gone already; unmounting again would hit a mount
        // stacked below it.
        if !self.is_mounted().unwrap_or(true) {
            debug!(target = %self.target.display(), "bind mount already gone");
            return Ok(());
        }

        let flags = if lazy {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        umount2(&self.target, flags)
            .with_context(|| format!("unmounting '{}'", self.target.display()))?;

        if self.created_target {
            self.created_target = false;
            if let Err(e) = fs::remove_dir(&self.target) {
                if lazy {
                    warn!(
                        target = %self.target.display(),
                        error = %e,
                        "failed to remove mount target directory"
                    );
                } else {
                    return Err(e).with_context(|| {
                        format!("removing mount target directory '{}'", self.target.display())
                    });
                }
            }
        }

        debug!(target = %self.target.display(), lazy, "bind mount unmounted");
        Ok(())
    }

    fn is_mounted(&self) -> Result<bool> {
        Ok(mount_count(&self.target)? > self.base_layers)
    }
}
