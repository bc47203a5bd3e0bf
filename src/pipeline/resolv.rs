//! Network identity override for the duration of customization.
//!
//! The host's resolv.conf is copied into the image so in-chroot tools
//! (package managers, scripts) can resolve names. The image is expected to
//! regenerate its own resolv.conf at boot, so the original is not backed
//! up: restoring simply deletes the override.

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::chroot::resolve_in_root;

pub const RESOLV_CONF_PATH: &str = "etc/resolv.conf";
const RESOLV_CONF_DIR: &str = "/etc";
const RESOLV_CONF_NAME: &str = "resolv.conf";
pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// An installed resolv.conf override. Removed by [`ResolvConfOverride::restore`]
/// or, best effort, on drop.
#[derive(Debug)]
pub struct ResolvConfOverride {
    path: PathBuf,
    installed: bool,
}

/// Remove a file, symlink or directory. A missing path is not an error.
fn remove_all(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

impl ResolvConfOverride {
    /// Replace the image's resolv.conf with the host's.
    pub fn install(root: &Path, host_resolv: &Path) -> Result<Self> {
        debug!("overriding resolv.conf file");

        // The file itself is replaced, not followed; only its directory resolves.
        let path = resolve_in_root(root, Path::new(RESOLV_CONF_DIR))?.join(RESOLV_CONF_NAME);
        remove_all(&path).context("failed to delete existing resolv.conf file")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
        fs::copy(host_resolv, &path).with_context(|| {
            format!(
                "failed to override resolv.conf file with host's resolv.conf ({})",
                host_resolv.display()
            )
        })?;

        Ok(Self {
            path,
            installed: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the overridden resolv.conf.
    pub fn restore(mut self) -> Result<()> {
        debug!("deleting overridden resolv.conf file");
        self.installed = false;
        remove_all(&self.path).context("failed to delete overridden resolv.conf file")
    }
}

impl Drop for ResolvConfOverride {
    fn drop(&mut self) {
        if self.installed {
            if let Err(e) = remove_all(&self.path) {
                warn!(error = %e, path = %self.path.display(), "failed to remove resolv.conf override");
            }
        }
    }
}
