//! File phases: hostname and additional files.
//!
//! Also hosts the small write helpers the other phases use to drop
//! line-oriented config files into the image root.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::chroot::{resolve_in_root, Chroot, FileToCopy};
use crate::config::FileConfig;

/// Write a file under `root`, creating parent directories. Symlinks in the
/// image resolve against `root`, never against the host.
pub fn write_file(root: &Path, path: &str, content: &str) -> Result<()> {
    let full_path = resolve_in_root(root, &Path::new("/").join(path.trim_start_matches('/')))?;
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    fs::write(&full_path, content)
        .with_context(|| format!("writing '{}'", full_path.display()))?;
    debug!(path = %full_path.display(), "file written");
    Ok(())
}

/// Write `/etc/hostname`. Does nothing when no hostname is configured.
pub fn update_hostname(hostname: Option<&str>, root: &Path) -> Result<()> {
    let Some(hostname) = hostname else {
        return Ok(());
    };

    info!(hostname, "setting hostname");
    write_file(root, "etc/hostname", hostname).context("failed to write hostname file")
}

/// Stage every configured additional file into the image.
///
/// Sources are resolved against `base_dir`; one source may fan out to
/// several destinations.
pub fn copy_additional_files(
    base_dir: &Path,
    additional_files: &BTreeMap<String, Vec<FileConfig>>,
    chroot: &mut dyn Chroot,
) -> Result<()> {
    for (source, destinations) in additional_files {
        let src: PathBuf = base_dir.join(source);
        for destination in destinations {
            info!(source = %src.display(), dest = %destination.path, "copying additional file");
            let file = FileToCopy {
                src: src.clone(),
                dest: PathBuf::from(&destination.path),
                permissions: destination.permissions.map(|mode| mode.0),
            };
            chroot.add_files(&[file]).with_context(|| {
                format!(
                    "failed to copy additional file '{}' to '{}'",
                    source, destination.path
                )
            })?;
        }
    }

    Ok(())
}
