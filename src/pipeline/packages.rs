//! Package phase.
//!
//! Repository resolution and installation belong to a [`PackageInstaller`].
//! [`ChrootPackageManager`] is the plain implementation: it drives the
//! image's own package manager inside the chroot against the image's
//! configured repositories.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::chroot::Chroot;
use crate::config::SystemConfig;
use crate::process::Cmd;

pub trait PackageInstaller {
    /// Add, remove and update packages in the image. Invoked once per run.
    fn add_remove_and_update_packages(
        &mut self,
        build_dir: &Path,
        base_path: &Path,
        system_config: &SystemConfig,
        chroot: &mut dyn Chroot,
        sources: &[PathBuf],
        use_base_repos: bool,
    ) -> Result<()>;
}

pub const DEFAULT_PACKAGE_MANAGER: &str = "tdnf";

/// Runs `<program> -y update|remove|install` inside the image.
#[derive(Debug, Clone)]
pub struct ChrootPackageManager {
    program: String,
}

impl ChrootPackageManager {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, use_base_repos: bool, action: &str) -> Cmd {
        let mut cmd = Cmd::new(&self.program).arg("-y");
        if !use_base_repos {
            cmd = cmd.arg("--disablerepo=*");
        }
        cmd.arg(action)
    }
}

impl Default for ChrootPackageManager {
    fn default() -> Self {
        Self::new(DEFAULT_PACKAGE_MANAGER)
    }
}

impl PackageInstaller for ChrootPackageManager {
    fn add_remove_and_update_packages(
        &mut self,
        _build_dir: &Path,
        _base_path: &Path,
        system_config: &SystemConfig,
        chroot: &mut dyn Chroot,
        sources: &[PathBuf],
        use_base_repos: bool,
    ) -> Result<()> {
        let packages = &system_config.packages;
        if packages.is_empty() {
            return Ok(());
        }
        if !sources.is_empty() {
            bail!(
                "{} cannot consume local package sources ({}); use an installer that resolves them",
                self.program,
                sources
                    .iter()
                    .map(|s| s.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        if packages.update_base_image {
            info!("updating base image packages");
            chroot
                .run(&self.command(use_base_repos, "update"))
                .context("failed to update base image packages")?;
        }

        if !packages.remove.is_empty() {
            info!(packages = ?packages.remove, "removing packages");
            let cmd = self
                .command(use_base_repos, "remove")
                .args(&packages.remove);
            chroot.run(&cmd).context("failed to remove packages")?;
        }

        if !packages.install.is_empty() {
            info!(packages = ?packages.install, "installing packages");
            let cmd = self
                .command(use_base_repos, "install")
                .args(&packages.install);
            chroot.run(&cmd).context("failed to install packages")?;
        }

        Ok(())
    }
}
