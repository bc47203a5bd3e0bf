//! Chroot-scoped customization of unpacked OS image roots.
//!
//! Given a validated [`Config`] and an opened image root, [`customize`]
//! applies a fixed sequence of phases: network identity override,
//! packages, hostname, additional files, users, services, kernel modules,
//! post-install scripts, finalize-image scripts, and network identity
//! restore. The first failing phase aborts the run.
//!
//! # Architecture
//!
//! ```text
//! pipeline::customize
//!     │
//!     ├── pipeline::resolv      host resolv.conf in, then out again
//!     ├── pipeline::packages    PackageInstaller seam
//!     ├── executor::*           hostname, files, users, services, modules
//!     └── pipeline::scripts     config dir bind-mounted via mount::ScopedMount
//!
//! chroot::Chroot ─── every phase that touches the image goes through it
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use image_customizer::config::load_config;
//! use image_customizer::pipeline::packages::ChrootPackageManager;
//! use image_customizer::{customize, ImageChroot};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let loaded = load_config(Path::new("image.toml"))?;
//! let mut chroot = ImageChroot::open(Path::new("/mnt/image"))?;
//! let mut packages = ChrootPackageManager::default();
//! customize(
//!     Path::new("/var/tmp/build"),
//!     &loaded.base_dir,
//!     &loaded.config,
//!     &mut chroot,
//!     &mut packages,
//!     &[],
//!     true,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod chroot;
pub mod config;
pub mod executor;
pub mod mount;
pub mod pipeline;
pub mod preflight;
pub mod process;

#[cfg(test)]
mod testing;

pub use chroot::{Chroot, FileToCopy, ImageChroot};
pub use config::{load_config, Config, LoadedConfig};
pub use mount::{MountRequest, ScopedMount};
pub use pipeline::packages::{ChrootPackageManager, PackageInstaller};
pub use pipeline::{customize, Phase};
