//! Preflight checks for customization runs.
//!
//! Validates that the host and the image root have the tools the pipeline
//! will invoke before anything is modified. This prevents a run from
//! failing halfway through with a half-customized image.
//!
//! # Example
//!
//! ```rust,no_run
//! use image_customizer::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("openssl") {
//!     println!("openssl not installed");
//! }
//!
//! let tools = &[("openssl", "openssl"), ("sh", "bash")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools the pipeline runs outside the image.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("openssl", "openssl"), ("sh", "bash")];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

const IMAGE_BIN_DIRS: &[&str] = &["usr/bin", "bin", "usr/sbin", "sbin"];

/// Find a binary inside the image root.
pub fn find_image_binary(root: &Path, name: &str) -> Option<PathBuf> {
    IMAGE_BIN_DIRS
        .iter()
        .map(|dir| root.join(dir).join(name))
        .find(|path| path.is_file())
}

/// Tools that must exist inside the image for `config` to apply.
pub fn image_tools_for(config: &Config) -> Vec<&'static str> {
    let system = &config.system;
    let mut tools = Vec::new();

    if !system.users.is_empty() {
        tools.push("useradd");
        let groups = system
            .users
            .iter()
            .any(|u| u.primary_group.is_some() || !u.secondary_groups.is_empty());
        if groups {
            tools.push("usermod");
        }
        if system.users.iter().any(|u| !u.ssh_pubkey_paths.is_empty()) {
            tools.push("chown");
        }
    }

    if !system.services.enable.is_empty() || !system.services.disable.is_empty() {
        tools.push("systemctl");
    }

    if !system.post_install_scripts.is_empty() || !system.finalize_image_scripts.is_empty() {
        tools.push("sh");
    }

    tools
}

/// Check that the image root provides every tool `config` needs.
pub fn check_image_tools(root: &Path, config: &Config) -> Result<()> {
    let missing: Vec<&str> = image_tools_for(config)
        .into_iter()
        .filter(|tool| find_image_binary(root, tool).is_none())
        .collect();

    if !missing.is_empty() {
        bail!(
            "Missing required tools in image '{}': {}",
            root.display(),
            missing.join(", ")
        );
    }

    Ok(())
}
