//! Customization configuration: TOML schema, loading and validation.
//!
//! The configuration is read once, validated, and then handed to the
//! pipeline as an immutable value. Relative paths inside it (additional
//! file sources, password files, SSH keys, scripts) are resolved against
//! the directory that contains the config file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SystemConfig {
    pub hostname: Option<String>,
    pub packages: PackageConfig,
    pub additional_files: BTreeMap<String, Vec<FileConfig>>,
    pub users: Vec<User>,
    pub services: Services,
    pub modules: Modules,
    pub post_install_scripts: Vec<Script>,
    pub finalize_image_scripts: Vec<Script>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PackageConfig {
    pub install: Vec<String>,
    pub remove: Vec<String>,
    pub update_base_image: bool,
}

impl PackageConfig {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.remove.is_empty() && !self.update_base_image
    }
}

/// One destination for an additional file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Absolute path inside the image.
    pub path: String,
    pub permissions: Option<FileMode>,
}

/// Unix permission bits, written in TOML either as `0o644` or `"0644"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawFileMode")]
pub struct FileMode(pub u32);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFileMode {
    Int(u32),
    Octal(String),
}

impl TryFrom<RawFileMode> for FileMode {
    type Error = String;

    fn try_from(raw: RawFileMode) -> std::result::Result<Self, Self::Error> {
        let mode = match raw {
            RawFileMode::Int(mode) => mode,
            RawFileMode::Octal(text) => {
                let digits = text.trim().trim_start_matches("0o");
                u32::from_str_radix(digits, 8)
                    .map_err(|_| format!("invalid octal file mode '{}'", text))?
            }
        };
        if mode > 0o7777 {
            return Err(format!("file mode {:o} is out of range", mode));
        }
        Ok(FileMode(mode))
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct User {
    pub name: String,
    pub uid: Option<u32>,
    pub password: Option<String>,
    /// File whose full contents are used as the password. Wins over `password`.
    pub password_path: Option<String>,
    pub password_hashed: bool,
    /// Days until the password expires; `-1` disables expiry.
    pub password_expires_days: Option<i64>,
    pub primary_group: Option<String>,
    pub secondary_groups: Vec<String>,
    pub ssh_pubkey_paths: Vec<String>,
    pub startup_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Services {
    pub enable: Vec<String>,
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Modules {
    pub load: Vec<ModuleLoad>,
    pub disable: Vec<ModuleDisable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleLoad {
    pub name: String,
    pub options: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDisable {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    /// Path relative to the config directory.
    pub path: String,
    #[serde(default)]
    pub args: String,
}

/// A validated configuration together with the directory it was read from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub base_dir: PathBuf,
}

/// Read, parse and validate a customization config file.
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading customization config '{}'", path.display()))?;
    let config = parse_config(&text)
        .with_context(|| format!("parsing customization config '{}'", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid customization config '{}'", path.display()))?;

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(LoadedConfig { config, base_dir })
}

pub fn parse_config(text: &str) -> Result<Config> {
    Ok(toml::from_str(text)?)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let system = &self.system;

        if let Some(hostname) = &system.hostname {
            validate_hostname(hostname)?;
        }

        for (source, destinations) in &system.additional_files {
            parse_relative_path(source, "additional_files source")?;
            for destination in destinations {
                validate_image_path(&destination.path, "additional_files path")?;
            }
        }

        let mut names = BTreeSet::new();
        for user in &system.users {
            validate_user(user)?;
            if !names.insert(user.name.as_str()) {
                bail!("duplicate user '{}'", user.name);
            }
        }

        for service in system.services.enable.iter().chain(&system.services.disable) {
            if service.trim().is_empty() {
                bail!("service names must not be empty");
            }
        }

        let mut loaded = BTreeSet::new();
        for module in &system.modules.load {
            validate_module_name(&module.name)?;
            loaded.insert(module.name.as_str());
        }
        for module in &system.modules.disable {
            validate_module_name(&module.name)?;
            if loaded.contains(module.name.as_str()) {
                bail!(
                    "kernel module '{}' is listed in both modules.load and modules.disable",
                    module.name
                );
            }
        }

        for script in system
            .post_install_scripts
            .iter()
            .chain(&system.finalize_image_scripts)
        {
            parse_relative_path(&script.path, "script path")?;
        }

        Ok(())
    }
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > 64 {
        bail!("hostname must be 1-64 characters, got '{}'", hostname);
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        bail!("hostname '{}' contains invalid characters", hostname);
    }
    Ok(())
}

fn validate_user(user: &User) -> Result<()> {
    if user.name.is_empty() {
        bail!("user name must not be empty");
    }
    if user
        .name
        .chars()
        .any(|c| c == ':' || c == '/' || c.is_whitespace())
    {
        bail!("user name '{}' contains invalid characters", user.name);
    }
    if let Some(days) = user.password_expires_days {
        if days < -1 {
            bail!(
                "user '{}': password_expires_days must be -1 or greater, got {}",
                user.name,
                days
            );
        }
    }
    if let Some(path) = &user.password_path {
        if path.is_empty() {
            bail!("user '{}': password_path must not be empty", user.name);
        }
    }
    Ok(())
}

fn validate_module_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains('/') {
        bail!("invalid kernel module name '{}'", name);
    }
    Ok(())
}

fn validate_image_path(raw: &str, field: &str) -> Result<()> {
    let candidate = Path::new(raw);
    if !candidate.is_absolute() {
        bail!("{field} must be absolute, got '{}'", raw);
    }
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        bail!("{field} contains '..' in '{}'", raw);
    }
    Ok(())
}

pub(crate) fn parse_relative_path(raw: &str, field: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    if raw.is_empty() {
        bail!("{field} must not be empty");
    }
    if candidate.is_absolute() {
        bail!("{field} must be relative, got absolute path '{}'", raw);
    }
    for component in candidate.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            bail!(
                "{field} contains invalid traversal/root component in '{}'",
                raw
            );
        }
    }
    Ok(candidate.to_path_buf())
}
