//! Kernel module phase: load-on-boot directives, module options and
//! blacklists.
//!
//! Output files:
//! - `/etc/modules-load.d/<module>.conf` containing the module name
//! - `/etc/modprobe.d/<module>-options.conf` with `options <module> k=v ...`
//! - `/etc/modprobe.d/<module>.conf` with `blacklist <module>`

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::files::write_file;
use crate::config::Modules;

const MODULES_LOAD_DIR: &str = "etc/modules-load.d";
const MODPROBE_DIR: &str = "etc/modprobe.d";

/// Render an `options` directive. Keys are emitted in sorted order.
pub fn options_line(module: &str, options: &BTreeMap<String, String>) -> String {
    let rendered: Vec<String> = options
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    format!("options {} {}\n", module, rendered.join(" "))
}

pub fn load_or_disable_modules(modules: &Modules, root: &Path) -> Result<()> {
    for module in &modules.load {
        info!(module = %module.name, "loading kernel module");

        let load_path = format!("{}/{}.conf", MODULES_LOAD_DIR, module.name);
        write_file(root, &load_path, &module.name)
            .context("failed to write module load configuration")?;

        if let Some(options) = module.options.as_ref().filter(|o| !o.is_empty()) {
            let options_path = format!("{}/{}-options.conf", MODPROBE_DIR, module.name);
            write_file(root, &options_path, &options_line(&module.name, options))
                .context("failed to write module options configuration")?;
        }
    }

    for module in &modules.disable {
        info!(module = %module.name, "disabling kernel module");

        let blacklist_path = format!("{}/{}.conf", MODPROBE_DIR, module.name);
        write_file(root, &blacklist_path, &format!("blacklist {}\n", module.name))
            .context("failed to write module disable configuration")?;
    }

    Ok(())
}
