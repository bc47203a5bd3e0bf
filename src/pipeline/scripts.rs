use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::chroot::{image_path, Chroot};
use crate::config::Script;
use crate::mount::MountRequest;
use crate::process::Cmd;

/// Where the config directory is visible inside the image while scripts run.
pub const CONFIG_DIR_MOUNT_PATH: &str = "/_imageconfigs";
pub const SHELL_PROGRAM: &str = "/bin/sh";

/// Shell command line for a script, as seen from inside the image.
pub(crate) fn script_command(script: &Script) -> String {
    let path = format!(
        "{}/{}",
        CONFIG_DIR_MOUNT_PATH,
        script.path.trim_start_matches('/')
    );
    if script.args.is_empty() {
        path
    } else {
        format!("{} {}", path, script.args)
    }
}

/// Run scripts in order inside the image with the config directory
/// bind-mounted read-only at [`CONFIG_DIR_MOUNT_PATH`].
pub(crate) fn run_scripts(
    base_dir: &Path,
    scripts: &[Script],
    chroot: &mut dyn Chroot,
) -> Result<()> {
    if scripts.is_empty() {
        return Ok(());
    }

    let target = image_path(chroot.root_dir(), Path::new(CONFIG_DIR_MOUNT_PATH))?;
    let mut mount = chroot
        .mount(&MountRequest::bind_read_only(base_dir, &target))
        .with_context(|| {
            format!(
                "failed to mount config directory '{}' at '{}'",
                base_dir.display(),
                target.display()
            )
        })?;

    for script in scripts {
        info!(script = %script.path, args = %script.args, "running script");
        let command = script_command(script);
        chroot
            .run(&Cmd::new(SHELL_PROGRAM).args(["-c", command.as_str()]))
            .with_context(|| format!("failed to run script ({})", script.path))?;
    }

    mount
        .clean_close()
        .context("failed to clean up config directory mount")
}
