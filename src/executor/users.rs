//! User provisioning phase: create or update each configured account.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::accounts;
use crate::chroot::Chroot;
use crate::config::User;

/// Provision every user in list order. The first failure aborts.
pub fn add_or_update_users(
    users: &[User],
    base_dir: &Path,
    chroot: &mut dyn Chroot,
) -> Result<()> {
    for user in users {
        add_or_update_user(user, base_dir, chroot)?;
    }
    Ok(())
}

/// Resolve the password material for a user: file contents win over the
/// inline value. A single trailing line ending in the file is not part of
/// the password.
fn password_material(user: &User, base_dir: &Path) -> Result<String> {
    let Some(password_path) = &user.password_path else {
        return Ok(user.password.clone().unwrap_or_default());
    };

    if user.password.is_some() {
        warn!(
            user = %user.name,
            "both password and password_path are set; using password_path"
        );
    }

    let full_path = base_dir.join(password_path);
    let content = fs::read_to_string(&full_path)
        .with_context(|| format!("failed to read password file ({})", full_path.display()))?;
    let password = content
        .strip_suffix('\n')
        .map(|rest| rest.strip_suffix('\r').unwrap_or(rest))
        .unwrap_or(&content);
    Ok(password.to_string())
}

fn resolve_key_paths(user: &User, base_dir: &Path) -> Vec<PathBuf> {
    user.ssh_pubkey_paths
        .iter()
        .map(|path| base_dir.join(path))
        .collect()
}

/// Create the account if missing, otherwise update only its password; then
/// (re)apply expiry, groups, SSH keys and startup command.
pub fn add_or_update_user(user: &User, base_dir: &Path, chroot: &mut dyn Chroot) -> Result<()> {
    info!(user = %user.name, "adding/updating user");

    let password = password_material(user, base_dir)?;
    let hashed_password = if user.password_hashed {
        password
    } else {
        accounts::hash_password(&password)
            .with_context(|| format!("failed to hash password of user ({})", user.name))?
    };

    if accounts::user_exists(chroot.root_dir(), &user.name)? {
        accounts::update_user_password(chroot.root_dir(), &user.name, &hashed_password)?;
    } else {
        accounts::add_user(chroot, &user.name, &hashed_password, user.uid)?;
    }

    if let Some(days) = user.password_expires_days {
        accounts::chage(chroot.root_dir(), days, &user.name)?;
    }

    accounts::configure_user_group_membership(
        chroot,
        &user.name,
        user.primary_group.as_deref(),
        &user.secondary_groups,
    )?;

    accounts::provision_user_ssh_keys(chroot, &user.name, &resolve_key_paths(user, base_dir))?;

    accounts::configure_user_startup_command(
        chroot.root_dir(),
        &user.name,
        user.startup_command.as_deref(),
    )?;

    Ok(())
}
