//! Account management inside the image root.
//!
//! Lookups and field edits work directly on the image's `/etc/passwd` and
//! `/etc/shadow`. Anything that needs the image's own account tooling
//! (`useradd`, `usermod`, `chown`) runs inside the chroot.

use anyhow::{bail, Context, Result};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::chroot::{image_path, resolve_in_root, Chroot};
use crate::process::Cmd;

const PASSWD_FILE: &str = "etc/passwd";
const SHADOW_FILE: &str = "etc/shadow";
const SALT_LEN: usize = 12;
/// Shadow password field value for "no password set".
const LOCKED_PASSWORD: &str = "!";

// Field positions in /etc/shadow.
const SHADOW_PASSWORD: usize = 1;
const SHADOW_LAST_CHANGE: usize = 2;
const SHADOW_MAX_DAYS: usize = 4;
const SHADOW_FIELDS: usize = 9;

// Field positions in /etc/passwd.
const PASSWD_HOME: usize = 5;
const PASSWD_SHELL: usize = 6;
const PASSWD_FIELDS: usize = 7;

/// Look up a user's passwd fields in the image.
///
/// Returns:
/// - Ok(Some(fields)) if the user is found
/// - Ok(None) if the user is not found or the file doesn't exist
/// - Err if the file exists but is unreadable
fn passwd_entry(root: &Path, username: &str) -> Result<Option<Vec<String>>> {
    let passwd_path = root.join(PASSWD_FILE);

    // File not existing is fine - user just doesn't exist
    if !passwd_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&passwd_path)
        .with_context(|| format!("Failed to read passwd file at {}", passwd_path.display()))?;

    Ok(content
        .lines()
        .map(|line| line.split(':').map(str::to_string).collect::<Vec<_>>())
        .find(|fields| fields.len() >= PASSWD_FIELDS && fields[0] == username))
}

/// Whether the named account exists in the image.
pub fn user_exists(root: &Path, username: &str) -> Result<bool> {
    Ok(passwd_entry(root, username)?.is_some())
}

/// Rewrite one user's line of a colon-separated account file.
fn rewrite_entry(
    path: &Path,
    username: &str,
    min_fields: usize,
    edit: impl FnOnce(&mut Vec<String>),
) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut found = false;
    let mut edit = Some(edit);
    let mut lines = Vec::new();
    for line in content.lines() {
        let mut fields: Vec<String> = line.split(':').map(str::to_string).collect();
        if fields[0] == username {
            if let Some(edit) = edit.take() {
                found = true;
                if fields.len() < min_fields {
                    fields.resize(min_fields, String::new());
                }
                edit(&mut fields);
                lines.push(fields.join(":"));
                continue;
            }
        }
        lines.push(line.to_string());
    }

    if !found {
        bail!("user '{}' not found in {}", username, path.display());
    }

    let mut updated = lines.join("\n");
    updated.push('\n');
    fs::write(path, updated).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// A hash must fit in one colon-separated field of a single shadow line.
fn check_password_hash(username: &str, hashed_password: &str) -> Result<()> {
    if let Some(c) = hashed_password
        .chars()
        .find(|c| matches!(c, ':' | '\n' | '\r'))
    {
        bail!(
            "password hash of user ({}) contains invalid character {:?}",
            username,
            c
        );
    }
    Ok(())
}

/// Create an account with `useradd` inside the image.
///
/// The UID is assigned by `useradd` when `uid` is `None`.
pub fn add_user(
    chroot: &mut dyn Chroot,
    username: &str,
    hashed_password: &str,
    uid: Option<u32>,
) -> Result<()> {
    check_password_hash(username, hashed_password)?;

    let mut cmd = Cmd::new("useradd").arg("-m");
    if !hashed_password.is_empty() {
        cmd = cmd.args(["-p", hashed_password]);
    }
    if let Some(uid) = uid {
        cmd = cmd.args(["-u", &uid.to_string()]);
    }
    cmd = cmd.arg(username);

    chroot
        .run(&cmd)
        .with_context(|| format!("failed to add user ({})", username))
}

/// Replace the stored password hash of an existing account.
///
/// An empty hash locks the password.
pub fn update_user_password(root: &Path, username: &str, hashed_password: &str) -> Result<()> {
    check_password_hash(username, hashed_password)?;

    let password = if hashed_password.is_empty() {
        LOCKED_PASSWORD
    } else {
        hashed_password
    };

    rewrite_entry(&root.join(SHADOW_FILE), username, SHADOW_FIELDS, |fields| {
        fields[SHADOW_PASSWORD] = password.to_string();
    })
    .with_context(|| format!("failed to update password of user ({})", username))
}

/// Set the password to expire `expiry_days` from today; `-1` never expires.
pub fn chage(root: &Path, expiry_days: i64, username: &str) -> Result<()> {
    if expiry_days < -1 {
        bail!("invalid password expiry ({}) for user ({})", expiry_days, username);
    }

    let today = time::OffsetDateTime::now_utc().unix_timestamp() / 86_400;
    rewrite_entry(&root.join(SHADOW_FILE), username, SHADOW_FIELDS, |fields| {
        if expiry_days == -1 {
            fields[SHADOW_MAX_DAYS] = String::new();
        } else {
            fields[SHADOW_LAST_CHANGE] = today.to_string();
            fields[SHADOW_MAX_DAYS] = expiry_days.to_string();
        }
    })
    .with_context(|| format!("failed to set password expiry of user ({})", username))
}

/// Set the primary group and append secondary groups.
pub fn configure_user_group_membership(
    chroot: &mut dyn Chroot,
    username: &str,
    primary_group: Option<&str>,
    secondary_groups: &[String],
) -> Result<()> {
    if let Some(primary) = primary_group {
        let cmd = Cmd::new("usermod").args(["-g", primary, username]);
        chroot.run(&cmd).with_context(|| {
            format!("failed to set primary group ({}) of user ({})", primary, username)
        })?;
    }

    if !secondary_groups.is_empty() {
        let groups = secondary_groups.join(",");
        let cmd = Cmd::new("usermod").args(["-a", "-G", &groups, username]);
        chroot.run(&cmd).with_context(|| {
            format!("failed to set secondary groups ({}) of user ({})", groups, username)
        })?;
    }

    Ok(())
}

fn home_directory(root: &Path, username: &str) -> Result<PathBuf> {
    if let Some(fields) = passwd_entry(root, username)? {
        if !fields[PASSWD_HOME].is_empty() {
            return Ok(PathBuf::from(&fields[PASSWD_HOME]));
        }
    }
    if username == "root" {
        Ok(PathBuf::from("/root"))
    } else {
        Ok(PathBuf::from("/home").join(username))
    }
}

/// Install the given public keys as the user's `authorized_keys`.
///
/// The file is rebuilt from the key list on every call. With no keys,
/// nothing is touched.
pub fn provision_user_ssh_keys(
    chroot: &mut dyn Chroot,
    username: &str,
    key_paths: &[PathBuf],
) -> Result<()> {
    if key_paths.is_empty() {
        return Ok(());
    }

    let mut authorized_keys = String::new();
    for key_path in key_paths {
        info!(
            key = %key_path.display(),
            user = username,
            "adding ssh key"
        );
        let key = fs::read_to_string(key_path)
            .with_context(|| format!("failed to read ssh public key ({})", key_path.display()))?;
        authorized_keys.push_str(key.trim_end());
        authorized_keys.push('\n');
    }

    let ssh_dir_in_image = home_directory(chroot.root_dir(), username)?.join(".ssh");
    image_path(chroot.root_dir(), &ssh_dir_in_image)?;
    let ssh_dir = resolve_in_root(chroot.root_dir(), &ssh_dir_in_image)?;
    fs::create_dir_all(&ssh_dir)
        .with_context(|| format!("creating ssh directory '{}'", ssh_dir.display()))?;
    fs::set_permissions(&ssh_dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("setting permissions '{}'", ssh_dir.display()))?;

    let keys_file =
        resolve_in_root(chroot.root_dir(), &ssh_dir_in_image.join("authorized_keys"))?;
    if let Some(parent) = keys_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    fs::write(&keys_file, authorized_keys)
        .with_context(|| format!("writing '{}'", keys_file.display()))?;
    fs::set_permissions(&keys_file, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("setting permissions '{}'", keys_file.display()))?;

    let cmd = Cmd::new("chown")
        .args(["-R", &format!("{}:", username)])
        .arg_path(&ssh_dir_in_image);
    chroot
        .run(&cmd)
        .with_context(|| format!("failed to set ownership of ssh keys for user ({})", username))
}

/// Set the user's login shell / startup command. No-op when unset.
pub fn configure_user_startup_command(
    root: &Path,
    username: &str,
    startup_command: Option<&str>,
) -> Result<()> {
    let Some(command) = startup_command else {
        return Ok(());
    };

    debug!(user = username, command, "updating startup command");
    rewrite_entry(&root.join(PASSWD_FILE), username, PASSWD_FIELDS, |fields| {
        fields[PASSWD_SHELL] = command.to_string();
    })
    .with_context(|| format!("failed to set startup command of user ({})", username))
}

/// Hash a plaintext password with SHA-512 crypt using the host's openssl.
///
/// An empty password hashes to an empty string.
pub fn hash_password(password: &str) -> Result<String> {
    if password.is_empty() {
        return Ok(String::new());
    }

    let salt: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LEN)
        .map(char::from)
        .collect();

    let result = openssl_passwd(&salt, password).run()?;
    Ok(result.stdout_trimmed().to_string())
}

/// `openssl passwd` invocation. The password travels on stdin so it never
/// shows up in the process list.
fn openssl_passwd(salt: &str, password: &str) -> Cmd {
    Cmd::new("openssl")
        .args(["passwd", "-6", "-salt", salt, "-stdin"])
        .stdin(format!("{}\n", password))
        .error_msg("failed to hash password")
}
