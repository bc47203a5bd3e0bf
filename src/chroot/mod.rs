//! The customization target: an image root that can be entered.
//!
//! [`Chroot`] is the capability every phase receives explicitly. Running
//! code inside the image ([`Chroot::unsafe_run`]) switches the root of the
//! whole process, so it takes `&mut self`: only the single holder of the
//! handle can cross into the image, and never twice at once.
//!
//! [`ImageChroot`] is the native implementation. It is deliberately neither
//! `Send` nor `Sync`, which pins all chroot-crossing work to the thread
//! that opened the image.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::marker::PhantomData;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::mount::{MountRequest, ScopedMount};
use crate::process::Cmd;

/// A host file to stage into the image root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileToCopy {
    /// Host path.
    pub src: PathBuf,
    /// Absolute path inside the image.
    pub dest: PathBuf,
    pub permissions: Option<u32>,
}

/// An opened image root.
pub trait Chroot {
    /// Absolute host path of the image root.
    fn root_dir(&self) -> &Path;

    /// Copy host files into the image root.
    fn add_files(&mut self, files: &[FileToCopy]) -> Result<()>;

    /// Run `f` with the process root switched to the image root.
    fn unsafe_run(&mut self, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Run a command inside the image root, streaming its output.
    fn run(&mut self, cmd: &Cmd) -> Result<()> {
        self.unsafe_run(&mut || cmd.run_live())
    }

    /// Create a mount that lives until the returned handle is released.
    fn mount(&mut self, request: &MountRequest) -> Result<ScopedMount> {
        ScopedMount::new(request)
    }
}

/// Resolve an absolute in-image path against the image root.
pub fn image_path(root: &Path, dest: &Path) -> Result<PathBuf> {
    if !dest.is_absolute() {
        bail!("image path '{}' must be absolute", dest.display());
    }
    let mut resolved = root.to_path_buf();
    for component in dest.components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                bail!("image path '{}' escapes the image root", dest.display())
            }
        }
    }
    Ok(resolved)
}

const MAX_SYMLINK_HOPS: usize = 40;

fn push_components(pending: &mut Vec<OsString>, path: &Path) {
    for component in path.components().rev() {
        match component {
            Component::Normal(part) => pending.push(part.to_os_string()),
            Component::ParentDir => pending.push(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
}

/// Resolve an absolute in-image path to a host path, following symlinks the
/// way the kernel would with `root` as `/`.
///
/// Absolute link targets restart at `root` and `..` never climbs above it,
/// so the result always lies under `root` even when the image links into
/// host directories.
pub fn resolve_in_root(root: &Path, dest: &Path) -> Result<PathBuf> {
    if !dest.is_absolute() {
        bail!("image path '{}' must be absolute", dest.display());
    }

    let mut pending = Vec::new();
    push_components(&mut pending, dest);

    let mut resolved = PathBuf::new();
    let mut hops = 0;
    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate = root.join(&resolved).join(&part);
        let is_link = fs::symlink_metadata(&candidate)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            resolved.push(part);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            bail!(
                "resolving image path '{}': too many levels of symbolic links",
                dest.display()
            );
        }
        let target = fs::read_link(&candidate)
            .with_context(|| format!("reading link '{}'", candidate.display()))?;
        if target.is_absolute() {
            resolved.clear();
        }
        push_components(&mut pending, &target);
    }

    Ok(root.join(resolved))
}

/// Copy one host file into `root`, creating parents and applying `mode`.
pub(crate) fn copy_into_root(root: &Path, file: &FileToCopy) -> Result<()> {
    image_path(root, &file.dest)?;
    let dst = resolve_in_root(root, &file.dest)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    fs::copy(&file.src, &dst).with_context(|| {
        format!(
            "copying '{}' to '{}'",
            file.src.display(),
            dst.display()
        )
    })?;
    if let Some(mode) = file.permissions {
        fs::set_permissions(&dst, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode {:o} on '{}'", mode, dst.display()))?;
    }
    debug!(src = %file.src.display(), dest = %file.dest.display(), "file staged");
    Ok(())
}

/// Native image root, entered with chroot(2).
pub struct ImageChroot {
    root_dir: PathBuf,
    _single_thread: PhantomData<*const ()>,
}

impl ImageChroot {
    /// Open an unpacked image root.
    pub fn open(root_dir: &Path) -> Result<Self> {
        let root_dir = fs::canonicalize(root_dir)
            .with_context(|| format!("resolving image root '{}'", root_dir.display()))?;
        if !root_dir.is_dir() {
            bail!("image root '{}' is not a directory", root_dir.display());
        }
        Ok(Self {
            root_dir,
            _single_thread: PhantomData,
        })
    }
}

impl Chroot for ImageChroot {
    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn add_files(&mut self, files: &[FileToCopy]) -> Result<()> {
        for file in files {
            copy_into_root(&self.root_dir, file)?;
        }
        Ok(())
    }

    fn unsafe_run(&mut self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let host_root = File::open("/").context("opening host root directory")?;
        let host_cwd = File::open(".").context("opening current working directory")?;

        std::os::unix::fs::chroot(&self.root_dir)
            .with_context(|| format!("entering chroot '{}'", self.root_dir.display()))?;

        let result = std::env::set_current_dir("/")
            .context("changing directory to chroot root")
            .and_then(|()| f());

        let escaped = escape_chroot(&host_root, &host_cwd);

        match (result, escaped) {
            (Ok(()), escaped) => escaped,
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(escape_err)) => {
                warn!(error = %format!("{:#}", escape_err), "failed to leave chroot");
                Err(err)
            }
        }
    }
}

/// Return to the host root and working directory saved before entering.
fn escape_chroot(host_root: &File, host_cwd: &File) -> Result<()> {
    fchdir(host_root).context("returning to host root")?;
    std::os::unix::fs::chroot(".").context("leaving chroot")?;
    fchdir(host_cwd).context("restoring working directory")?;
    Ok(())
}

fn fchdir(dir: &File) -> std::io::Result<()> {
    // SAFETY: the descriptor belongs to `dir`, which outlives the call.
    let rc = unsafe { libc::fchdir(dir.as_raw_fd()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_image_path_joins_under_root() {
        let root = Path::new("/images/root");
        assert_eq!(
            image_path(root, Path::new("/etc/hostname")).unwrap(),
            PathBuf::from("/images/root/etc/hostname")
        );
    }

    #[test]
    fn test_image_path_rejects_escape() {
        let root = Path::new("/images/root");
        assert!(image_path(root, Path::new("/etc/../../host")).is_err());
        assert!(image_path(root, Path::new("etc/hostname")).is_err());
    }

    #[test]
    fn test_add_files_copies_with_mode() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let src = temp.path().join("motd");
        fs::write(&src, "welcome\n").unwrap();

        let mut chroot = ImageChroot::open(&root).unwrap();
        chroot
            .add_files(&[
                FileToCopy {
                    src: src.clone(),
                    dest: PathBuf::from("/etc/motd"),
                    permissions: None,
                },
                FileToCopy {
                    src,
                    dest: PathBuf::from("/usr/share/secret/motd"),
                    permissions: Some(0o600),
                },
            ])
            .unwrap();

        let root = chroot.root_dir();
        assert_eq!(fs::read_to_string(root.join("etc/motd")).unwrap(), "welcome\n");
        let mode = fs::metadata(root.join("usr/share/secret/motd"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_resolve_in_root_keeps_links_inside_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        std::os::unix::fs::symlink("/usr/lib", root.join("lib")).unwrap();
        std::os::unix::fs::symlink("../../../../outside", root.join("usr/up")).unwrap();
        std::os::unix::fs::symlink("loop", root.join("loop")).unwrap();

        assert_eq!(
            resolve_in_root(&root, Path::new("/lib/modules")).unwrap(),
            root.join("usr/lib/modules")
        );
        assert_eq!(
            resolve_in_root(&root, Path::new("/usr/up/x")).unwrap(),
            root.join("outside/x")
        );
        let err = resolve_in_root(&root, Path::new("/loop/x")).unwrap_err();
        assert!(err.to_string().contains("too many levels"));
    }

    #[test]
    fn test_add_files_does_not_follow_links_to_host() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        let host_file = temp.path().join("host-motd");
        fs::write(&host_file, "host\n").unwrap();
        std::os::unix::fs::symlink(&host_file, root.join("etc/motd")).unwrap();
        let src = temp.path().join("motd");
        fs::write(&src, "welcome\n").unwrap();

        let mut chroot = ImageChroot::open(&root).unwrap();
        chroot
            .add_files(&[FileToCopy {
                src,
                dest: PathBuf::from("/etc/motd"),
                permissions: Some(0o600),
            }])
            .unwrap();

        assert_eq!(fs::read_to_string(&host_file).unwrap(), "host\n");
        let inside = chroot.root_dir().join(host_file.strip_prefix("/").unwrap());
        assert_eq!(fs::read_to_string(inside).unwrap(), "welcome\n");
    }

    #[test]
    fn test_add_files_missing_source() {
        let temp = TempDir::new().unwrap();
        let mut chroot = ImageChroot::open(temp.path()).unwrap();
        let err = chroot
            .add_files(&[FileToCopy {
                src: temp.path().join("nope"),
                dest: PathBuf::from("/etc/nope"),
                permissions: None,
            }])
            .unwrap_err();
        assert!(format!("{:#}", err).contains("nope"));
    }

    #[test]
    fn test_open_rejects_missing_root() {
        let temp = TempDir::new().unwrap();
        assert!(ImageChroot::open(&temp.path().join("missing")).is_err());
    }
}
