//! Test doubles for the chroot, mount and package collaborators.

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::chroot::{copy_into_root, Chroot, FileToCopy};
use crate::config::SystemConfig;
use crate::mount::{MountBackend, MountRequest, ScopedMount};
use crate::pipeline::packages::PackageInstaller;
use crate::process::Cmd;

#[derive(Debug, Default)]
pub struct FakeMountState {
    /// The layer this fake created.
    pub mounted: bool,
    /// A mount that was already on the target before this one was stacked.
    pub underlying: bool,
    /// One entry per unmount attempt: `true` for lazy.
    pub unmounts: Vec<bool>,
    pub fail_strict_unmount: bool,
    /// A strict unmount reports success but the layer stays mounted.
    pub survives_strict_unmount: bool,
}

pub struct FakeMount {
    target: PathBuf,
    state: Rc<RefCell<FakeMountState>>,
}

impl FakeMount {
    pub fn new(target: impl Into<PathBuf>) -> (Self, Rc<RefCell<FakeMountState>>) {
        let state = Rc::new(RefCell::new(FakeMountState {
            mounted: true,
            ..Default::default()
        }));
        (
            Self {
                target: target.into(),
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl MountBackend for FakeMount {
    fn target(&self) -> &Path {
        &self.target
    }

    fn unmount(&mut self, lazy: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.unmounts.push(lazy);
        if !lazy && state.fail_strict_unmount {
            bail!("target is busy");
        }
        if state.mounted {
            if lazy || !state.survives_strict_unmount {
                state.mounted = false;
            }
        } else {
            // umount(2) on the target hits whatever is on top.
            state.underlying = false;
        }
        Ok(())
    }

    fn is_mounted(&self) -> Result<bool> {
        Ok(self.state.borrow().mounted)
    }
}

/// Chroot double rooted in a temp directory.
///
/// Commands are recorded as display strings instead of being executed.
/// `useradd` is emulated by appending passwd/shadow entries so account
/// state can be inspected afterwards.
pub struct FakeChroot {
    root: PathBuf,
    pub commands: Vec<String>,
    /// A command whose display string contains this fails.
    pub fail_on: Option<String>,
    pub mounts: Vec<(MountRequest, Rc<RefCell<FakeMountState>>)>,
    /// Mounts created from now on refuse a strict unmount.
    pub busy_mounts: bool,
    pub staged: Vec<FileToCopy>,
    /// Number of `unsafe_run` entries.
    pub entries: usize,
}

impl FakeChroot {
    pub fn new(root: &Path) -> Self {
        fs::create_dir_all(root.join("etc")).unwrap();
        Self {
            root: root.to_path_buf(),
            commands: Vec::new(),
            fail_on: None,
            mounts: Vec::new(),
            busy_mounts: false,
            staged: Vec::new(),
            entries: 0,
        }
    }

    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    pub fn with_passwd(self, passwd: &str, shadow: &str) -> Self {
        fs::write(self.root.join("etc/passwd"), passwd).unwrap();
        fs::write(self.root.join("etc/shadow"), shadow).unwrap();
        self
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.contains(needle))
    }

    fn emulate_useradd(&self, cmd: &Cmd) {
        let args = cmd.get_args();
        let name = args.last().cloned().unwrap_or_default();
        let value_of = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };
        let uid = value_of("-u").unwrap_or_else(|| "1000".to_string());
        let hash = value_of("-p").unwrap_or_else(|| "!".to_string());

        append(
            &self.root.join("etc/passwd"),
            &format!("{name}:x:{uid}:{uid}::/home/{name}:/bin/sh\n"),
        );
        append(
            &self.root.join("etc/shadow"),
            &format!("{name}:{hash}:19000:0:99999:7:::\n"),
        );
        fs::create_dir_all(self.root.join("home").join(&name)).unwrap();
    }
}

fn append(path: &Path, line: &str) {
    let mut content = fs::read_to_string(path).unwrap_or_default();
    content.push_str(line);
    fs::write(path, content).unwrap();
}

impl Chroot for FakeChroot {
    fn root_dir(&self) -> &Path {
        &self.root
    }

    fn add_files(&mut self, files: &[FileToCopy]) -> Result<()> {
        for file in files {
            copy_into_root(&self.root, file)?;
            self.staged.push(file.clone());
        }
        Ok(())
    }

    fn unsafe_run(&mut self, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.entries += 1;
        f()
    }

    fn run(&mut self, cmd: &Cmd) -> Result<()> {
        self.entries += 1;
        let line = cmd.to_string();
        self.commands.push(line.clone());
        if let Some(needle) = &self.fail_on {
            if line.contains(needle.as_str()) {
                bail!("'{}' failed (exit code 1)", cmd.program());
            }
        }
        if cmd.program() == "useradd" {
            self.emulate_useradd(cmd);
        }
        Ok(())
    }

    fn mount(&mut self, request: &MountRequest) -> Result<ScopedMount> {
        let (backend, state) = FakeMount::new(request.target.clone());
        state.borrow_mut().fail_strict_unmount = self.busy_mounts;
        self.mounts.push((request.clone(), state));
        Ok(ScopedMount::with_backend(Box::new(backend)))
    }
}

/// Package installer double that only records its invocations.
#[derive(Default)]
pub struct RecordingInstaller {
    pub calls: usize,
    pub fail: bool,
}

impl PackageInstaller for RecordingInstaller {
    fn add_remove_and_update_packages(
        &mut self,
        _build_dir: &Path,
        _base_path: &Path,
        _system_config: &SystemConfig,
        chroot: &mut dyn Chroot,
        _sources: &[PathBuf],
        _use_base_repos: bool,
    ) -> Result<()> {
        self.calls += 1;
        if self.fail {
            bail!("package installation failed");
        }
        // Resolution must be visible to the package phase.
        if !chroot.root_dir().join("etc/resolv.conf").exists() {
            bail!("resolv.conf missing during package installation");
        }
        Ok(())
    }
}
