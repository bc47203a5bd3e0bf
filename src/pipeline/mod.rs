//! The customization pipeline.
//!
//! [`customize`] applies a [`Config`] to an opened image root as a fixed
//! sequence of [`Phase`]s. The first failing phase aborts the run; nothing
//! already applied is reverted. The host's resolv.conf is installed first
//! and removed again on every path once installed.

pub mod packages;
pub mod resolv;
pub mod scripts;

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::chroot::Chroot;
use crate::config::Config;
use crate::executor::{files, modules, services, users};
use packages::PackageInstaller;
use resolv::{ResolvConfOverride, HOST_RESOLV_CONF};

/// Customization phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Install the host's resolv.conf.
    ResolvConf = 1,
    /// Add, remove and update packages.
    Packages = 2,
    Hostname = 3,
    AdditionalFiles = 4,
    Users = 5,
    Services = 6,
    Modules = 7,
    PostInstallScripts = 8,
    FinalizeImageScripts = 9,
    /// Remove the installed resolv.conf.
    RestoreResolvConf = 10,
}

impl Phase {
    pub const ORDER: [Phase; 10] = [
        Phase::ResolvConf,
        Phase::Packages,
        Phase::Hostname,
        Phase::AdditionalFiles,
        Phase::Users,
        Phase::Services,
        Phase::Modules,
        Phase::PostInstallScripts,
        Phase::FinalizeImageScripts,
        Phase::RestoreResolvConf,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::ResolvConf => write!(f, "ResolvConf"),
            Phase::Packages => write!(f, "Packages"),
            Phase::Hostname => write!(f, "Hostname"),
            Phase::AdditionalFiles => write!(f, "AdditionalFiles"),
            Phase::Users => write!(f, "Users"),
            Phase::Services => write!(f, "Services"),
            Phase::Modules => write!(f, "Modules"),
            Phase::PostInstallScripts => write!(f, "PostInstallScripts"),
            Phase::FinalizeImageScripts => write!(f, "FinalizeImageScripts"),
            Phase::RestoreResolvConf => write!(f, "RestoreResolvConf"),
        }
    }
}

fn in_phase<T>(phase: Phase, f: impl FnOnce() -> Result<T>) -> Result<T> {
    info!(phase = %phase, "starting customization phase");
    f().with_context(|| format!("customization phase '{}' failed", phase))
}

/// Customize an image root.
///
/// `base_path` is the directory the config was loaded from; relative paths
/// in the config (additional files, password files, SSH keys, scripts)
/// resolve against it. `build_dir`, `package_sources` and
/// `use_base_image_repos` are handed to the package installer untouched.
pub fn customize(
    build_dir: &Path,
    base_path: &Path,
    config: &Config,
    chroot: &mut dyn Chroot,
    packages: &mut dyn PackageInstaller,
    package_sources: &[PathBuf],
    use_base_image_repos: bool,
) -> Result<()> {
    customize_with_resolv(
        Path::new(HOST_RESOLV_CONF),
        build_dir,
        base_path,
        config,
        chroot,
        packages,
        package_sources,
        use_base_image_repos,
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn customize_with_resolv(
    host_resolv: &Path,
    build_dir: &Path,
    base_path: &Path,
    config: &Config,
    chroot: &mut dyn Chroot,
    packages: &mut dyn PackageInstaller,
    package_sources: &[PathBuf],
    use_base_image_repos: bool,
) -> Result<()> {
    let resolv = in_phase(Phase::ResolvConf, || {
        ResolvConfOverride::install(chroot.root_dir(), host_resolv)
    })?;

    let result = run_phases(
        build_dir,
        base_path,
        config,
        chroot,
        packages,
        package_sources,
        use_base_image_repos,
    );

    match result {
        Ok(()) => in_phase(Phase::RestoreResolvConf, || resolv.restore()),
        Err(err) => {
            if let Err(restore_err) = resolv.restore() {
                warn!(error = %format!("{:#}", restore_err), "failed to restore resolv.conf after failed customization");
            }
            Err(err)
        }
    }
}

fn run_phases(
    build_dir: &Path,
    base_path: &Path,
    config: &Config,
    chroot: &mut dyn Chroot,
    packages: &mut dyn PackageInstaller,
    package_sources: &[PathBuf],
    use_base_image_repos: bool,
) -> Result<()> {
    let system = &config.system;

    in_phase(Phase::Packages, || {
        packages.add_remove_and_update_packages(
            build_dir,
            base_path,
            system,
            chroot,
            package_sources,
            use_base_image_repos,
        )
    })?;

    in_phase(Phase::Hostname, || {
        files::update_hostname(system.hostname.as_deref(), chroot.root_dir())
    })?;

    in_phase(Phase::AdditionalFiles, || {
        files::copy_additional_files(base_path, &system.additional_files, chroot)
    })?;

    in_phase(Phase::Users, || {
        users::add_or_update_users(&system.users, base_path, chroot)
    })?;

    in_phase(Phase::Services, || {
        services::enable_or_disable_services(&system.services, chroot)
    })?;

    in_phase(Phase::Modules, || {
        modules::load_or_disable_modules(&system.modules, chroot.root_dir())
    })?;

    in_phase(Phase::PostInstallScripts, || {
        scripts::run_scripts(base_path, &system.post_install_scripts, chroot)
    })?;

    in_phase(Phase::FinalizeImageScripts, || {
        scripts::run_scripts(base_path, &system.finalize_image_scripts, chroot)
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::testing::{FakeChroot, RecordingInstaller};
    use std::fs;
    use tempfile::TempDir;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n";
    const SHADOW: &str = "root:*:19000:0:99999:7:::\n";

    struct Fixture {
        _temp: TempDir,
        base: PathBuf,
        root: PathBuf,
        host_resolv: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("config");
        let root = temp.path().join("root");
        fs::create_dir_all(base.join("files")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(base.join("files/motd"), "welcome\n").unwrap();
        let host_resolv = temp.path().join("resolv.conf");
        fs::write(&host_resolv, "nameserver 192.0.2.1\n").unwrap();
        Fixture {
            _temp: temp,
            base,
            root,
            host_resolv,
        }
    }

    const FULL: &str = r#"
[system]
hostname = "edge-01"

[system.packages]
install = ["vim"]

[system.additional_files]
"files/motd" = [{ path = "/etc/motd" }]

[[system.users]]
name = "bob"
password = "$6$salt$hash"
password_hashed = true

[system.services]
enable = ["sshd"]

[[system.modules.load]]
name = "kvm"

[[system.post_install_scripts]]
path = "post.sh"

[[system.finalize_image_scripts]]
path = "finalize.sh"
args = "--seal"
"#;

    fn run(
        fx: &Fixture,
        config: &Config,
        chroot: &mut FakeChroot,
        installer: &mut RecordingInstaller,
    ) -> Result<()> {
        customize_with_resolv(
            &fx.host_resolv,
            &fx.base,
            &fx.base,
            config,
            chroot,
            installer,
            &[],
            true,
        )
    }

    #[test]
    fn test_phase_order() {
        assert_eq!(Phase::ORDER.first(), Some(&Phase::ResolvConf));
        assert_eq!(Phase::ORDER.last(), Some(&Phase::RestoreResolvConf));
        assert!(Phase::ORDER.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(Phase::PostInstallScripts.to_string(), "PostInstallScripts");
    }

    #[test]
    fn test_full_run_applies_every_phase_in_order() {
        let fx = fixture();
        let config = parse_config(FULL).unwrap();
        let mut chroot = FakeChroot::new(&fx.root).with_passwd(PASSWD, SHADOW);
        let mut installer = RecordingInstaller::default();

        run(&fx, &config, &mut chroot, &mut installer).unwrap();

        assert_eq!(installer.calls, 1);
        assert_eq!(
            fs::read_to_string(fx.root.join("etc/hostname")).unwrap(),
            "edge-01"
        );
        assert_eq!(
            fs::read_to_string(fx.root.join("etc/motd")).unwrap(),
            "welcome\n"
        );
        assert_eq!(
            fs::read_to_string(fx.root.join("etc/modules-load.d/kvm.conf")).unwrap(),
            "kvm"
        );

        let useradd = chroot.position("useradd").unwrap();
        let systemctl = chroot.position("systemctl enable sshd").unwrap();
        let post = chroot.position("post.sh").unwrap();
        let finalize = chroot.position("finalize.sh --seal").unwrap();
        assert!(useradd < systemctl && systemctl < post && post < finalize);

        assert_eq!(chroot.mounts.len(), 2);
        assert!(chroot
            .mounts
            .iter()
            .all(|(_, state)| !state.borrow().mounted));
        assert!(!fx.root.join("etc/resolv.conf").exists());
    }

    #[test]
    fn test_failing_phase_aborts_and_restores_resolv() {
        let fx = fixture();
        let config = parse_config(FULL).unwrap();
        let mut chroot = FakeChroot::new(&fx.root)
            .with_passwd(PASSWD, SHADOW)
            .failing_on("systemctl enable sshd");
        let mut installer = RecordingInstaller::default();

        let err = run(&fx, &config, &mut chroot, &mut installer).unwrap_err();

        assert!(err
            .to_string()
            .contains("customization phase 'Services' failed"));
        assert!(format!("{:#}", err).contains("failed to enable service (sshd)"));
        // Earlier phases stay applied, later ones never run.
        assert!(fx.root.join("etc/hostname").exists());
        assert!(!fx.root.join("etc/modules-load.d/kvm.conf").exists());
        assert_eq!(chroot.position("post.sh"), None);
        assert!(chroot.mounts.is_empty());
        assert!(!fx.root.join("etc/resolv.conf").exists());
    }

    #[test]
    fn test_package_failure_restores_resolv() {
        let fx = fixture();
        let config = parse_config(FULL).unwrap();
        let mut chroot = FakeChroot::new(&fx.root);
        let mut installer = RecordingInstaller {
            fail: true,
            ..Default::default()
        };

        let err = run(&fx, &config, &mut chroot, &mut installer).unwrap_err();

        assert!(err.to_string().contains("'Packages'"));
        assert!(!fx.root.join("etc/hostname").exists());
        assert!(!fx.root.join("etc/resolv.conf").exists());
    }

    #[test]
    fn test_missing_host_resolv_fails_before_any_phase() {
        let fx = fixture();
        fs::remove_file(&fx.host_resolv).unwrap();
        let config = parse_config(FULL).unwrap();
        let mut chroot = FakeChroot::new(&fx.root);
        let mut installer = RecordingInstaller::default();

        let err = run(&fx, &config, &mut chroot, &mut installer).unwrap_err();

        assert!(err.to_string().contains("'ResolvConf'"));
        assert_eq!(installer.calls, 0);
    }

    #[test]
    fn test_empty_config_only_touches_resolv() {
        let fx = fixture();
        let config = parse_config("[system]\n").unwrap();
        let mut chroot = FakeChroot::new(&fx.root);
        let mut installer = RecordingInstaller::default();

        run(&fx, &config, &mut chroot, &mut installer).unwrap();

        assert_eq!(chroot.entries, 0);
        assert!(chroot.mounts.is_empty());
        assert!(chroot.staged.is_empty());
        let entries: Vec<_> = fs::read_dir(fx.root.join("etc")).unwrap().collect();
        assert!(entries.is_empty());
    }
}
