//! Service phase: enable and disable systemd units inside the image.

use anyhow::{Context, Result};
use tracing::info;

use crate::chroot::Chroot;
use crate::config::Services;
use crate::process::Cmd;

fn systemctl(chroot: &mut dyn Chroot, action: &str, service: &str) -> Result<()> {
    let cmd = Cmd::new("systemctl").args([action, service]);
    chroot
        .run(&cmd)
        .with_context(|| format!("failed to {} service ({})", action, service))
}

/// Process the enable list, then the disable list, each in configured order.
pub fn enable_or_disable_services(services: &Services, chroot: &mut dyn Chroot) -> Result<()> {
    for service in &services.enable {
        info!(service = %service, "enabling service");
        systemctl(chroot, "enable", service)?;
    }

    for service in &services.disable {
        info!(service = %service, "disabling service");
        systemctl(chroot, "disable", service)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChroot;
    use tempfile::TempDir;

    #[test]
    fn test_enable_then_disable_in_order() {
        let temp = TempDir::new().unwrap();
        let mut chroot = FakeChroot::new(temp.path());
        let services = Services {
            enable: vec!["sshd".into(), "chronyd".into()],
            disable: vec!["bluetooth".into()],
        };

        enable_or_disable_services(&services, &mut chroot).unwrap();

        assert_eq!(
            chroot.commands,
            vec![
                "systemctl enable sshd",
                "systemctl enable chronyd",
                "systemctl disable bluetooth",
            ]
        );
    }

    #[test]
    fn test_failure_names_service_and_stops() {
        let temp = TempDir::new().unwrap();
        let mut chroot = FakeChroot::new(temp.path()).failing_on("enable sshd");
        let services = Services {
            enable: vec!["sshd".into(), "chronyd".into()],
            disable: vec!["bluetooth".into()],
        };

        let err = enable_or_disable_services(&services, &mut chroot).unwrap_err();

        assert!(err.to_string().contains("failed to enable service (sshd)"));
        assert_eq!(chroot.commands, vec!["systemctl enable sshd"]);
    }

    #[test]
    fn test_empty_lists_are_noop() {
        let temp = TempDir::new().unwrap();
        let mut chroot = FakeChroot::new(temp.path());

        enable_or_disable_services(&Services::default(), &mut chroot).unwrap();

        assert_eq!(chroot.entries, 0);
    }
}
