//! Version gate
//!
//! Decides whether the tenant is being provisioned or upgraded and rejects
//! version changes kubeadm cannot perform: downgrades and skipping minor
//! releases.

use async_trait::async_trait;

use super::Resource;
use crate::crd::{parse_version, TenantControlPlane, TenantControlPlaneStatus, VersionPhase};
use crate::error::{Error, Result};
use crate::utilities::OperationResult;

/// Phase implied by moving from the deployed `current` version to `desired`.
/// `None` when nothing is in flight.
pub fn version_transition(current: &str, desired: &str) -> Result<Option<VersionPhase>> {
    if current.is_empty() {
        return Ok(Some(VersionPhase::Provisioning));
    }
    if current == desired {
        return Ok(None);
    }

    let (current_major, current_minor, current_patch) = parse_version(current)?;
    let (desired_major, desired_minor, desired_patch) = parse_version(desired)?;
    if (desired_major, desired_minor, desired_patch) == (current_major, current_minor, current_patch) {
        return Ok(None);
    }
    if desired_major != current_major {
        return Err(Error::InvalidSpec(format!(
            "cannot change major version from {current} to {desired}"
        )));
    }
    if (desired_minor, desired_patch) < (current_minor, current_patch) {
        return Err(Error::InvalidSpec(format!("cannot downgrade from {current} to {desired}")));
    }
    if desired_minor > current_minor + 1 {
        return Err(Error::InvalidSpec(format!(
            "cannot skip minor versions upgrading from {current} to {desired}"
        )));
    }
    Ok(Some(VersionPhase::Upgrading))
}

#[derive(Default)]
pub struct UpgradeCheck {
    phase: Option<VersionPhase>,
}

impl UpgradeCheck {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Resource for UpgradeCheck {
    fn name(&self) -> &'static str {
        "upgrade-check"
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        let status = tenant.status_or_default();
        self.phase = version_transition(
            &status.kubernetes_resources.version.version,
            &tenant.spec.kubernetes.version,
        )?;
        Ok(())
    }

    async fn create_or_update(&mut self, _tenant: &TenantControlPlane) -> Result<OperationResult> {
        Ok(OperationResult::None)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let current = tenant.version_phase();
        // A migration owns the phase until it completes
        if current == Some(VersionPhase::Migrating) {
            return false;
        }
        self.phase.is_some() && self.phase != current
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        if let Some(phase) = self.phase {
            status.kubernetes_resources.version.status = Some(phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::resources::testing::apply_status;
    use crate::resources::{handle, Outcome};
    use assert_matches::assert_matches;

    #[test]
    fn test_version_transitions() {
        assert_eq!(version_transition("", "v1.29.3").unwrap(), Some(VersionPhase::Provisioning));
        assert_eq!(version_transition("v1.29.3", "v1.29.3").unwrap(), None);
        assert_eq!(version_transition("v1.29.3", "v1.29.4").unwrap(), Some(VersionPhase::Upgrading));
        assert_eq!(version_transition("v1.29.3", "v1.30.0").unwrap(), Some(VersionPhase::Upgrading));
        assert_matches!(version_transition("v1.29.3", "v1.28.9"), Err(Error::InvalidSpec(_)));
        assert_matches!(version_transition("v1.29.3", "v1.31.0"), Err(Error::InvalidSpec(_)));
        assert_matches!(version_transition("v1.29.3", "v2.0.0"), Err(Error::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn test_provisioning_is_recorded_once() {
        let mut tcp = tenant("default", "alpha");

        let mut resource = UpgradeCheck::new();
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::StatusOnly);
        apply_status(&resource, &mut tcp);
        assert_eq!(tcp.version_phase(), Some(VersionPhase::Provisioning));

        let mut resource = UpgradeCheck::new();
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::Unchanged);
    }

    #[tokio::test]
    async fn test_migration_keeps_its_phase() {
        let mut tcp = tenant("default", "alpha");
        let mut status = tcp.status_or_default();
        status.kubernetes_resources.version.version = "v1.29.3".into();
        status.kubernetes_resources.version.status = Some(VersionPhase::Migrating);
        tcp.status = Some(status);
        tcp.spec.kubernetes.version = "v1.30.0".into();

        let mut resource = UpgradeCheck::new();
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::Unchanged);
    }
}
