//! Resource pipeline of a tenant control plane
//!
//! Order matters: each resource reads what its predecessors recorded in the
//! tenant status (the CA before the leaves, the kubeconfigs before the
//! deployment, the deployment before anything written into the tenant
//! cluster).

use std::sync::Arc;

use super::Context;
use crate::resources::addons::{Addon, AddonKind};
use crate::resources::bootstrap_config::BootstrapConfig;
use crate::resources::certificates::{Certificate, CertificateKind};
use crate::resources::datastore_certificate::DatastoreCertificate;
use crate::resources::datastore_config::DatastoreConfig;
use crate::resources::datastore_migrate::DatastoreMigrate;
use crate::resources::datastore_setup::DatastoreSetup;
use crate::resources::deployment::ControlPlaneDeployment;
use crate::resources::ingress::ApiServerIngress;
use crate::resources::kubeconfig::{KubeconfigKind, KubeconfigSecret};
use crate::resources::phases::{KubeadmPhase, Phase};
use crate::resources::service::ApiServerService;
use crate::resources::upgrade::UpgradeCheck;
use crate::resources::{DeletableResource, Resource};

/// Resources converged on every reconciliation, in order
pub fn resources(ctx: &Arc<Context>) -> Vec<Box<dyn Resource>> {
    let mut pipeline: Vec<Box<dyn Resource>> = vec![
        Box::new(DatastoreMigrate::new(ctx.clone())),
        Box::new(UpgradeCheck::new()),
        Box::new(ApiServerService::new(ctx.clone())),
        Box::new(BootstrapConfig::new(ctx.clone())),
    ];
    for kind in [
        CertificateKind::Ca,
        CertificateKind::FrontProxyCa,
        CertificateKind::ServiceAccount,
        CertificateKind::ApiServer,
        CertificateKind::ApiServerKubeletClient,
        CertificateKind::FrontProxyClient,
    ] {
        pipeline.push(Box::new(Certificate::new(kind, ctx.clone())));
    }
    for kind in [KubeconfigKind::Admin, KubeconfigKind::ControllerManager, KubeconfigKind::Scheduler] {
        pipeline.push(Box::new(KubeconfigSecret::new(kind, ctx.clone())));
    }
    pipeline.push(Box::new(DatastoreConfig::new(ctx.clone())));
    pipeline.push(Box::new(DatastoreSetup::new(ctx.clone())));
    pipeline.push(Box::new(DatastoreCertificate::new(ctx.clone())));
    pipeline.push(Box::new(ControlPlaneDeployment::new(ctx.clone())));
    pipeline.push(Box::new(ApiServerIngress::new(ctx.clone())));
    for phase in [
        KubeadmPhase::UploadConfigKubeadm,
        KubeadmPhase::UploadConfigKubelet,
        KubeadmPhase::BootstrapToken,
    ] {
        pipeline.push(Box::new(Phase::new(phase, ctx.clone())));
    }
    for kind in [AddonKind::CoreDns, AddonKind::KubeProxy] {
        pipeline.push(Box::new(Addon::new(kind, ctx.clone())));
    }
    pipeline
}

/// Resources holding external state released when the tenant is deleted.
/// A running migration is stopped before the storage it writes to goes away.
pub fn deletable(ctx: &Arc<Context>) -> Vec<Box<dyn DeletableResource>> {
    vec![
        Box::new(DatastoreMigrate::new(ctx.clone())),
        Box::new(DatastoreSetup::new(ctx.clone())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing::Harness;

    #[test]
    fn test_pipeline_order() {
        let harness = Harness::new();
        let names: Vec<&str> = resources(&harness.ctx).iter().map(|r| r.name()).collect();

        let position = |name: &str| {
            names
                .iter()
                .position(|n| *n == name)
                .unwrap_or_else(|| panic!("{name} missing from {names:?}"))
        };
        assert_eq!(names.len(), 23);
        assert_eq!(names[0], "datastore-migrate");
        assert!(position("ca") < position("api-server-certificate"));
        assert!(position("admin-kubeconfig") < position("datastore-config"));
        assert!(position("datastore-setup") < position("deployment"));
        assert!(position("deployment") < position("upload-config-kubeadm"));
        assert_eq!(*names.last().unwrap(), "addon-kube-proxy");
    }

    #[test]
    fn test_migration_is_stopped_before_teardown() {
        let harness = Harness::new();
        let names: Vec<&str> = deletable(&harness.ctx).iter().map(|r| r.name()).collect();
        assert_eq!(names, ["datastore-migrate", "datastore-setup"]);
    }
}
