//! kubeadm phases run against the tenant cluster
//!
//! Once the control plane answers, the objects `kubeadm init` would upload
//! are written through the tenant's own API server so that worker nodes can
//! join with `kubeadm join`. Each phase records the checksum of what it
//! uploaded and is skipped while that checksum still matches.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::bootstrap_config::{cluster_configuration, CLUSTER_CONFIGURATION_KEY};
use super::manifest::Manifest;
use super::{secret_value, Resource};
use crate::controllers::Context;
use crate::crd::{PhaseStatus, TenantControlPlane, TenantControlPlaneStatus};
use crate::error::{Error, Result};
use crate::pki::kubeconfig::Kubeconfig;
use crate::store::Objects;
use crate::utilities::OperationResult;

const KUBE_SYSTEM: &str = "kube-system";
const KUBE_PUBLIC: &str = "kube-public";
const BOOTSTRAP_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";
const NODES_GROUP: &str = "system:nodes";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// The phases, in the order kubeadm runs them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeadmPhase {
    UploadConfigKubeadm,
    UploadConfigKubelet,
    BootstrapToken,
}

impl KubeadmPhase {
    pub fn resource_name(&self) -> &'static str {
        match self {
            KubeadmPhase::UploadConfigKubeadm => "upload-config-kubeadm",
            KubeadmPhase::UploadConfigKubelet => "upload-config-kubelet",
            KubeadmPhase::BootstrapToken => "bootstrap-token",
        }
    }

    fn status<'a>(&self, status: &'a TenantControlPlaneStatus) -> &'a PhaseStatus {
        let phases = &status.kubeadm_phase;
        match self {
            KubeadmPhase::UploadConfigKubeadm => &phases.upload_config_kubeadm,
            KubeadmPhase::UploadConfigKubelet => &phases.upload_config_kubelet,
            KubeadmPhase::BootstrapToken => &phases.bootstrap_token,
        }
    }

    fn status_mut<'a>(&self, status: &'a mut TenantControlPlaneStatus) -> &'a mut PhaseStatus {
        let phases = &mut status.kubeadm_phase;
        match self {
            KubeadmPhase::UploadConfigKubeadm => &mut phases.upload_config_kubeadm,
            KubeadmPhase::UploadConfigKubelet => &mut phases.upload_config_kubelet,
            KubeadmPhase::BootstrapToken => &mut phases.bootstrap_token,
        }
    }
}

// =============================================================================
// Rendering
// =============================================================================

fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

fn group(name: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_GROUP.to_string()),
        kind: "Group".to_string(),
        name: name.to_string(),
        namespace: None,
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// ConfigMap readable by `subjects` through a dedicated Role
fn readable_config_map(
    manifest: &mut Manifest,
    namespace: &str,
    name: &str,
    data: BTreeMap<String, String>,
    role: &str,
    subjects: Vec<Subject>,
) -> Result<()> {
    manifest.push(&ConfigMap {
        metadata: meta(Some(namespace), name),
        data: Some(data),
        ..Default::default()
    })?;
    manifest.push(&Role {
        metadata: meta(Some(namespace), role),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["configmaps".to_string()]),
            resource_names: Some(vec![name.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }]),
    })?;
    manifest.push(&RoleBinding {
        metadata: meta(Some(namespace), role),
        role_ref: role_ref("Role", role),
        subjects: Some(subjects),
    })
}

fn cluster_role_binding(manifest: &mut Manifest, name: &str, cluster_role: &str, subject: Subject) -> Result<()> {
    manifest.push(&ClusterRoleBinding {
        metadata: meta(None, name),
        role_ref: role_ref("ClusterRole", cluster_role),
        subjects: Some(vec![subject]),
    })
}

/// `KubeletConfiguration` shared by every node of the tenant
pub fn kubelet_configuration(tenant: &TenantControlPlane) -> serde_json::Value {
    let network = &tenant.spec.network_profile;
    json!({
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "kind": "KubeletConfiguration",
        "cgroupDriver": tenant.spec.kubernetes.kubelet.cgroup_driver,
        "clusterDNS": network.dns_service_ips,
        "clusterDomain": network.cluster_domain,
        "authentication": {
            "anonymous": { "enabled": false },
            "webhook": { "enabled": true },
            "x509": { "clientCAFile": "/etc/kubernetes/pki/ca.crt" },
        },
        "authorization": { "mode": "Webhook" },
        "rotateCertificates": true,
        "staticPodPath": "/etc/kubernetes/manifests",
    })
}

// =============================================================================
// Resource
// =============================================================================

pub struct Phase {
    phase: KubeadmPhase,
    ctx: Arc<Context>,
    manifest: Manifest,
    checksum: String,
}

impl Phase {
    pub fn new(phase: KubeadmPhase, ctx: Arc<Context>) -> Self {
        Self {
            phase,
            ctx,
            manifest: Manifest::new(),
            checksum: String::new(),
        }
    }

    async fn render(&self, tenant: &TenantControlPlane) -> Result<Manifest> {
        let mut manifest = Manifest::new();
        let address = tenant.declared_control_plane_address()?;
        let nodes = || vec![group(BOOTSTRAP_GROUP), group(NODES_GROUP)];

        match self.phase {
            KubeadmPhase::UploadConfigKubeadm => {
                let configuration = cluster_configuration(tenant, &address, &self.ctx.config.image_registry);
                readable_config_map(
                    &mut manifest,
                    KUBE_SYSTEM,
                    "kubeadm-config",
                    BTreeMap::from([(
                        CLUSTER_CONFIGURATION_KEY.to_string(),
                        serde_yaml::to_string(&configuration)?,
                    )]),
                    "kubeadm:nodes-kubeadm-config",
                    nodes(),
                )?;
            }
            KubeadmPhase::UploadConfigKubelet => {
                readable_config_map(
                    &mut manifest,
                    KUBE_SYSTEM,
                    "kubelet-config",
                    BTreeMap::from([(
                        "kubelet".to_string(),
                        serde_yaml::to_string(&kubelet_configuration(tenant))?,
                    )]),
                    "kubeadm:kubelet-config",
                    nodes(),
                )?;
            }
            KubeadmPhase::BootstrapToken => {
                let ca = self.certificate_authority(tenant).await?;
                let server = format!("https://{}:{}", address, tenant.spec.network_profile.port);
                readable_config_map(
                    &mut manifest,
                    KUBE_PUBLIC,
                    "cluster-info",
                    BTreeMap::from([(
                        "kubeconfig".to_string(),
                        Kubeconfig::cluster_info(&server, &ca).to_yaml()?,
                    )]),
                    "kubeadm:bootstrap-signer-clusterinfo",
                    vec![Subject {
                        api_group: Some(RBAC_GROUP.to_string()),
                        kind: "User".to_string(),
                        name: "system:anonymous".to_string(),
                        namespace: None,
                    }],
                )?;
                cluster_role_binding(
                    &mut manifest,
                    "kubeadm:kubelet-bootstrap",
                    "system:node-bootstrapper",
                    group(BOOTSTRAP_GROUP),
                )?;
                cluster_role_binding(
                    &mut manifest,
                    "kubeadm:node-autoapprove-bootstrap",
                    "system:certificates.k8s.io:certificatesigningrequests:nodeclient",
                    group(BOOTSTRAP_GROUP),
                )?;
                cluster_role_binding(
                    &mut manifest,
                    "kubeadm:node-autoapprove-certificate-rotation",
                    "system:certificates.k8s.io:certificatesigningrequests:selfnodeclient",
                    group(NODES_GROUP),
                )?;
            }
        }
        Ok(manifest)
    }

    async fn certificate_authority(&self, tenant: &TenantControlPlane) -> Result<String> {
        let recorded = tenant.status_or_default().certificates.ca;
        if recorded.secret_name.is_empty() {
            return Err(Error::missing(self.name(), "CA not generated yet"));
        }
        let secrets: Objects<Secret> = Objects::namespaced(self.ctx.store.clone(), &tenant.namespace_or_default());
        let secret = secrets.get_required(&recorded.secret_name).await?;
        secret_value(&secret, "ca.crt")
            .ok_or_else(|| Error::Certificate(format!("secret {} has no ca.crt", recorded.secret_name)))
    }
}

#[async_trait]
impl Resource for Phase {
    fn name(&self) -> &'static str {
        self.phase.resource_name()
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        if !tenant.status_or_default().kubernetes_resources.deployment.ready {
            return Err(Error::ControlPlaneNotReady { tenant: tenant.key() });
        }
        self.manifest = self.render(tenant).await?;
        self.checksum = self.manifest.checksum()?;
        Ok(())
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        if self.phase.status(&tenant.status_or_default()).checksum == self.checksum {
            return Ok(OperationResult::None);
        }
        let store = self.ctx.tenant_clients.store(tenant).await?;
        if !self.manifest.apply(&store).await? {
            return Ok(OperationResult::None);
        }
        info!(tenant = %tenant.key(), phase = self.name(), "kubeadm phase applied");
        Ok(OperationResult::Updated)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        self.phase.status(&tenant.status_or_default()).checksum != self.checksum
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        self.phase.status_mut(status).record(&self.checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::resources::testing::{apply_status, Harness};
    use crate::resources::{handle, secret_data, Outcome};
    use assert_matches::assert_matches;
    use kube::api::ApiResource;

    async fn ready(harness: &Harness) -> TenantControlPlane {
        let mut tcp = tenant("team-a", "alpha");
        tcp.spec.network_profile.address = Some("192.0.2.10".into());
        let mut status = TenantControlPlaneStatus::default();
        status.kubernetes_resources.deployment.ready = true;
        status.certificates.ca.record("alpha-ca", "sum");
        tcp.status = Some(status);

        let secret = Secret {
            metadata: meta(Some("team-a"), "alpha-ca"),
            data: Some(secret_data([("ca.crt", "ca-pem"), ("ca.key", "key-pem")])),
            ..Default::default()
        };
        harness
            .store
            .seed(&ApiResource::erase::<Secret>(&()), Some("team-a"), &secret);
        tcp
    }

    #[tokio::test]
    async fn test_waits_for_control_plane() {
        let harness = Harness::new();
        let mut tcp = ready(&harness).await;
        tcp.status.as_mut().unwrap().kubernetes_resources.deployment.ready = false;

        let mut phase = Phase::new(KubeadmPhase::UploadConfigKubeadm, harness.ctx.clone());
        let err = handle(&mut phase, &tcp).await.unwrap_err();
        assert!(err.is_sentinel());
        assert_eq!(harness.tenant_store.writes(), 0);
    }

    #[tokio::test]
    async fn test_phases_upload_once() {
        let harness = Harness::new();
        let mut tcp = ready(&harness).await;

        for kind in [
            KubeadmPhase::UploadConfigKubeadm,
            KubeadmPhase::UploadConfigKubelet,
            KubeadmPhase::BootstrapToken,
        ] {
            let mut phase = Phase::new(kind, harness.ctx.clone());
            assert_eq!(
                handle(&mut phase, &tcp).await.unwrap(),
                Outcome::Applied(OperationResult::Updated)
            );
            apply_status(&phase, &mut tcp);

            let writes = harness.tenant_store.writes();
            let mut phase = Phase::new(kind, harness.ctx.clone());
            assert_eq!(handle(&mut phase, &tcp).await.unwrap(), Outcome::Unchanged);
            assert_eq!(harness.tenant_store.writes(), writes);
        }

        let configmaps = ApiResource::erase::<ConfigMap>(&());
        assert!(harness.tenant_store.contains(&configmaps, Some(KUBE_SYSTEM), "kubeadm-config"));
        assert!(harness.tenant_store.contains(&configmaps, Some(KUBE_SYSTEM), "kubelet-config"));

        let cluster_info = Objects::<ConfigMap>::namespaced(harness.tenant_store.clone(), KUBE_PUBLIC)
            .get_required("cluster-info")
            .await
            .unwrap();
        let kubeconfig = Kubeconfig::from_yaml(cluster_info.data.unwrap()["kubeconfig"].as_bytes()).unwrap();
        assert_eq!(kubeconfig.server(), Some("https://192.0.2.10:6443"));
        assert_eq!(kubeconfig.certificate_authority().unwrap(), "ca-pem");
    }

    #[tokio::test]
    async fn test_bootstrap_token_requires_ca() {
        let harness = Harness::new();
        let mut tcp = ready(&harness).await;
        tcp.status.as_mut().unwrap().certificates.ca = Default::default();
        let mut phase = Phase::new(KubeadmPhase::BootstrapToken, harness.ctx.clone());
        assert_matches!(
            handle(&mut phase, &tcp).await,
            Err(Error::MissingPrerequisite { .. })
        );
    }

    #[test]
    fn test_kubelet_configuration() {
        let config = kubelet_configuration(&tenant("team-a", "alpha"));
        assert_eq!(config["cgroupDriver"], "systemd");
        assert_eq!(config["clusterDNS"][0], "10.96.0.10");
    }
}
