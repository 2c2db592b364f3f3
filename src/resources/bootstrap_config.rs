//! kubeadm configuration of a tenant
//!
//! Rendered into a ConfigMap next to the tenant. The kubeadm phases later
//! upload the `ClusterConfiguration` document into the tenant cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::certificates::api_server_sans;
use super::{adopt, derived_name, Resource};
use crate::controllers::Context;
use crate::crd::{TenantControlPlane, TenantControlPlaneStatus, CHECKSUM_ANNOTATION};
use crate::error::Result;
use crate::store::Objects;
use crate::utilities::{create_or_update, string_checksum, OperationResult};

pub const CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";
pub const INIT_CONFIGURATION_KEY: &str = "InitConfiguration";

const KUBEADM_API_VERSION: &str = "kubeadm.k8s.io/v1beta3";

/// kubeadm `ClusterConfiguration` for the tenant
pub fn cluster_configuration(tenant: &TenantControlPlane, address: &str, image_registry: &str) -> serde_json::Value {
    let network = &tenant.spec.network_profile;
    json!({
        "apiVersion": KUBEADM_API_VERSION,
        "kind": "ClusterConfiguration",
        "clusterName": tenant.name_any(),
        "kubernetesVersion": tenant.spec.kubernetes.version,
        "controlPlaneEndpoint": format!("{}:{}", address, network.port),
        "imageRepository": image_registry,
        "networking": {
            "dnsDomain": network.cluster_domain,
            "podSubnet": network.pod_cidr,
            "serviceSubnet": network.service_cidr,
        },
        "apiServer": {
            "certSANs": api_server_sans(tenant, address),
        },
    })
}

/// kubeadm `InitConfiguration` for the tenant
pub fn init_configuration(tenant: &TenantControlPlane, address: &str) -> serde_json::Value {
    json!({
        "apiVersion": KUBEADM_API_VERSION,
        "kind": "InitConfiguration",
        "localAPIEndpoint": {
            "advertiseAddress": address,
            "bindPort": tenant.spec.network_profile.port,
        },
        "nodeRegistration": {
            "kubeletExtraArgs": {
                "cgroup-driver": tenant.spec.kubernetes.kubelet.cgroup_driver,
            },
        },
    })
}

pub struct BootstrapConfig {
    ctx: Arc<Context>,
    configmap_name: String,
    data: BTreeMap<String, String>,
    checksum: String,
}

impl BootstrapConfig {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            configmap_name: String::new(),
            data: BTreeMap::new(),
            checksum: String::new(),
        }
    }
}

#[async_trait]
impl Resource for BootstrapConfig {
    fn name(&self) -> &'static str {
        "kubeadm-config"
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.configmap_name = derived_name(tenant, "kubeadmconfig");
        let address = tenant.declared_control_plane_address()?;

        self.data = BTreeMap::from([
            (
                CLUSTER_CONFIGURATION_KEY.to_string(),
                serde_yaml::to_string(&cluster_configuration(tenant, &address, &self.ctx.config.image_registry))?,
            ),
            (
                INIT_CONFIGURATION_KEY.to_string(),
                serde_yaml::to_string(&init_configuration(tenant, &address))?,
            ),
        ]);
        self.checksum = string_checksum(&self.data);
        Ok(())
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let configmaps: Objects<ConfigMap> =
            Objects::namespaced(self.ctx.store.clone(), &tenant.namespace_or_default());
        let (result, _) = create_or_update(&configmaps, &self.configmap_name, |configmap| {
            adopt(&mut configmap.metadata, tenant);
            configmap
                .annotations_mut()
                .insert(CHECKSUM_ANNOTATION.to_string(), self.checksum.clone());
            configmap.data = Some(self.data.clone());
            Ok(())
        })
        .await?;
        Ok(result)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let status = tenant.status_or_default().kubeadm_config;
        status.configmap_name != self.configmap_name || status.checksum != self.checksum
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        status.kubeadm_config.record(&self.configmap_name, &self.checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::resources::testing::{apply_status, Harness};
    use crate::resources::{handle, Outcome};

    #[tokio::test]
    async fn test_config_follows_spec() {
        let harness = Harness::new();
        let mut tcp = tenant("default", "alpha");
        tcp.spec.network_profile.address = Some("192.0.2.10".into());

        let mut resource = BootstrapConfig::new(harness.ctx.clone());
        assert_eq!(
            handle(&mut resource, &tcp).await.unwrap(),
            Outcome::Applied(OperationResult::Created)
        );
        apply_status(&resource, &mut tcp);
        assert_eq!(tcp.status_or_default().kubeadm_config.configmap_name, "alpha-kubeadmconfig");

        let mut resource = BootstrapConfig::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::Unchanged);

        tcp.spec.kubernetes.version = "v1.30.0".into();
        let mut resource = BootstrapConfig::new(harness.ctx.clone());
        assert_eq!(
            handle(&mut resource, &tcp).await.unwrap(),
            Outcome::Applied(OperationResult::Updated)
        );
        assert!(resource.data[CLUSTER_CONFIGURATION_KEY].contains("kubernetesVersion: v1.30.0"));
    }

    #[test]
    fn test_cluster_configuration() {
        let tcp = tenant("default", "alpha");
        let config = cluster_configuration(&tcp, "192.0.2.10", "registry.k8s.io");
        assert_eq!(config["controlPlaneEndpoint"], "192.0.2.10:6443");
        assert_eq!(config["networking"]["serviceSubnet"], "10.96.0.0/16");
    }
}
