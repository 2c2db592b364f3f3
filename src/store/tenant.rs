//! Access to tenant clusters
//!
//! Kubeadm phases and add-ons write objects into the tenant's own API
//! server. [`TenantClients`] hands out an [`ObjectStore`](super::ObjectStore)
//! for a tenant, built from its admin kubeconfig.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use std::sync::Arc;

use super::{KubeStore, ObjectStoreRef, Objects};
use crate::crd::TenantControlPlane;
use crate::error::{Error, Result};

/// Key of the admin kubeconfig inside its secret
pub const ADMIN_KUBECONFIG_KEY: &str = "admin.conf";

#[async_trait]
pub trait TenantClients: Send + Sync {
    async fn store(&self, tenant: &TenantControlPlane) -> Result<ObjectStoreRef>;
}

/// Connects to tenant API servers through their in-cluster Service
pub struct KubeconfigClients {
    store: ObjectStoreRef,
}

impl KubeconfigClients {
    pub fn new(store: ObjectStoreRef) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TenantClients for KubeconfigClients {
    async fn store(&self, tenant: &TenantControlPlane) -> Result<ObjectStoreRef> {
        let status = tenant.status_or_default();
        let secret_name = status.kubeconfig.admin.secret_name;
        if secret_name.is_empty() {
            return Err(Error::missing("tenant client", "admin kubeconfig not generated yet"));
        }

        let secrets: Objects<Secret> = Objects::namespaced(self.store.clone(), &tenant.namespace_or_default());
        let secret = secrets.get_required(&secret_name).await?;
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(ADMIN_KUBECONFIG_KEY))
            .ok_or_else(|| Error::Kubeconfig(format!("secret {secret_name} has no {ADMIN_KUBECONFIG_KEY}")))?;
        let yaml = std::str::from_utf8(&raw.0).map_err(|e| Error::Kubeconfig(e.to_string()))?;

        let mut kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| Error::Kubeconfig(e.to_string()))?;
        // The advertised endpoint may only be reachable from outside
        let internal = format!(
            "https://{}.{}.svc:{}",
            tenant.name_any(),
            tenant.namespace_or_default(),
            tenant.spec.network_profile.port
        );
        for named in kubeconfig.clusters.iter_mut() {
            if let Some(cluster) = named.cluster.as_mut() {
                cluster.server = Some(internal.clone());
            }
        }

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Kubeconfig(e.to_string()))?;
        let client = Client::try_from(config)?;
        Ok(Arc::new(KubeStore::new(client)))
    }
}

/// Every tenant resolves to the same store
#[cfg(test)]
pub struct StaticTenantClients(pub ObjectStoreRef);

#[cfg(test)]
#[async_trait]
impl TenantClients for StaticTenantClients {
    async fn store(&self, _tenant: &TenantControlPlane) -> Result<ObjectStoreRef> {
        Ok(self.0.clone())
    }
}
