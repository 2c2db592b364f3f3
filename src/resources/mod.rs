//! Tenant resources
//!
//! Each resource owns one piece of a tenant control plane (a secret, a
//! config map, a workload, a datastore setup...) and converges it towards
//! the state implied by the TenantControlPlane. The pipeline in
//! [`crate::controllers::pipeline`] walks them in dependency order.
//!
//! A resource is driven through [`handle`]:
//!
//! ```text
//! define ──► should_cleanup? ──yes──► clean_up ──► CleanedUp / Unchanged
//!                 │no
//!                 ▼
//!          create_or_update ──changed──► Applied(result)
//!                 │none
//!                 ▼
//!     should_status_be_updated? ──yes──► StatusOnly
//!                 │no
//!                 ▼
//!             Unchanged
//! ```

pub mod addons;
pub mod bootstrap_config;
pub mod certificates;
pub mod datastore_certificate;
pub mod datastore_config;
pub mod datastore_migrate;
pub mod datastore_setup;
pub mod deployment;
pub mod ingress;
pub mod kubeconfig;
pub mod manifest;
pub mod phases;
pub mod service;
pub mod upgrade;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource as KubeResource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::{TenantControlPlane, TenantControlPlaneStatus, TENANT_LABEL};
use crate::error::Result;
use crate::utilities::OperationResult;

// =============================================================================
// Resource Contract
// =============================================================================

/// One convergent piece of a tenant control plane
#[async_trait]
pub trait Resource: Send + Sync {
    /// Identifier used in logs and metrics
    fn name(&self) -> &'static str;

    /// Compute the identity of the managed object and read dependencies
    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()>;

    fn should_cleanup(&self, _tenant: &TenantControlPlane) -> bool {
        false
    }

    /// Remove the managed object. Returns true when something was deleted.
    async fn clean_up(&mut self, _tenant: &TenantControlPlane) -> Result<bool> {
        Ok(false)
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult>;

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool;

    /// Record the resource's state. Must only depend on `self`, the status
    /// write is replayed on conflicts.
    fn update_status(&self, status: &mut TenantControlPlaneStatus);
}

/// Resources with external state that must be released on tenant deletion
#[async_trait]
pub trait DeletableResource: Resource {
    /// Returns true when something was deleted
    async fn delete(&mut self, tenant: &TenantControlPlane) -> Result<bool>;
}

/// What [`handle`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Applied(OperationResult),
    StatusOnly,
    CleanedUp,
}

impl Outcome {
    pub fn changed(&self) -> bool {
        !matches!(self, Outcome::Unchanged)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Unchanged => write!(f, "unchanged"),
            Outcome::Applied(result) => write!(f, "{result}"),
            Outcome::StatusOnly => write!(f, "status"),
            Outcome::CleanedUp => write!(f, "cleaned-up"),
        }
    }
}

/// Drive one resource through a single convergence step
pub async fn handle<R: Resource + ?Sized>(resource: &mut R, tenant: &TenantControlPlane) -> Result<Outcome> {
    resource.define(tenant).await?;

    if resource.should_cleanup(tenant) {
        return Ok(if resource.clean_up(tenant).await? {
            Outcome::CleanedUp
        } else {
            Outcome::Unchanged
        });
    }

    match resource.create_or_update(tenant).await? {
        OperationResult::None => {}
        result => return Ok(Outcome::Applied(result)),
    }

    if resource.should_status_be_updated(tenant) {
        return Ok(Outcome::StatusOnly);
    }
    Ok(Outcome::Unchanged)
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Labels carried by every object managed for `tenant`
pub fn tenant_labels(tenant: &TenantControlPlane) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TENANT_LABEL.to_string(), tenant.name_any()),
        ("app.kubernetes.io/managed-by".to_string(), "hangar".to_string()),
    ])
}

/// Label an object and make the tenant its controlling owner
pub fn adopt(meta: &mut ObjectMeta, tenant: &TenantControlPlane) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(tenant_labels(tenant));

    if let Some(owner) = tenant.controller_owner_ref(&()) {
        let owners = meta.owner_references.get_or_insert_with(Vec::new);
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner);
        }
    }
}

/// Name of an object derived from the tenant name
pub fn derived_name(tenant: &TenantControlPlane, suffix: &str) -> String {
    format!("{}-{}", tenant.name_any(), suffix)
}

/// UTF-8 value of a secret key
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
}

/// Build secret data from string pairs
pub fn secret_data<'a, I>(pairs: I) -> BTreeMap<String, k8s_openapi::ByteString>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), k8s_openapi::ByteString(v.as_bytes().to_vec())))
        .collect()
}

/// First usable address of a CIDR, e.g. the kubernetes Service IP
pub fn first_address(cidr: &str) -> Option<std::net::IpAddr> {
    let (network, _) = cidr.split_once('/')?;
    match network.parse::<std::net::IpAddr>().ok()? {
        std::net::IpAddr::V4(v4) => Some(std::net::Ipv4Addr::from(u32::from(v4).checked_add(1)?).into()),
        std::net::IpAddr::V6(v6) => Some(std::net::Ipv6Addr::from(u128::from(v6).checked_add(1)?).into()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the resource and controller tests

    use std::sync::Arc;

    use crate::config::OperatorConfig;
    use crate::controllers::Context;
    use crate::crd::{DataStore, DataStoreDriver, DataStoreSpec, TenantControlPlane};
    use crate::datastore::memory::MemoryFactory;
    use crate::metrics::Metrics;
    use crate::store::memory::MemoryStore;
    use crate::store::tenant::StaticTenantClients;
    use crate::store::{ObjectStoreRef, Objects};

    pub struct Harness {
        pub ctx: Arc<Context>,
        pub store: Arc<MemoryStore>,
        pub tenant_store: Arc<MemoryStore>,
        pub backends: MemoryFactory,
    }

    impl Harness {
        pub fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let tenant_store = Arc::new(MemoryStore::new());
            let backends = MemoryFactory::default();
            let shared: ObjectStoreRef = store.clone();
            let ctx = Arc::new(Context {
                store: shared,
                connections: Arc::new(backends.clone()),
                tenant_clients: Arc::new(StaticTenantClients(tenant_store.clone())),
                config: OperatorConfig::default(),
                metrics: Arc::new(Metrics::new().unwrap()),
            });
            Self {
                ctx,
                store,
                tenant_store,
                backends,
            }
        }

        /// Register a DataStore object and its in-memory backend
        pub async fn datastore(&self, name: &str, driver: DataStoreDriver) {
            self.backends.register(name, driver);
            let datastores: Objects<DataStore> = Objects::all(self.ctx.store.clone());
            datastores
                .create(&DataStore::new(
                    name,
                    DataStoreSpec {
                        driver,
                        endpoints: vec![format!("{name}:2379")],
                        basic_auth: None,
                        tls_config: None,
                    },
                ))
                .await
                .unwrap();
        }

        /// Persist a tenant and return the stored copy
        pub async fn tenant(&self, tenant: TenantControlPlane) -> TenantControlPlane {
            let ns = tenant.metadata.namespace.clone().unwrap();
            let tenants: Objects<TenantControlPlane> = Objects::namespaced(self.ctx.store.clone(), &ns);
            tenants.create(&tenant).await.unwrap()
        }

        /// Re-read a tenant
        pub async fn reload(&self, tenant: &TenantControlPlane) -> TenantControlPlane {
            let ns = tenant.metadata.namespace.clone().unwrap();
            let name = tenant.metadata.name.clone().unwrap();
            let tenants: Objects<TenantControlPlane> = Objects::namespaced(self.ctx.store.clone(), &ns);
            tenants.get_required(&name).await.unwrap()
        }
    }

    /// Apply a resource's status to the tenant in memory, as the reconciler would
    pub fn apply_status(resource: &dyn super::Resource, tenant: &mut TenantControlPlane) {
        let mut status = tenant.status_or_default();
        resource.update_status(&mut status);
        tenant.status = Some(status);
    }
}
