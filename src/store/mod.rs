//! Object Store Port
//!
//! Every read and write of Kubernetes objects goes through [`ObjectStore`],
//! a dynamic-object boundary with a kube-backed adapter ([`KubeStore`]).
//! [`Objects`] layers typed access on top of it.

pub mod cluster;
#[cfg(test)]
pub mod memory;
pub mod tenant;

pub use cluster::KubeStore;
pub use tenant::{KubeconfigClients, TenantClients};

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};

// =============================================================================
// Object Store Port
// =============================================================================

/// Port for reading and writing Kubernetes objects.
///
/// `replace` and `replace_status` must reject writes whose
/// `metadata.resourceVersion` is stale with [`Error::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    async fn replace_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete an object. Returns false when it was already absent.
    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str)
        -> Result<bool>;
}

pub type ObjectStoreRef = Arc<dyn ObjectStore>;

// =============================================================================
// Typed Access
// =============================================================================

/// Typed facade over an [`ObjectStore`] for one kind, scoped to a namespace
/// or cluster-wide.
pub struct Objects<K> {
    store: ObjectStoreRef,
    resource: ApiResource,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Objects<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> Objects<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn namespaced(store: ObjectStoreRef, namespace: &str) -> Self {
        Self {
            store,
            resource: ApiResource::erase::<K>(&()),
            namespace: Some(namespace.to_string()),
            _kind: PhantomData,
        }
    }

    pub fn all(store: ObjectStoreRef) -> Self {
        Self {
            store,
            resource: ApiResource::erase::<K>(&()),
            namespace: None,
            _kind: PhantomData,
        }
    }

    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub async fn get(&self, name: &str) -> Result<Option<K>> {
        match self
            .store
            .get(&self.resource, self.namespace.as_deref(), name)
            .await?
        {
            Some(object) => Ok(Some(from_dynamic(object)?)),
            None => Ok(None),
        }
    }

    /// Like [`Objects::get`] but absence is an error
    pub async fn get_required(&self, name: &str) -> Result<K> {
        self.get(name).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: self.resource.kind.clone(),
            name: name.to_string(),
        })
    }

    pub async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>> {
        self.store
            .list(&self.resource, self.namespace.as_deref(), label_selector)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    pub async fn create(&self, object: &K) -> Result<K> {
        let created = self
            .store
            .create(&self.resource, self.namespace.as_deref(), &to_dynamic(object)?)
            .await?;
        from_dynamic(created)
    }

    pub async fn replace(&self, object: &K) -> Result<K> {
        let replaced = self
            .store
            .replace(&self.resource, self.namespace.as_deref(), &to_dynamic(object)?)
            .await?;
        from_dynamic(replaced)
    }

    pub async fn replace_status(&self, object: &K) -> Result<K> {
        let replaced = self
            .store
            .replace_status(&self.resource, self.namespace.as_deref(), &to_dynamic(object)?)
            .await?;
        from_dynamic(replaced)
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        self.store
            .delete(&self.resource, self.namespace.as_deref(), name)
            .await
    }
}

/// Convert a typed object into its dynamic representation
pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Convert a dynamic object into a typed one
pub fn from_dynamic<K: DeserializeOwned>(object: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}
