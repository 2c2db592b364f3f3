//! Object bundles written into tenant clusters
//!
//! The kubeadm phases and add-ons render a handful of heterogeneous objects
//! (RBAC, ConfigMaps, workloads). A [`Manifest`] keeps them as dynamic
//! objects, applies them in dependency order and fingerprints the whole set
//! so a bundle is only pushed again when its content changes.

use kube::api::{ApiResource, DynamicObject};
use kube::Resource;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::store::{to_dynamic, ObjectStoreRef};
use crate::utilities::upsert::backoff_on_conflict;
use crate::utilities::{object_checksum, ConflictBackoff, OperationResult};

/// Apply order of a kind, lower first
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 10,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    objects: Vec<(ApiResource, DynamicObject)>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed object to the bundle
    pub fn push<K>(&mut self, object: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let resource = ApiResource::erase::<K>(&());
        let mut dynamic = to_dynamic(object)?;
        dynamic.types = Some(kube::api::TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        self.objects.push((resource, dynamic));
        self.objects.sort_by_key(|(resource, _)| kind_priority(&resource.kind));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Fingerprint of the rendered objects
    pub fn checksum(&self) -> Result<String> {
        let rendered: Vec<&DynamicObject> = self.objects.iter().map(|(_, object)| object).collect();
        object_checksum(&rendered)
    }

    /// Create or overwrite every object. Returns whether anything was written.
    pub async fn apply(&self, store: &ObjectStoreRef) -> Result<bool> {
        let mut changed = false;
        for (resource, desired) in &self.objects {
            let name = desired.metadata.name.clone().unwrap_or_default();
            let mut schedule = ConflictBackoff::default();
            let result = loop {
                match apply_one(store, resource, desired).await {
                    Err(err) => backoff_on_conflict(&mut schedule, err, &resource.kind, &name).await?,
                    Ok(result) => break result,
                }
            };
            if result != OperationResult::None {
                debug!(kind = %resource.kind, %name, %result, "tenant object applied");
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Delete every object, dependents first. Returns whether anything was deleted.
    pub async fn delete(&self, store: &ObjectStoreRef) -> Result<bool> {
        let mut deleted = false;
        for (resource, object) in self.objects.iter().rev() {
            let name = object.metadata.name.clone().unwrap_or_default();
            deleted |= store
                .delete(resource, object.metadata.namespace.as_deref(), &name)
                .await?;
        }
        Ok(deleted)
    }
}

/// Overwrite everything but the server-managed metadata
async fn apply_one(store: &ObjectStoreRef, resource: &ApiResource, desired: &DynamicObject) -> Result<OperationResult> {
    let namespace = desired.metadata.namespace.as_deref();
    let name = desired.metadata.name.clone().unwrap_or_default();

    let Some(current) = store.get(resource, namespace, &name).await? else {
        store.create(resource, namespace, desired).await?;
        return Ok(OperationResult::Created);
    };

    let mut merged = desired.clone();
    merged.metadata = current.metadata.clone();
    merged.metadata.labels = desired.metadata.labels.clone();
    merged.metadata.annotations = desired.metadata.annotations.clone();
    // Status and other server-populated fields are not ours to overwrite
    if let (Some(live), Some(target)) = (current.data.get("status"), merged.data.as_object_mut()) {
        target.insert("status".to_string(), live.clone());
    }

    if merged.metadata == current.metadata && merged.data == current.data {
        return Ok(OperationResult::None);
    }
    store.replace(resource, namespace, &merged).await?;
    Ok(OperationResult::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::Objects;
    use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
    use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn config_map(value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("kubeadm-config".into()),
                namespace: Some("kube-system".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("key".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn test_objects_are_ordered_by_kind() {
        let mut manifest = Manifest::new();
        manifest.push(&config_map("a")).unwrap();
        manifest
            .push(&ClusterRoleBinding {
                metadata: ObjectMeta {
                    name: Some("binding".into()),
                    ..Default::default()
                },
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".into(),
                    kind: "ClusterRole".into(),
                    name: "view".into(),
                },
                subjects: None,
            })
            .unwrap();
        manifest
            .push(&ServiceAccount {
                metadata: ObjectMeta {
                    name: Some("sa".into()),
                    namespace: Some("kube-system".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let kinds: Vec<&str> = manifest.objects.iter().map(|(r, _)| r.kind.as_str()).collect();
        assert_eq!(kinds, ["ServiceAccount", "ClusterRoleBinding", "ConfigMap"]);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let memory = Arc::new(MemoryStore::new());
        let store: ObjectStoreRef = memory.clone();

        let mut manifest = Manifest::new();
        manifest.push(&config_map("one")).unwrap();
        assert!(manifest.apply(&store).await.unwrap());
        assert!(!manifest.apply(&store).await.unwrap());
        assert_eq!(memory.writes(), 1);

        let mut changed = Manifest::new();
        changed.push(&config_map("two")).unwrap();
        assert_ne!(manifest.checksum().unwrap(), changed.checksum().unwrap());
        assert!(changed.apply(&store).await.unwrap());

        let live = Objects::<ConfigMap>::namespaced(store.clone(), "kube-system")
            .get_required("kubeadm-config")
            .await
            .unwrap();
        assert_eq!(live.data.unwrap()["key"], "two");

        assert!(changed.delete(&store).await.unwrap());
        assert!(!changed.delete(&store).await.unwrap());
    }
}
