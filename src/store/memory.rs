//! In-memory Object Store used by tests
//!
//! Mimics the API server semantics the reconcilers depend on:
//! resourceVersion conflicts, AlreadyExists on create, status-only writes
//! and finalizer-gated deletion.

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ObjectStore;
use crate::error::{Error, Result};

type Key = (String, String, String, String);

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    version: AtomicU64,
    writes: AtomicU64,
}

fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    (
        resource.api_version.clone(),
        resource.kind.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn name_of(object: &DynamicObject) -> String {
    object.metadata.name.clone().unwrap_or_default()
}

fn resource_version(value: &Value) -> Option<String> {
    value["metadata"]["resourceVersion"]
        .as_str()
        .map(str::to_string)
}

fn matches_selector(value: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = &value["metadata"]["labels"];
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels[k.trim()].as_str() == Some(v.trim()),
            None => !labels[term.trim()].is_null(),
        })
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Number of successful mutating calls so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Store an object as-is, bypassing all checks. Used to seed fixtures
    /// and to emulate other controllers (e.g. the Job controller).
    pub fn seed<K: serde::Serialize>(&self, resource: &ApiResource, namespace: Option<&str>, object: &K) {
        let mut value = serde_json::to_value(object).expect("fixture serializes");
        let name = value["metadata"]["name"].as_str().unwrap_or_default().to_string();
        value["metadata"]["resourceVersion"] = json!(self.next_version());
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(format!("uid-{name}"));
        }
        self.objects
            .lock()
            .insert(key(resource, namespace, &name), value);
    }

    pub fn contains(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> bool {
        self.objects
            .lock()
            .contains_key(&key(resource, namespace, name))
    }

    fn store(&self, key: Key, mut value: Value) -> Result<DynamicObject> {
        value["metadata"]["resourceVersion"] = json!(self.next_version());

        let finalizers_empty = value["metadata"]["finalizers"]
            .as_array()
            .map_or(true, |f| f.is_empty());
        let deleting = !value["metadata"]["deletionTimestamp"].is_null();

        let mut objects = self.objects.lock();
        if deleting && finalizers_empty {
            objects.remove(&key);
        } else {
            objects.insert(key, value.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let objects = self.objects.lock();
        match objects.get(&key(resource, namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let objects = self.objects.lock();
        objects
            .iter()
            .filter(|((api_version, kind, ns, _), _)| {
                api_version == &resource.api_version
                    && kind == &resource.kind
                    && namespace.map_or(true, |wanted| wanted == ns)
            })
            .filter(|(_, value)| matches_selector(value, label_selector))
            .map(|(_, value)| Ok(serde_json::from_value(value.clone())?))
            .collect()
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = name_of(object);
        let key = key(resource, namespace, &name);
        if self.objects.lock().contains_key(&key) {
            return Err(Error::Conflict {
                kind: resource.kind.clone(),
                name,
            });
        }
        let mut value = serde_json::to_value(object)?;
        value["metadata"]["uid"] = json!(format!("uid-{name}"));
        if let Some(ns) = namespace {
            value["metadata"]["namespace"] = json!(ns);
        }
        self.store(key, value)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = name_of(object);
        let key = key(resource, namespace, &name);
        let current = self
            .objects
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: resource.kind.clone(),
                name: name.clone(),
            })?;

        let mut value = serde_json::to_value(object)?;
        if resource_version(&value) != resource_version(&current) {
            return Err(Error::Conflict {
                kind: resource.kind.clone(),
                name,
            });
        }
        // The main resource endpoint never writes status
        if !current["status"].is_null() {
            value["status"] = current["status"].clone();
        }
        self.store(key, value)
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = name_of(object);
        let key = key(resource, namespace, &name);
        let mut current = self
            .objects
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: resource.kind.clone(),
                name: name.clone(),
            })?;

        let incoming = serde_json::to_value(object)?;
        if resource_version(&incoming) != resource_version(&current) {
            return Err(Error::Conflict {
                kind: resource.kind.clone(),
                name,
            });
        }
        current["status"] = incoming["status"].clone();
        self.store(key, current)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let key = key(resource, namespace, name);
        let mut objects = self.objects.lock();
        let Some(current) = objects.get_mut(&key) else {
            return Ok(false);
        };

        let has_finalizers = current["metadata"]["finalizers"]
            .as_array()
            .map_or(false, |f| !f.is_empty());
        if has_finalizers {
            current["metadata"]["deletionTimestamp"] = json!(chrono::Utc::now().to_rfc3339());
        } else {
            objects.remove(&key);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Objects;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::sync::Arc;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let maps: Objects<ConfigMap> = Objects::namespaced(store.clone(), "default");

        let created = maps.create(&config_map("settings")).await.unwrap();
        let mut first = created.clone();
        first.data = Some([("a".to_string(), "1".to_string())].into());
        maps.replace(&first).await.unwrap();

        let mut stale = created;
        stale.data = Some([("a".to_string(), "2".to_string())].into());
        assert_matches!(maps.replace(&stale).await, Err(Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_create_existing_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let maps: Objects<ConfigMap> = Objects::namespaced(store, "default");
        maps.create(&config_map("settings")).await.unwrap();
        assert_matches!(
            maps.create(&config_map("settings")).await,
            Err(Error::Conflict { .. })
        );
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_marks_deletion() {
        let store = Arc::new(MemoryStore::new());
        let maps: Objects<ConfigMap> = Objects::namespaced(store.clone(), "default");
        let mut cm = config_map("guarded");
        cm.metadata.finalizers = Some(vec!["hangar.io/finalizer".into()]);
        maps.create(&cm).await.unwrap();

        assert!(maps.delete("guarded").await.unwrap());
        let marked = maps.get("guarded").await.unwrap().unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        let mut released = marked;
        released.metadata.finalizers = Some(vec![]);
        maps.replace(&released).await.unwrap();
        assert!(maps.get("guarded").await.unwrap().is_none());
        assert!(!maps.delete("guarded").await.unwrap());
    }
}
