//! Kubernetes-backed Object Store
//!
//! Maps the [`ObjectStore`] port onto `kube::Api<DynamicObject>`.
//! HTTP 409 responses become [`Error::Conflict`] so callers can retry.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::ObjectStore;
use crate::error::{Error, Result};

/// Object store talking to a Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn map_err(resource: &ApiResource, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref response) if response.code == 409 => Error::Conflict {
            kind: resource.kind.clone(),
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(resource, namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_err(resource, name, e))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .api(resource, namespace)
            .list(&params)
            .await
            .map_err(|e| map_err(resource, "", e))?;
        Ok(list.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        debug!(kind = %resource.kind, %name, "creating object");
        self.api(resource, namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_err(resource, &name, e))
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        debug!(kind = %resource.kind, %name, "replacing object");
        self.api(resource, namespace)
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| map_err(resource, &name, e))
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        let body = serde_json::to_vec(object)?;
        self.api(resource, namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_err(resource, &name, e))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(map_err(resource, name, e)),
        }
    }
}
