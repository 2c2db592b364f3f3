//! Optional Ingress in front of the API server
//!
//! TLS is passed through to kube-apiserver, the ingress controller only
//! routes on SNI. Removing `controlPlane.ingress` deletes the object.

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    ServiceBackendPort,
};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::info;

use super::{adopt, Resource};
use crate::controllers::Context;
use crate::crd::{IngressStatus, TenantControlPlane, TenantControlPlaneStatus};
use crate::error::Result;
use crate::store::Objects;
use crate::utilities::{create_or_update, OperationResult};

const SSL_PASSTHROUGH_ANNOTATION: &str = "nginx.ingress.kubernetes.io/ssl-passthrough";
const BACKEND_PROTOCOL_ANNOTATION: &str = "nginx.ingress.kubernetes.io/backend-protocol";

pub struct ApiServerIngress {
    ctx: Arc<Context>,
    name: String,
    desired: Option<crate::crd::IngressSpec>,
}

impl ApiServerIngress {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            name: String::new(),
            desired: None,
        }
    }

    fn ingresses(&self, tenant: &TenantControlPlane) -> Objects<Ingress> {
        Objects::namespaced(self.ctx.store.clone(), &tenant.namespace_or_default())
    }

    fn observed(&self) -> IngressStatus {
        match self.desired.as_ref() {
            Some(spec) => IngressStatus {
                name: self.name.clone(),
                hostname: spec.hostname.clone(),
            },
            None => IngressStatus::default(),
        }
    }
}

#[async_trait]
impl Resource for ApiServerIngress {
    fn name(&self) -> &'static str {
        "ingress"
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.name = tenant.name_any();
        self.desired = tenant.spec.control_plane.ingress.clone();
        Ok(())
    }

    fn should_cleanup(&self, _tenant: &TenantControlPlane) -> bool {
        self.desired.is_none()
    }

    async fn clean_up(&mut self, tenant: &TenantControlPlane) -> Result<bool> {
        let deleted = self.ingresses(tenant).delete(&self.name).await?;
        if deleted {
            info!(tenant = %tenant.key(), ingress = %self.name, "ingress removed");
        }
        let recorded = tenant.status_or_default().kubernetes_resources.ingress != IngressStatus::default();
        Ok(deleted || recorded)
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let Some(desired) = self.desired.clone() else {
            return Ok(OperationResult::None);
        };
        let service = tenant.name_any();
        let port = tenant.spec.network_profile.port;

        let (result, _) = create_or_update(&self.ingresses(tenant), &self.name, |ingress| {
            adopt(&mut ingress.metadata, tenant);
            let annotations = ingress.annotations_mut();
            annotations.insert(SSL_PASSTHROUGH_ANNOTATION.to_string(), "true".to_string());
            annotations.insert(BACKEND_PROTOCOL_ANNOTATION.to_string(), "HTTPS".to_string());

            ingress.spec = Some(IngressSpec {
                ingress_class_name: desired.ingress_class_name.clone(),
                rules: Some(vec![IngressRule {
                    host: Some(desired.hostname.clone()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: service.clone(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(port),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            });
            Ok(())
        })
        .await?;
        Ok(result)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        tenant.status_or_default().kubernetes_resources.ingress != self.observed()
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        status.kubernetes_resources.ingress = self.observed();
    }
}
