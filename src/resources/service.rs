//! API server Service
//!
//! Exposes the control plane pods and resolves the address clients use:
//! the load balancer ingress for `LoadBalancer` services, the cluster IP
//! otherwise.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{adopt, Resource};
use crate::controllers::Context;
use crate::crd::{ServiceStatus, TenantControlPlane, TenantControlPlaneStatus, TENANT_LABEL};
use crate::error::Result;
use crate::store::Objects;
use crate::utilities::{create_or_update, OperationResult};

/// Labels selecting a tenant's control plane pods
pub fn pod_selector(tenant: &TenantControlPlane) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TENANT_LABEL.to_string(), tenant.name_any()),
        ("app.kubernetes.io/component".to_string(), "control-plane".to_string()),
    ])
}

/// Address published by a Service, if any
pub fn service_address(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() == Some("LoadBalancer") {
        let ingress = service
            .status
            .as_ref()?
            .load_balancer
            .as_ref()?
            .ingress
            .as_ref()?
            .first()?;
        return ingress.ip.clone().or_else(|| ingress.hostname.clone());
    }
    spec.cluster_ip.clone().filter(|ip| !ip.is_empty() && ip != "None")
}

pub struct ApiServerService {
    ctx: Arc<Context>,
    observed: ServiceStatus,
    endpoint: String,
}

impl ApiServerService {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            observed: ServiceStatus::default(),
            endpoint: String::new(),
        }
    }
}

#[async_trait]
impl Resource for ApiServerService {
    fn name(&self) -> &'static str {
        "service"
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.observed = ServiceStatus {
            name: tenant.name_any(),
            namespace: tenant.namespace_or_default(),
            port: tenant.spec.network_profile.port,
            address: None,
        };
        Ok(())
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let services: Objects<Service> = Objects::namespaced(self.ctx.store.clone(), &self.observed.namespace);
        let port = tenant.spec.network_profile.port;
        let service_type = tenant.spec.control_plane.service.service_type.to_string();

        let (result, service) = create_or_update(&services, &self.observed.name, |service| {
            adopt(&mut service.metadata, tenant);
            let spec = service.spec.get_or_insert_with(ServiceSpec::default);
            spec.type_ = Some(service_type.clone());
            spec.selector = Some(pod_selector(tenant));
            spec.ports = Some(vec![ServicePort {
                name: Some("kube-apiserver".to_string()),
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]);
            Ok(())
        })
        .await?;

        self.observed.address = service_address(&service);
        let advertised = tenant
            .spec
            .network_profile
            .address
            .clone()
            .filter(|a| !a.is_empty())
            .or_else(|| self.observed.address.clone());
        self.endpoint = advertised.map(|a| format!("{a}:{port}")).unwrap_or_default();
        Ok(result)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let status = tenant.status_or_default();
        status.kubernetes_resources.service != self.observed || status.control_plane_endpoint != self.endpoint
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        status.kubernetes_resources.service = self.observed.clone();
        status.control_plane_endpoint = self.endpoint.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::crd::ServiceType;
    use crate::resources::testing::{apply_status, Harness};
    use crate::resources::{handle, Outcome};
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus as K8sServiceStatus};
    use kube::api::ApiResource;

    #[tokio::test]
    async fn test_cluster_ip_becomes_endpoint() {
        let harness = Harness::new();
        let mut tcp = tenant("default", "alpha");

        let mut resource = ApiServerService::new(harness.ctx.clone());
        assert_eq!(
            handle(&mut resource, &tcp).await.unwrap(),
            Outcome::Applied(OperationResult::Created)
        );
        apply_status(&resource, &mut tcp);
        // No IP allocated by the in-memory store
        assert!(tcp.declared_control_plane_address().unwrap_err().is_sentinel());

        let services: Objects<Service> = Objects::namespaced(harness.ctx.store.clone(), "default");
        let mut service = services.get_required("alpha").await.unwrap();
        service.spec.as_mut().unwrap().cluster_ip = Some("10.96.12.4".into());
        harness
            .store
            .seed(&ApiResource::erase::<Service>(&()), Some("default"), &service);

        let mut resource = ApiServerService::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::StatusOnly);
        apply_status(&resource, &mut tcp);
        let status = tcp.status_or_default();
        assert_eq!(status.control_plane_endpoint, "10.96.12.4:6443");
        assert_eq!(tcp.declared_control_plane_address().unwrap(), "10.96.12.4");
    }

    #[test]
    fn test_load_balancer_address() {
        let mut tcp = tenant("default", "alpha");
        tcp.spec.control_plane.service.service_type = ServiceType::LoadBalancer;
        let mut service = Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                cluster_ip: Some("10.96.0.20".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(service_address(&service), None);

        service.status = Some(K8sServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    hostname: Some("lb.example.com".into()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        assert_eq!(service_address(&service).as_deref(), Some("lb.example.com"));
    }
}
