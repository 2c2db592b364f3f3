//! Cluster add-ons installed into the tenant cluster
//!
//! CoreDNS and kube-proxy, each optional. An enabled add-on is applied once
//! the control plane is ready and re-applied only when its rendered objects
//! change; disabling it removes every object it created.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HostPathVolumeSource,
    KeyToPath, ObjectFieldSelector, PodSpec, PodTemplateSpec, SecurityContext, Service, ServiceAccount,
    ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::manifest::Manifest;
use super::Resource;
use crate::controllers::Context;
use crate::crd::{AddonSpec, AddonStatus, TenantControlPlane, TenantControlPlaneStatus};
use crate::error::{Error, Result};
use crate::utilities::OperationResult;

const KUBE_SYSTEM: &str = "kube-system";
const COREDNS_VERSION: &str = "v1.11.1";
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonKind {
    CoreDns,
    KubeProxy,
}

impl AddonKind {
    pub fn resource_name(&self) -> &'static str {
        match self {
            AddonKind::CoreDns => "addon-coredns",
            AddonKind::KubeProxy => "addon-kube-proxy",
        }
    }

    fn spec<'a>(&self, tenant: &'a TenantControlPlane) -> Option<&'a AddonSpec> {
        match self {
            AddonKind::CoreDns => tenant.spec.addons.core_dns.as_ref(),
            AddonKind::KubeProxy => tenant.spec.addons.kube_proxy.as_ref(),
        }
    }

    fn status<'a>(&self, status: &'a TenantControlPlaneStatus) -> &'a AddonStatus {
        match self {
            AddonKind::CoreDns => &status.addons.core_dns,
            AddonKind::KubeProxy => &status.addons.kube_proxy,
        }
    }

    fn status_mut<'a>(&self, status: &'a mut TenantControlPlaneStatus) -> &'a mut AddonStatus {
        match self {
            AddonKind::CoreDns => &mut status.addons.core_dns,
            AddonKind::KubeProxy => &mut status.addons.kube_proxy,
        }
    }
}

// =============================================================================
// Rendering
// =============================================================================

fn meta(name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(KUBE_SYSTEM.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("k8s-app".to_string(), app.to_string())])
}

fn service_account_subject(name: &str) -> Subject {
    Subject {
        api_group: None,
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(KUBE_SYSTEM.to_string()),
    }
}

fn cluster_role_ref(name: &str) -> RoleRef {
    RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "ClusterRole".to_string(),
        name: name.to_string(),
    }
}

fn port(name: &str, number: i32, protocol: &str) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: number,
        protocol: Some(protocol.to_string()),
        ..Default::default()
    }
}

fn corefile(cluster_domain: &str) -> String {
    format!(
        ".:53 {{\n    errors\n    health {{\n        lameduck 5s\n    }}\n    ready\n    \
         kubernetes {cluster_domain} in-addr.arpa ip6.arpa {{\n        pods insecure\n        \
         fallthrough in-addr.arpa ip6.arpa\n        ttl 30\n    }}\n    prometheus :9153\n    \
         forward . /etc/resolv.conf\n    cache 30\n    loop\n    reload\n    loadbalance\n}}\n"
    )
}

/// CoreDNS objects
pub fn coredns(tenant: &TenantControlPlane, image_registry: &str, spec: &AddonSpec) -> Result<Manifest> {
    let network = &tenant.spec.network_profile;
    let labels = app_labels("kube-dns");
    let tag = spec.image_tag.clone().unwrap_or_else(|| COREDNS_VERSION.to_string());
    let cluster_ip = network
        .dns_service_ips
        .first()
        .cloned()
        .ok_or_else(|| Error::InvalidSpec("networkProfile.dnsServiceIPs is empty".into()))?;

    let mut manifest = Manifest::new();
    manifest.push(&ServiceAccount {
        metadata: meta("coredns", &labels),
        ..Default::default()
    })?;
    manifest.push(&ClusterRole {
        metadata: ObjectMeta {
            name: Some("system:coredns".to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec![
                    "endpoints".to_string(),
                    "services".to_string(),
                    "pods".to_string(),
                    "namespaces".to_string(),
                ]),
                verbs: vec!["list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["discovery.k8s.io".to_string()]),
                resources: Some(vec!["endpointslices".to_string()]),
                verbs: vec!["list".to_string(), "watch".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    })?;
    manifest.push(&ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some("system:coredns".to_string()),
            ..Default::default()
        },
        role_ref: cluster_role_ref("system:coredns"),
        subjects: Some(vec![service_account_subject("coredns")]),
    })?;
    manifest.push(&ConfigMap {
        metadata: meta("coredns", &labels),
        data: Some(BTreeMap::from([(
            "Corefile".to_string(),
            corefile(&network.cluster_domain),
        )])),
        ..Default::default()
    })?;
    manifest.push(&Deployment {
        metadata: meta("coredns", &labels),
        spec: Some(DeploymentSpec {
            replicas: Some(2),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some("coredns".to_string()),
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    dns_policy: Some("Default".to_string()),
                    tolerations: Some(vec![Toleration {
                        key: Some("CriticalAddonsOnly".to_string()),
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: "coredns".to_string(),
                        image: Some(format!("{image_registry}/coredns/coredns:{tag}")),
                        args: Some(vec!["-conf".to_string(), "/etc/coredns/Corefile".to_string()]),
                        ports: Some(vec![
                            port("dns", 53, "UDP"),
                            port("dns-tcp", 53, "TCP"),
                            port("metrics", 9153, "TCP"),
                        ]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "config-volume".to_string(),
                            mount_path: "/etc/coredns".to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "config-volume".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some("coredns".to_string()),
                            items: Some(vec![KeyToPath {
                                key: "Corefile".to_string(),
                                path: "Corefile".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })?;

    let service_port = |name: &str, number: i32, protocol: &str| ServicePort {
        name: Some(name.to_string()),
        port: number,
        protocol: Some(protocol.to_string()),
        target_port: Some(IntOrString::Int(number)),
        ..Default::default()
    };
    manifest.push(&Service {
        metadata: meta("kube-dns", &labels),
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip),
            selector: Some(labels.clone()),
            ports: Some(vec![
                service_port("dns", 53, "UDP"),
                service_port("dns-tcp", 53, "TCP"),
                service_port("metrics", 9153, "TCP"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    })?;
    Ok(manifest)
}

/// kube-proxy objects
pub fn kube_proxy(tenant: &TenantControlPlane, address: &str, image_registry: &str, spec: &AddonSpec) -> Result<Manifest> {
    let network = &tenant.spec.network_profile;
    let labels = app_labels("kube-proxy");
    let tag = spec
        .image_tag
        .clone()
        .unwrap_or_else(|| tenant.spec.kubernetes.version.clone());

    let configuration = json!({
        "apiVersion": "kubeproxy.config.k8s.io/v1alpha1",
        "kind": "KubeProxyConfiguration",
        "bindAddress": "0.0.0.0",
        "clusterCIDR": network.pod_cidr,
        "mode": "iptables",
        "clientConnection": {
            "kubeconfig": "/var/lib/kube-proxy/kubeconfig.conf",
        },
    });
    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "default",
            "cluster": {
                "certificate-authority": format!("{SERVICE_ACCOUNT_DIR}/ca.crt"),
                "server": format!("https://{}:{}", address, network.port),
            },
        }],
        "contexts": [{
            "name": "default",
            "context": { "cluster": "default", "namespace": "default", "user": "default" },
        }],
        "current-context": "default",
        "users": [{
            "name": "default",
            "user": { "tokenFile": format!("{SERVICE_ACCOUNT_DIR}/token") },
        }],
    });

    let mut manifest = Manifest::new();
    manifest.push(&ServiceAccount {
        metadata: meta("kube-proxy", &labels),
        ..Default::default()
    })?;
    manifest.push(&ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some("kubeadm:node-proxier".to_string()),
            ..Default::default()
        },
        role_ref: cluster_role_ref("system:node-proxier"),
        subjects: Some(vec![service_account_subject("kube-proxy")]),
    })?;
    manifest.push(&ConfigMap {
        metadata: meta("kube-proxy", &labels),
        data: Some(BTreeMap::from([
            ("config.conf".to_string(), serde_yaml::to_string(&configuration)?),
            ("kubeconfig.conf".to_string(), serde_yaml::to_string(&kubeconfig)?),
        ])),
        ..Default::default()
    })?;

    let host_path = |name: &str, path: &str, kind: &str| Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(kind.to_string()),
        }),
        ..Default::default()
    };
    let volume_mount = |name: &str, path: &str, read_only: bool| VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    };
    manifest.push(&DaemonSet {
        metadata: meta("kube-proxy", &labels),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some("kube-proxy".to_string()),
                    priority_class_name: Some("system-node-critical".to_string()),
                    host_network: Some(true),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: "kube-proxy".to_string(),
                        image: Some(format!("{image_registry}/kube-proxy:{tag}")),
                        command: Some(vec![
                            "/usr/local/bin/kube-proxy".to_string(),
                            "--config=/var/lib/kube-proxy/config.conf".to_string(),
                            "--hostname-override=$(NODE_NAME)".to_string(),
                        ]),
                        env: Some(vec![EnvVar {
                            name: "NODE_NAME".to_string(),
                            value_from: Some(EnvVarSource {
                                field_ref: Some(ObjectFieldSelector {
                                    field_path: "spec.nodeName".to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![
                            volume_mount("kube-proxy", "/var/lib/kube-proxy", true),
                            volume_mount("xtables-lock", "/run/xtables.lock", false),
                            volume_mount("lib-modules", "/lib/modules", true),
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "kube-proxy".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some("kube-proxy".to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        host_path("xtables-lock", "/run/xtables.lock", "FileOrCreate"),
                        host_path("lib-modules", "/lib/modules", "Directory"),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })?;
    Ok(manifest)
}

// =============================================================================
// Resource
// =============================================================================

pub struct Addon {
    kind: AddonKind,
    ctx: Arc<Context>,
    desired: Option<AddonSpec>,
    manifest: Manifest,
    checksum: String,
}

impl Addon {
    pub fn new(kind: AddonKind, ctx: Arc<Context>) -> Self {
        Self {
            kind,
            ctx,
            desired: None,
            manifest: Manifest::new(),
            checksum: String::new(),
        }
    }

    fn render(&self, tenant: &TenantControlPlane, spec: &AddonSpec) -> Result<Manifest> {
        let registry = &self.ctx.config.image_registry;
        match self.kind {
            AddonKind::CoreDns => coredns(tenant, registry, spec),
            AddonKind::KubeProxy => {
                let address = tenant.declared_control_plane_address()?;
                kube_proxy(tenant, &address, registry, spec)
            }
        }
    }
}

#[async_trait]
impl Resource for Addon {
    fn name(&self) -> &'static str {
        self.kind.resource_name()
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.desired = self.kind.spec(tenant).cloned();
        let Some(spec) = self.desired.clone() else {
            return Ok(());
        };
        if !tenant.status_or_default().kubernetes_resources.deployment.ready {
            return Err(Error::ControlPlaneNotReady { tenant: tenant.key() });
        }
        self.manifest = self.render(tenant, &spec)?;
        self.checksum = self.manifest.checksum()?;
        Ok(())
    }

    fn should_cleanup(&self, _tenant: &TenantControlPlane) -> bool {
        self.desired.is_none()
    }

    async fn clean_up(&mut self, tenant: &TenantControlPlane) -> Result<bool> {
        let recorded = self.kind.status(&tenant.status_or_default()).clone();
        if !recorded.enabled {
            return Ok(recorded != AddonStatus::default());
        }
        // Object names do not depend on the add-on settings
        let manifest = self.render(tenant, &AddonSpec::default())?;
        let store = self.ctx.tenant_clients.store(tenant).await?;
        manifest.delete(&store).await?;
        info!(tenant = %tenant.key(), addon = self.name(), "add-on removed");
        Ok(true)
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let recorded = self.kind.status(&tenant.status_or_default()).clone();
        if recorded.enabled && recorded.checksum == self.checksum {
            return Ok(OperationResult::None);
        }
        let store = self.ctx.tenant_clients.store(tenant).await?;
        if !self.manifest.apply(&store).await? {
            return Ok(OperationResult::None);
        }
        info!(tenant = %tenant.key(), addon = self.name(), objects = self.manifest.len(), "add-on applied");
        Ok(if recorded.enabled {
            OperationResult::Updated
        } else {
            OperationResult::Created
        })
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let recorded = self.kind.status(&tenant.status_or_default()).clone();
        match self.desired {
            Some(_) => !recorded.enabled || recorded.checksum != self.checksum,
            None => recorded != AddonStatus::default(),
        }
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        let recorded = self.kind.status_mut(status);
        match self.desired {
            Some(_) => {
                if !recorded.enabled || recorded.checksum != self.checksum {
                    recorded.last_update = Some(Utc::now());
                }
                recorded.enabled = true;
                recorded.checksum = self.checksum.clone();
            }
            None => *recorded = AddonStatus::default(),
        }
    }
}
