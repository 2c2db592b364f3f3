//! Control plane workload
//!
//! One Deployment per tenant running kube-apiserver, kube-controller-manager
//! and kube-scheduler side by side. SQL datastores get a kine sidecar that
//! speaks the etcd protocol to the API server.
//!
//! Certificates and kubeconfigs are mounted from the secrets recorded in the
//! tenant status. The checksum of all that material is stamped on the pod
//! template so any rotation rolls the pods.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, ProjectedVolumeSource,
    SecretKeySelector, SecretProjection, SecretVolumeSource, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::datastore_config::CONNECTION_STRING_KEY;
use super::service::pod_selector;
use super::{adopt, Resource};
use crate::controllers::Context;
use crate::crd::{
    DataStoreDriver, SecretStatus, TenantControlPlane, TenantControlPlaneStatus, VersionPhase, CHECKSUM_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::store::Objects;
use crate::utilities::{checksum, create_or_update, OperationResult};

const PKI_DIR: &str = "/etc/kubernetes/pki";
const KUBECONFIG_DIR: &str = "/etc/kubernetes/kubeconfig";
const DATASTORE_PKI_DIR: &str = "/etc/kubernetes/pki/datastore";
const KINE_LISTEN: &str = "127.0.0.1:2379";

/// Whether a Deployment has rolled out all its replicas
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let observed = status.observed_generation.unwrap_or_default() >= deployment.metadata.generation.unwrap_or_default();
    observed
        && desired > 0
        && status.updated_replicas.unwrap_or_default() >= desired
        && status.ready_replicas.unwrap_or_default() >= desired
}

/// Material the pods consume, resolved from the tenant status
#[derive(Debug, Clone, Default)]
struct Material {
    pki: Vec<String>,
    kubeconfigs: Vec<String>,
    datastore_config: String,
    datastore_certificate: Option<String>,
    driver: Option<DataStoreDriver>,
    checksum: String,
}

impl Material {
    fn resolve(status: &TenantControlPlaneStatus) -> Result<Self> {
        let certificates = &status.certificates;
        let required = [
            ("ca", &certificates.ca),
            ("front-proxy-ca", &certificates.front_proxy_ca),
            ("sa", &certificates.sa),
            ("apiserver", &certificates.api_server),
            ("apiserver-kubelet-client", &certificates.api_server_kubelet_client),
            ("front-proxy-client", &certificates.front_proxy_client),
            ("controller-manager.conf", &status.kubeconfig.controller_manager),
            ("scheduler.conf", &status.kubeconfig.scheduler),
            ("datastore-config", &status.storage.config),
        ];
        for (name, secret) in &required {
            if secret.secret_name.is_empty() {
                return Err(Error::missing("deployment", format!("{name} secret not generated yet")));
            }
        }

        let storage = &status.storage;
        if storage.setup.checksum.is_empty() || storage.setup.checksum != storage.config.checksum {
            return Err(Error::missing("deployment", "datastore setup pending"));
        }

        let certificate = Some(&storage.certificate).filter(|s| !s.secret_name.is_empty());
        let stamps: Vec<(&str, &[u8])> = required
            .iter()
            .map(|(name, s)| (*name, s.checksum.as_bytes()))
            .chain(certificate.map(|s| ("datastore-certificate", s.checksum.as_bytes())))
            .collect();

        let names = |statuses: &[&SecretStatus]| -> Vec<String> {
            statuses.iter().map(|s| s.secret_name.clone()).collect()
        };
        Ok(Self {
            pki: names(&[
                &certificates.ca,
                &certificates.front_proxy_ca,
                &certificates.sa,
                &certificates.api_server,
                &certificates.api_server_kubelet_client,
                &certificates.front_proxy_client,
            ]),
            kubeconfigs: names(&[&status.kubeconfig.controller_manager, &status.kubeconfig.scheduler]),
            datastore_config: storage.config.secret_name.clone(),
            datastore_certificate: certificate.map(|s| s.secret_name.clone()),
            driver: storage.driver,
            checksum: checksum(stamps),
        })
    }
}

fn projected(name: &str, secrets: &[String]) -> Volume {
    Volume {
        name: name.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(
                secrets
                    .iter()
                    .map(|secret| VolumeProjection {
                        secret: Some(SecretProjection {
                            name: Some(secret.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pki(file: &str) -> String {
    format!("{PKI_DIR}/{file}")
}

pub struct ControlPlaneDeployment {
    ctx: Arc<Context>,
    name: String,
    address: String,
    material: Material,
    version: String,
    ready: bool,
}

impl ControlPlaneDeployment {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            name: String::new(),
            address: String::new(),
            material: Material::default(),
            version: String::new(),
            ready: false,
        }
    }

    fn image(&self, component: &str) -> String {
        format!("{}/{}:{}", self.ctx.config.image_registry, component, self.version)
    }

    fn api_server(&self, tenant: &TenantControlPlane) -> Container {
        let network = &tenant.spec.network_profile;
        let mut args = vec![
            "kube-apiserver".to_string(),
            format!("--advertise-address={}", self.address),
            format!("--secure-port={}", network.port),
            format!("--service-cluster-ip-range={}", network.service_cidr),
            "--allow-privileged=true".to_string(),
            "--authorization-mode=Node,RBAC".to_string(),
            "--enable-bootstrap-token-auth=true".to_string(),
            format!("--client-ca-file={}", pki("ca.crt")),
            format!("--tls-cert-file={}", pki("apiserver.crt")),
            format!("--tls-private-key-file={}", pki("apiserver.key")),
            format!("--kubelet-client-certificate={}", pki("apiserver-kubelet-client.crt")),
            format!("--kubelet-client-key={}", pki("apiserver-kubelet-client.key")),
            format!("--proxy-client-cert-file={}", pki("front-proxy-client.crt")),
            format!("--proxy-client-key-file={}", pki("front-proxy-client.key")),
            format!("--requestheader-client-ca-file={}", pki("front-proxy-ca.crt")),
            "--requestheader-allowed-names=front-proxy-client".to_string(),
            "--requestheader-username-headers=X-Remote-User".to_string(),
            "--requestheader-group-headers=X-Remote-Group".to_string(),
            "--requestheader-extra-headers-prefix=X-Remote-Extra-".to_string(),
            format!("--service-account-key-file={}", pki("sa.pub")),
            format!("--service-account-signing-key-file={}", pki("sa.key")),
            format!(
                "--service-account-issuer=https://kubernetes.default.svc.{}",
                network.cluster_domain
            ),
        ];

        let mut env = Vec::new();
        match self.material.driver {
            Some(DataStoreDriver::Etcd) => {
                env.push(secret_env(
                    "ETCD_SERVERS",
                    &self.material.datastore_config,
                    CONNECTION_STRING_KEY,
                ));
                args.push("--etcd-servers=$(ETCD_SERVERS)".to_string());
                args.push(format!("--etcd-prefix=/{}", tenant.datastore_schema()));
                if self.material.datastore_certificate.is_some() {
                    args.push(format!("--etcd-cafile={DATASTORE_PKI_DIR}/ca.crt"));
                    args.push(format!("--etcd-certfile={DATASTORE_PKI_DIR}/server.crt"));
                    args.push(format!("--etcd-keyfile={DATASTORE_PKI_DIR}/server.key"));
                }
            }
            _ => args.push(format!("--etcd-servers=http://{KINE_LISTEN}")),
        }

        let mut volume_mounts = vec![mount("pki", PKI_DIR)];
        if self.material.datastore_certificate.is_some() {
            volume_mounts.push(mount("datastore-certificate", DATASTORE_PKI_DIR));
        }

        Container {
            name: "kube-apiserver".to_string(),
            image: Some(self.image("kube-apiserver")),
            command: Some(args),
            env: Some(env),
            ports: Some(vec![ContainerPort {
                name: Some("https".to_string()),
                container_port: network.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }
    }

    fn controller_manager(&self, tenant: &TenantControlPlane) -> Container {
        let network = &tenant.spec.network_profile;
        let kubeconfig = format!("{KUBECONFIG_DIR}/controller-manager.conf");
        Container {
            name: "kube-controller-manager".to_string(),
            image: Some(self.image("kube-controller-manager")),
            command: Some(vec![
                "kube-controller-manager".to_string(),
                format!("--kubeconfig={kubeconfig}"),
                format!("--authentication-kubeconfig={kubeconfig}"),
                format!("--authorization-kubeconfig={kubeconfig}"),
                format!("--cluster-signing-cert-file={}", pki("ca.crt")),
                format!("--cluster-signing-key-file={}", pki("ca.key")),
                format!("--root-ca-file={}", pki("ca.crt")),
                format!("--requestheader-client-ca-file={}", pki("front-proxy-ca.crt")),
                format!("--service-account-private-key-file={}", pki("sa.key")),
                format!("--cluster-cidr={}", network.pod_cidr),
                format!("--service-cluster-ip-range={}", network.service_cidr),
                "--controllers=*,bootstrapsigner,tokencleaner".to_string(),
                "--use-service-account-credentials=true".to_string(),
                "--leader-elect=true".to_string(),
            ]),
            volume_mounts: Some(vec![mount("pki", PKI_DIR), mount("kubeconfig", KUBECONFIG_DIR)]),
            ..Default::default()
        }
    }

    fn scheduler(&self) -> Container {
        let kubeconfig = format!("{KUBECONFIG_DIR}/scheduler.conf");
        Container {
            name: "kube-scheduler".to_string(),
            image: Some(self.image("kube-scheduler")),
            command: Some(vec![
                "kube-scheduler".to_string(),
                format!("--kubeconfig={kubeconfig}"),
                format!("--authentication-kubeconfig={kubeconfig}"),
                format!("--authorization-kubeconfig={kubeconfig}"),
                "--leader-elect=true".to_string(),
            ]),
            volume_mounts: Some(vec![mount("kubeconfig", KUBECONFIG_DIR)]),
            ..Default::default()
        }
    }

    fn kine(&self) -> Container {
        let mut args = vec![
            "--endpoint=$(DB_CONNECTION_STRING)".to_string(),
            format!("--listen-address={KINE_LISTEN}"),
        ];
        let mut volume_mounts = Vec::new();
        if self.material.datastore_certificate.is_some() {
            args.push(format!("--ca-file={DATASTORE_PKI_DIR}/ca.crt"));
            args.push(format!("--cert-file={DATASTORE_PKI_DIR}/server.crt"));
            args.push(format!("--key-file={DATASTORE_PKI_DIR}/server.key"));
            volume_mounts.push(mount("datastore-certificate", DATASTORE_PKI_DIR));
        }
        Container {
            name: "kine".to_string(),
            image: Some(self.ctx.config.kine_image.clone()),
            args: Some(args),
            env: Some(vec![secret_env(
                "DB_CONNECTION_STRING",
                &self.material.datastore_config,
                CONNECTION_STRING_KEY,
            )]),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }
    }

    fn pod_spec(&self, tenant: &TenantControlPlane) -> PodSpec {
        let mut containers = vec![self.api_server(tenant), self.controller_manager(tenant), self.scheduler()];
        let mut volumes = vec![
            projected("pki", &self.material.pki),
            projected("kubeconfig", &self.material.kubeconfigs),
        ];
        if matches!(
            self.material.driver,
            Some(DataStoreDriver::MySQL) | Some(DataStoreDriver::PostgreSQL)
        ) {
            containers.push(self.kine());
        }
        if let Some(secret) = self.material.datastore_certificate.as_ref() {
            volumes.push(Volume {
                name: "datastore-certificate".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        PodSpec {
            containers,
            volumes: Some(volumes),
            automount_service_account_token: Some(false),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Resource for ControlPlaneDeployment {
    fn name(&self) -> &'static str {
        "deployment"
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.name = tenant.name_any();
        self.address = tenant.declared_control_plane_address()?;
        self.version = tenant.spec.kubernetes.version.clone();
        self.material = Material::resolve(&tenant.status_or_default())?;
        Ok(())
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let deployments: Objects<Deployment> =
            Objects::namespaced(self.ctx.store.clone(), &tenant.namespace_or_default());
        let selector = pod_selector(tenant);
        let template_annotations = BTreeMap::from([(CHECKSUM_ANNOTATION.to_string(), self.material.checksum.clone())]);
        let pod_spec = self.pod_spec(tenant);
        let replicas = tenant.spec.control_plane.deployment.replicas;

        let (result, deployment) = create_or_update(&deployments, &self.name, |deployment| {
            adopt(&mut deployment.metadata, tenant);
            deployment.spec = Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector.clone()),
                        annotations: Some(template_annotations.clone()),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec.clone()),
                },
                ..Default::default()
            });
            Ok(())
        })
        .await?;

        if result != OperationResult::None {
            info!(tenant = %tenant.key(), version = %self.version, %result, "control plane deployment applied");
        }
        self.ready = result == OperationResult::None && deployment_ready(&deployment);
        Ok(result)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let status = tenant.status_or_default();
        let recorded = &status.kubernetes_resources.deployment;
        let version = &status.kubernetes_resources.version;
        if recorded.name != self.name || recorded.ready != self.ready || recorded.checksum != self.material.checksum {
            return true;
        }
        if self.ready {
            version.version != self.version || version.status != Some(VersionPhase::Ready)
        } else {
            version.status == Some(VersionPhase::Ready)
        }
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        let resources = &mut status.kubernetes_resources;
        let recorded = &mut resources.deployment;
        if recorded.name != self.name || recorded.ready != self.ready || recorded.checksum != self.material.checksum {
            recorded.last_update = Some(Utc::now());
        }
        recorded.name = self.name.clone();
        recorded.ready = self.ready;
        recorded.checksum = self.material.checksum.clone();

        if self.ready {
            resources.version.version = self.version.clone();
            resources.version.status = Some(VersionPhase::Ready);
        } else if resources.version.status == Some(VersionPhase::Ready) {
            resources.version.status = Some(VersionPhase::NotReady);
        }
    }
}
