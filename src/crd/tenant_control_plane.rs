//! TenantControlPlane CRD
//!
//! Describes one hosted Kubernetes control plane: its version, network
//! profile, datastore binding and add-ons. The status records, per concern,
//! which object currently holds the material and the checksum of that
//! material.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::DataStoreDriver;
use crate::error::{Error, Result};
use crate::utilities::checksum;

// =============================================================================
// TenantControlPlane CRD
// =============================================================================

/// TenantControlPlane is an isolated Kubernetes control plane running as a
/// workload in the management cluster.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hangar.io",
    version = "v1alpha1",
    kind = "TenantControlPlane",
    plural = "tenantcontrolplanes",
    shortname = "tcp",
    status = "TenantControlPlaneStatus",
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.kubernetes.version"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.kubernetesResources.version.status"}"#,
    printcolumn = r#"{"name": "Endpoint", "type": "string", "jsonPath": ".status.controlPlaneEndpoint"}"#,
    printcolumn = r#"{"name": "Datastore", "type": "string", "jsonPath": ".status.storage.dataStoreName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TenantControlPlaneSpec {
    /// Name of the DataStore backing this control plane.
    /// Falls back to the operator default when unset.
    #[serde(default)]
    pub data_store: Option<String>,

    /// Control plane workload settings
    #[serde(default)]
    pub control_plane: ControlPlaneSpec,

    /// Kubernetes settings
    #[serde(default)]
    pub kubernetes: KubernetesSpec,

    /// Network settings
    #[serde(default)]
    pub network_profile: NetworkProfileSpec,

    /// Optional cluster add-ons
    #[serde(default)]
    pub addons: AddonsSpec,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Control plane workload settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    #[serde(default)]
    pub deployment: DeploymentSpec,

    #[serde(default)]
    pub service: ServiceSpec,

    /// Expose the API server through an Ingress
    #[serde(default)]
    pub ingress: Option<IngressSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default)]
    pub service_type: ServiceType,
}

/// How the API server Service is exposed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::ClusterIP => write!(f, "ClusterIP"),
            ServiceType::NodePort => write!(f, "NodePort"),
            ServiceType::LoadBalancer => write!(f, "LoadBalancer"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Hostname routed to the API server
    pub hostname: String,

    #[serde(default)]
    pub ingress_class_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    /// Kubernetes version, e.g. v1.29.3
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub kubelet: KubeletSpec,
}

impl Default for KubernetesSpec {
    fn default() -> Self {
        Self {
            version: default_version(),
            kubelet: KubeletSpec::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeletSpec {
    #[serde(default = "default_cgroup_driver")]
    pub cgroup_driver: String,
}

impl Default for KubeletSpec {
    fn default() -> Self {
        Self {
            cgroup_driver: default_cgroup_driver(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfileSpec {
    /// Address advertised by the API server. Resolved from the Service when empty.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default = "default_port")]
    pub port: i32,

    /// Additional subject alternative names for the API server certificate
    #[serde(default)]
    pub cert_sans: Vec<String>,

    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,

    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,

    #[serde(default = "default_dns_service_ips")]
    pub dns_service_ips: Vec<String>,

    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,
}

impl Default for NetworkProfileSpec {
    fn default() -> Self {
        Self {
            address: None,
            port: default_port(),
            cert_sans: Vec::new(),
            service_cidr: default_service_cidr(),
            pod_cidr: default_pod_cidr(),
            dns_service_ips: default_dns_service_ips(),
            cluster_domain: default_cluster_domain(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonsSpec {
    #[serde(default, rename = "coreDNS")]
    pub core_dns: Option<AddonSpec>,

    #[serde(default)]
    pub kube_proxy: Option<AddonSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    /// Override the add-on image tag
    #[serde(default)]
    pub image_tag: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the TenantControlPlane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantControlPlaneStatus {
    #[serde(default)]
    pub certificates: CertificatesStatus,

    #[serde(default)]
    pub kubeconfig: KubeconfigsStatus,

    #[serde(default)]
    pub kubeadm_config: ConfigMapStatus,

    #[serde(default)]
    pub storage: StorageStatus,

    #[serde(default)]
    pub kubernetes_resources: KubernetesResourcesStatus,

    /// host:port clients use to reach the API server
    #[serde(default)]
    pub control_plane_endpoint: String,

    #[serde(default)]
    pub kubeadm_phase: KubeadmPhasesStatus,

    #[serde(default)]
    pub addons: AddonsStatus,
}

/// Handle to a secret holding generated material
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretStatus {
    #[serde(default)]
    pub secret_name: String,

    #[serde(default)]
    pub checksum: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update: Option<DateTime<Utc>>,
}

impl SecretStatus {
    pub fn record(&mut self, secret_name: &str, checksum: &str) {
        if self.secret_name != secret_name || self.checksum != checksum {
            self.last_update = Some(Utc::now());
        }
        self.secret_name = secret_name.to_string();
        self.checksum = checksum.to_string();
    }

    pub fn matches(&self, secret_name: &str, checksum: &str) -> bool {
        self.secret_name == secret_name && self.checksum == checksum
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapStatus {
    #[serde(default)]
    pub configmap_name: String,

    #[serde(default)]
    pub checksum: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update: Option<DateTime<Utc>>,
}

impl ConfigMapStatus {
    pub fn record(&mut self, configmap_name: &str, checksum: &str) {
        if self.configmap_name != configmap_name || self.checksum != checksum {
            self.last_update = Some(Utc::now());
        }
        self.configmap_name = configmap_name.to_string();
        self.checksum = checksum.to_string();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesStatus {
    #[serde(default)]
    pub ca: SecretStatus,
    #[serde(default)]
    pub api_server: SecretStatus,
    #[serde(default)]
    pub api_server_kubelet_client: SecretStatus,
    #[serde(default, rename = "frontProxyCA")]
    pub front_proxy_ca: SecretStatus,
    #[serde(default)]
    pub front_proxy_client: SecretStatus,
    #[serde(default)]
    pub sa: SecretStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigsStatus {
    #[serde(default)]
    pub admin: SecretStatus,
    #[serde(default)]
    pub controller_manager: SecretStatus,
    #[serde(default)]
    pub scheduler: SecretStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    #[serde(default)]
    pub driver: Option<DataStoreDriver>,

    /// DataStore the tenant is currently bound to
    #[serde(default)]
    pub data_store_name: String,

    #[serde(default)]
    pub config: SecretStatus,

    #[serde(default)]
    pub setup: StorageSetupStatus,

    #[serde(default)]
    pub certificate: SecretStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSetupStatus {
    #[serde(default)]
    pub schema: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub checksum: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesResourcesStatus {
    #[serde(default)]
    pub version: VersionStatus,

    #[serde(default)]
    pub service: ServiceStatus,

    #[serde(default)]
    pub deployment: DeploymentStatus,

    #[serde(default)]
    pub ingress: IngressStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionStatus {
    /// Version currently deployed
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub status: Option<VersionPhase>,
}

/// Lifecycle phase of the control plane version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VersionPhase {
    Provisioning,
    Upgrading,
    Migrating,
    Ready,
    NotReady,
}

impl std::fmt::Display for VersionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionPhase::Provisioning => write!(f, "Provisioning"),
            VersionPhase::Upgrading => write!(f, "Upgrading"),
            VersionPhase::Migrating => write!(f, "Migrating"),
            VersionPhase::Ready => write!(f, "Ready"),
            VersionPhase::NotReady => write!(f, "NotReady"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub port: i32,

    /// Address resolved from the Service (cluster IP or load balancer ingress)
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub ready: bool,

    /// Checksum of the material mounted by the pods
    #[serde(default)]
    pub checksum: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmPhasesStatus {
    #[serde(default)]
    pub upload_config_kubeadm: PhaseStatus,
    #[serde(default)]
    pub upload_config_kubelet: PhaseStatus,
    #[serde(default)]
    pub bootstrap_token: PhaseStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatus {
    #[serde(default)]
    pub checksum: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update: Option<DateTime<Utc>>,
}

impl PhaseStatus {
    pub fn record(&mut self, checksum: &str) {
        if self.checksum != checksum {
            self.checksum = checksum.to_string();
            self.last_update = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonsStatus {
    #[serde(default, rename = "coreDNS")]
    pub core_dns: AddonStatus,
    #[serde(default)]
    pub kube_proxy: AddonStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatus {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub checksum: String,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update: Option<DateTime<Utc>>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_replicas() -> i32 {
    2
}

fn default_version() -> String {
    "v1.29.3".to_string()
}

fn default_cgroup_driver() -> String {
    "systemd".to_string()
}

fn default_port() -> i32 {
    6443
}

fn default_service_cidr() -> String {
    "10.96.0.0/16".to_string()
}

fn default_pod_cidr() -> String {
    "10.244.0.0/16".to_string()
}

fn default_dns_service_ips() -> Vec<String> {
    vec!["10.96.0.10".to_string()]
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

// =============================================================================
// Implementations
// =============================================================================

impl TenantControlPlane {
    /// Namespace of the tenant; tenants are always namespaced
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// `namespace/name` key used in logs and datastore bookkeeping
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_any())
    }

    pub fn status_or_default(&self) -> TenantControlPlaneStatus {
        self.status.clone().unwrap_or_default()
    }

    /// DataStore requested by the spec, falling back to the operator default
    pub fn desired_datastore(&self, default: &str) -> String {
        self.spec
            .data_store
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    /// DataStore currently holding this tenant's data, if already bound
    pub fn bound_datastore(&self) -> Option<String> {
        self.status
            .as_ref()
            .map(|s| s.storage.data_store_name.clone())
            .filter(|name| !name.is_empty())
    }

    /// Name of the per-tenant database/role/key-prefix.
    ///
    /// A readable prefix from namespace and name followed by a digest of
    /// `namespace/name`, so tenants whose names only differ in separators
    /// never share storage. At most [`SCHEMA_MAX_LEN`] characters.
    pub fn datastore_schema(&self) -> String {
        let (namespace, name) = (self.namespace_or_default(), self.name_any());
        let digest = checksum([("tenant", format!("{namespace}/{name}").as_bytes())]);

        let mut prefix = sanitize_identifier(&format!("{namespace}_{name}"));
        prefix.truncate(SCHEMA_MAX_LEN - SCHEMA_DIGEST_LEN - 1);
        let prefix = prefix.trim_end_matches('_');
        format!("{prefix}_{}", &digest[..SCHEMA_DIGEST_LEN])
    }

    /// Address the API server advertises.
    ///
    /// The declared address wins; otherwise the address resolved by the
    /// Service resource is used. Load balancers without an ingress yet and
    /// services without an IP are reported as sentinel errors.
    pub fn declared_control_plane_address(&self) -> Result<String> {
        if let Some(address) = self.spec.network_profile.address.as_ref() {
            if !address.is_empty() {
                return Ok(address.clone());
            }
        }

        let service = self
            .status
            .as_ref()
            .map(|s| s.kubernetes_resources.service.clone())
            .unwrap_or_default();

        match service.address {
            Some(address) if !address.is_empty() => Ok(address),
            _ if self.spec.control_plane.service.service_type == ServiceType::LoadBalancer => {
                Err(Error::LoadBalancerNotReady {
                    service: self.name_any(),
                })
            }
            _ => Err(Error::AddressNotAssigned { tenant: self.key() }),
        }
    }

    /// Parsed `major.minor.patch` of the desired version
    pub fn desired_version(&self) -> Result<(u64, u64, u64)> {
        parse_version(&self.spec.kubernetes.version)
    }

    pub fn version_phase(&self) -> Option<VersionPhase> {
        self.status
            .as_ref()
            .and_then(|s| s.kubernetes_resources.version.status)
    }
}

/// MySQL caps user names at 32 characters
pub const SCHEMA_MAX_LEN: usize = 32;
const SCHEMA_DIGEST_LEN: usize = 8;

/// Lowercase and replace everything outside `[a-z0-9_]` with `_`
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Parse `v1.29.3` (leading `v` optional) into its numeric parts
pub fn parse_version(raw: &str) -> Result<(u64, u64, u64)> {
    let trimmed = raw.trim().trim_start_matches('v');
    let core = trimmed.split(['-', '+']).next().unwrap_or_default();
    let mut parts = core.split('.');

    let mut next = |label: &str| -> Result<u64> {
        parts
            .next()
            .ok_or_else(|| Error::InvalidSpec(format!("version {raw:?} is missing the {label} part")))?
            .parse::<u64>()
            .map_err(|e| Error::InvalidSpec(format!("version {raw:?}: invalid {label}: {e}")))
    };

    let major = next("major")?;
    let minor = next("minor")?;
    let patch = next("patch")?;
    Ok((major, minor, patch))
}
