//! DataStore CRD
//!
//! A DataStore is a shared storage backend (etcd, MySQL or PostgreSQL)
//! that hosts the state of many tenant control planes. Credentials are
//! either inlined or referenced from secrets.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// DataStore CRD
// =============================================================================

/// DataStore describes how to reach a storage backend shared by tenants.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hangar.io",
    version = "v1alpha1",
    kind = "DataStore",
    plural = "datastores",
    shortname = "ds",
    status = "DataStoreStatus",
    printcolumn = r#"{"name": "Driver", "type": "string", "jsonPath": ".spec.driver"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreSpec {
    /// Storage driver
    pub driver: DataStoreDriver,

    /// host:port endpoints of the backend
    pub endpoints: Vec<String>,

    /// Administrative credentials (SQL drivers)
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,

    /// TLS material used to reach the backend
    #[serde(default)]
    pub tls_config: Option<TlsConfig>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Supported storage drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DataStoreDriver {
    #[serde(rename = "etcd")]
    Etcd,
    MySQL,
    PostgreSQL,
}

impl std::fmt::Display for DataStoreDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataStoreDriver::Etcd => write!(f, "etcd"),
            DataStoreDriver::MySQL => write!(f, "MySQL"),
            DataStoreDriver::PostgreSQL => write!(f, "PostgreSQL"),
        }
    }
}

impl DataStoreDriver {
    /// Whether tenant API servers talk to this backend through kine
    pub fn uses_kine(&self) -> bool {
        !matches!(self, DataStoreDriver::Etcd)
    }

    /// URL scheme used in connection strings
    pub fn scheme(&self) -> &'static str {
        match self {
            DataStoreDriver::Etcd => "etcd",
            DataStoreDriver::MySQL => "mysql",
            DataStoreDriver::PostgreSQL => "postgres",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    pub username: ContentRef,
    pub password: ContentRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// CA of the backend. The private key is required for etcd, where the
    /// operator signs per-tenant client certificates.
    pub certificate_authority: CertKeyRef,

    /// Client certificate the operator uses for administrative calls
    #[serde(default)]
    pub client_certificate: Option<CertKeyRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertKeyRef {
    pub certificate: ContentRef,

    #[serde(default)]
    pub private_key: Option<ContentRef>,
}

/// Either inline content or a reference to a key of a secret
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    /// Inline content
    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub secret_reference: Option<SecretKeyRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub namespace: String,
    pub key_path: String,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreStatus {
    /// `namespace/name` of tenants bound to this DataStore
    #[serde(default)]
    pub used_by: Vec<String>,

    /// Generation whose bound tenants were last re-queued
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Whether the last health check reached the backend
    #[serde(default)]
    pub ready: bool,

    /// Reason of the last failed health check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
