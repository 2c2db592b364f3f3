//! Custom Resource Definitions for Hangar
//!
//! This module contains all CRD types:
//! - TenantControlPlane: a hosted Kubernetes control plane
//! - DataStore: a storage backend shared by tenant control planes

pub mod datastore;
pub mod tenant_control_plane;

pub use datastore::*;
pub use tenant_control_plane::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;

/// Finalizer guarding tenant teardown
pub const FINALIZER: &str = "hangar.io/finalizer";

/// Annotation carrying the checksum of generated content
pub const CHECKSUM_ANNOTATION: &str = "hangar.io/checksum";

/// Label marking secrets observed by the certificate lifecycle controller.
/// Values are [`LIFECYCLE_X509`] or [`LIFECYCLE_KUBECONFIG`].
pub const CERTIFICATE_LIFECYCLE_LABEL: &str = "hangar.io/certificate-lifecycle";
pub const LIFECYCLE_X509: &str = "x509";
pub const LIFECYCLE_KUBECONFIG: &str = "kubeconfig";

/// Label set on every object owned by a tenant
pub const TENANT_LABEL: &str = "hangar.io/tenant";

/// Per-tenant override of the migration job timeout, e.g. `10m`
pub const MIGRATION_TIMEOUT_ANNOTATION: &str = "hangar.io/migration-timeout";

/// DataStores a migration job copies between, stamped on the job
pub const MIGRATION_SOURCE_ANNOTATION: &str = "hangar.io/migration-source";
pub const MIGRATION_TARGET_ANNOTATION: &str = "hangar.io/migration-target";
