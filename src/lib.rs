//! Hangar - Hosted Kubernetes Control Planes
//!
//! A Kubernetes operator running the control planes of tenant clusters as
//! ordinary workloads of a management cluster. Each tenant gets its own
//! API server, controller manager and scheduler, backed by a shared
//! DataStore (etcd, MySQL or PostgreSQL) in which it is isolated by schema
//! and credentials.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         Management Cluster                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐  triggers  ┌───────────────────────────────┐   │
//! │  │ Certificate          │──────────► │ TenantControlPlane controller │   │
//! │  │ Lifecycle controller │            │                               │   │
//! │  └──────────────────────┘            │  migrate → service → PKI →    │   │
//! │  ┌──────────────────────┐  triggers  │  kubeconfigs → datastore →    │   │
//! │  │ DataStore controller │──────────► │  deployment → ingress →       │   │
//! │  └──────────────────────┘            │  kubeadm phases → add-ons     │   │
//! │                                      └───────────────┬───────────────┘   │
//! ├──────────────────────────────────────────────────────┼───────────────────┤
//! │          Shared DataStores                           │ Tenant clusters   │
//! │  ┌────────┐  ┌────────┐  ┌────────────┐              ▼                   │
//! │  │  etcd  │  │ MySQL  │  │ PostgreSQL │      kubeadm config, RBAC,       │
//! │  └────────┘  └────────┘  └────────────┘      CoreDNS, kube-proxy         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controllers`]: the three controllers and the resource pipeline
//! - [`resources`]: one convergent resource per piece of a control plane
//! - [`datastore`]: storage drivers and the migration orchestrator
//! - [`pki`]: certificate and kubeconfig generation and validation
//! - [`store`]: typed and dynamic access to Kubernetes objects
//! - [`crd`]: Custom Resource Definitions
//! - [`error`]: Error types and handling

pub mod config;
pub mod controllers;
pub mod crd;
pub mod datastore;
pub mod error;
pub mod metrics;
pub mod pki;
pub mod resources;
pub mod store;
pub mod utilities;

// Re-export commonly used types
pub use config::OperatorConfig;

pub use controllers::{trigger_channel, Context, Trigger, TriggerSender};

pub use crd::{
    DataStore, DataStoreDriver, DataStoreSpec, DataStoreStatus, TenantControlPlane, TenantControlPlaneSpec,
    TenantControlPlaneStatus,
};

pub use datastore::{Connection, ConnectionFactory, DriverFactory};

pub use error::{Error, ErrorAction, ErrorKind, Result};

pub use metrics::Metrics;

pub use store::{KubeStore, KubeconfigClients, ObjectStore, ObjectStoreRef, Objects, TenantClients};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
