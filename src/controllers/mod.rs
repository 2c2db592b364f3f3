//! Controllers
//!
//! - [`tenant`]: walks the resource pipeline of every TenantControlPlane
//! - [`certificate_lifecycle`]: watches generated certificates and asks the
//!   tenant controller to rotate them before they expire
//! - [`datastore`]: keeps DataStore bookkeeping current and re-queues the
//!   tenants bound to a DataStore when it changes
//!
//! The two auxiliary controllers talk to the tenant controller through a
//! bounded channel of [`Trigger`]s.

pub mod certificate_lifecycle;
pub mod datastore;
pub mod pipeline;
pub mod tenant;

use kube::runtime::reflector::ObjectRef;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::OperatorConfig;
use crate::crd::TenantControlPlane;
use crate::datastore::ConnectionFactory;
use crate::metrics::Metrics;
use crate::store::{ObjectStoreRef, TenantClients};

/// Request to reconcile one tenant out of band
pub type Trigger = ObjectRef<TenantControlPlane>;

pub type TriggerSender = mpsc::Sender<Trigger>;

/// Shared state handed to every reconciliation and resource
pub struct Context {
    /// Management cluster objects
    pub store: ObjectStoreRef,
    /// Opens administrative datastore connections
    pub connections: Arc<dyn ConnectionFactory>,
    /// Access to the tenants' own API servers
    pub tenant_clients: Arc<dyn TenantClients>,
    pub config: OperatorConfig,
    pub metrics: Arc<Metrics>,
}

/// Bounded trigger channel shared by the controllers
pub fn trigger_channel(capacity: usize) -> (TriggerSender, mpsc::Receiver<Trigger>) {
    mpsc::channel(capacity.max(1))
}
