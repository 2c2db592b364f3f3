//! Certificate lifecycle controller
//!
//! Watches the secrets carrying [`CERTIFICATE_LIFECYCLE_LABEL`] and works
//! out when the earliest certificate inside them enters the rotation
//! window. The secret itself is never modified: once the deadline passes
//! the owning tenant is sent through the trigger channel, and its
//! certificate resources regenerate the material because it no longer
//! validates. Secrets produced by a KubeconfigGenerator are reported on a
//! separate channel, for whichever controller renders them.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::{Trigger, TriggerSender};
use crate::crd::{TenantControlPlane, CERTIFICATE_LIFECYCLE_LABEL, LIFECYCLE_KUBECONFIG, LIFECYCLE_X509};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pki::earliest_expiry;
use crate::pki::kubeconfig::Kubeconfig;

/// Recheck delay after a rotation was requested
const ROTATION_RECHECK: Duration = Duration::from_secs(60);

/// Owner kind of kubeconfig secrets rendered outside the tenant pipeline
pub const KUBECONFIG_GENERATOR_KIND: &str = "KubeconfigGenerator";

/// A KubeconfigGenerator whose output entered its rotation window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for GeneratorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub struct LifecycleContext {
    pub triggers: TriggerSender,
    /// Receives generator rotations; `None` when no generator controller runs
    pub generator_triggers: Option<mpsc::Sender<GeneratorRef>>,
    /// Certificates are rotated this long before they expire
    pub window: Duration,
    pub metrics: Arc<Metrics>,
}

/// What to do about one secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Deadline passed, reconcile the owning tenant
    Rotate(Trigger),
    /// Deadline passed, regenerate through the owning KubeconfigGenerator
    RotateGenerator(GeneratorRef),
    /// Look again at the rotation deadline
    RequeueAt(DateTime<Utc>),
    /// Nothing this controller can act on
    Skip(String),
}

/// Earliest expiry of the certificates held by a labelled secret
fn expiry(secret: &Secret, lifecycle: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(data) = secret.data.as_ref() else {
        return Ok(None);
    };

    let mut earliest: Option<DateTime<Utc>> = None;
    let mut consider = |not_after: DateTime<Utc>| {
        earliest = Some(earliest.map_or(not_after, |current| current.min(not_after)));
    };
    match lifecycle {
        LIFECYCLE_X509 => {
            for (_, value) in data.iter().filter(|(key, _)| key.ends_with(".crt")) {
                consider(earliest_expiry(&value.0)?);
            }
        }
        LIFECYCLE_KUBECONFIG => {
            for value in data.values() {
                let credentials = Kubeconfig::from_yaml(&value.0)?.credentials()?;
                consider(earliest_expiry(credentials.certificate.as_bytes())?);
            }
        }
        other => return Err(Error::InvalidSpec(format!("unknown certificate lifecycle {other:?}"))),
    }
    Ok(earliest)
}

/// Decide whether the tenant owning `secret` must rotate it
pub fn evaluate(secret: &Secret, window: Duration, now: DateTime<Utc>) -> Result<Decision> {
    let Some(lifecycle) = secret.labels().get(CERTIFICATE_LIFECYCLE_LABEL) else {
        return Ok(Decision::Skip("not a lifecycle-managed secret".into()));
    };
    let Some(not_after) = expiry(secret, lifecycle)? else {
        return Ok(Decision::Skip("secret holds no certificate".into()));
    };

    let window = chrono::Duration::from_std(window).map_err(|e| Error::Configuration(e.to_string()))?;
    let deadline = not_after - window;
    if now < deadline {
        return Ok(Decision::RequeueAt(deadline));
    }

    let owner = secret.owner_references().iter().find(|o| o.controller == Some(true));
    let namespace = secret.namespace().unwrap_or_default();
    match owner {
        Some(owner) if owner.api_version.starts_with("hangar.io/") && owner.kind == "TenantControlPlane" => {
            let trigger = ObjectRef::<TenantControlPlane>::new(&owner.name).within(&namespace);
            Ok(Decision::Rotate(trigger))
        }
        Some(owner) if owner.api_version.starts_with("hangar.io/") && owner.kind == KUBECONFIG_GENERATOR_KIND => {
            Ok(Decision::RotateGenerator(GeneratorRef {
                namespace,
                name: owner.name.clone(),
            }))
        }
        Some(owner) => Ok(Decision::Skip(format!("owned by {} {}", owner.kind, owner.name))),
        None => Ok(Decision::Skip("no controlling owner".into())),
    }
}

/// Reconcile a lifecycle-managed secret
#[instrument(skip(secret, ctx), fields(secret = %secret.name_any(), namespace = %secret.namespace().unwrap_or_default()))]
pub async fn reconcile(secret: Arc<Secret>, ctx: Arc<LifecycleContext>) -> Result<Action> {
    let now = Utc::now();
    let action = match evaluate(&secret, ctx.window, now)? {
        Decision::Rotate(trigger) => {
            info!(tenant = %trigger, "certificate entered its rotation window, requesting rotation");
            ctx.triggers
                .send(trigger)
                .await
                .map_err(|_| Error::Internal("tenant controller is no longer receiving triggers".into()))?;
            ctx.metrics.rotation_triggered();
            ctx.metrics.reconciled("certificate-lifecycle", "rotated", Duration::ZERO);
            Action::requeue(ROTATION_RECHECK)
        }
        Decision::RotateGenerator(generator) => match ctx.generator_triggers.as_ref() {
            Some(sender) => {
                info!(%generator, "certificate entered its rotation window, requesting regeneration");
                sender
                    .send(generator)
                    .await
                    .map_err(|_| Error::Internal("generator controller is no longer receiving triggers".into()))?;
                ctx.metrics.rotation_triggered();
                ctx.metrics.reconciled("certificate-lifecycle", "rotated", Duration::ZERO);
                Action::requeue(ROTATION_RECHECK)
            }
            None => {
                debug!(%generator, "no generator controller registered, secret skipped");
                ctx.metrics.reconciled("certificate-lifecycle", "skipped", Duration::ZERO);
                Action::await_change()
            }
        },
        Decision::RequeueAt(deadline) => {
            debug!(%deadline, "certificate still valid");
            ctx.metrics.reconciled("certificate-lifecycle", "valid", Duration::ZERO);
            Action::requeue((deadline - now).to_std().unwrap_or(Duration::ZERO))
        }
        Decision::Skip(reason) => {
            debug!(%reason, "secret skipped");
            ctx.metrics.reconciled("certificate-lifecycle", "skipped", Duration::ZERO);
            Action::await_change()
        }
    };
    Ok(action)
}

pub fn error_policy(secret: Arc<Secret>, error: &Error, _ctx: Arc<LifecycleContext>) -> Action {
    warn!(secret = %secret.name_any(), %error, "certificate lifecycle check failed");
    Action::requeue(Duration::from_secs(60))
}
