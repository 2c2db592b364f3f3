//! Kubeconfig secrets for the control plane components
//!
//! The admin kubeconfig points at the advertised endpoint; the controller
//! manager and scheduler run next to the API server and use localhost.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::certificates::{load_authority, CertificateKind};
use super::{adopt, derived_name, Resource};
use crate::controllers::Context;
use crate::crd::{
    KubeconfigsStatus, SecretStatus, TenantControlPlane, TenantControlPlaneStatus, CERTIFICATE_LIFECYCLE_LABEL,
    CHECKSUM_ANNOTATION, LIFECYCLE_KUBECONFIG,
};
use crate::error::Result;
use crate::pki::kubeconfig::Kubeconfig;
use crate::pki::{self, CertificateKeyPair, CertificateRequest};
use crate::store::Objects;
use crate::utilities::{create_or_update, secret_checksum, OperationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeconfigKind {
    Admin,
    ControllerManager,
    Scheduler,
}

impl KubeconfigKind {
    pub fn resource_name(&self) -> &'static str {
        match self {
            KubeconfigKind::Admin => "admin-kubeconfig",
            KubeconfigKind::ControllerManager => "controller-manager-kubeconfig",
            KubeconfigKind::Scheduler => "scheduler-kubeconfig",
        }
    }

    /// Secret key holding the document
    pub fn key(&self) -> &'static str {
        match self {
            KubeconfigKind::Admin => "admin.conf",
            KubeconfigKind::ControllerManager => "controller-manager.conf",
            KubeconfigKind::Scheduler => "scheduler.conf",
        }
    }

    fn request(&self) -> CertificateRequest {
        match self {
            KubeconfigKind::Admin => CertificateRequest::new("kubernetes-admin").organization("system:masters"),
            KubeconfigKind::ControllerManager => CertificateRequest::new("system:kube-controller-manager"),
            KubeconfigKind::Scheduler => CertificateRequest::new("system:kube-scheduler"),
        }
    }

    pub fn status<'a>(&self, status: &'a KubeconfigsStatus) -> &'a SecretStatus {
        match self {
            KubeconfigKind::Admin => &status.admin,
            KubeconfigKind::ControllerManager => &status.controller_manager,
            KubeconfigKind::Scheduler => &status.scheduler,
        }
    }

    fn status_mut<'a>(&self, status: &'a mut KubeconfigsStatus) -> &'a mut SecretStatus {
        match self {
            KubeconfigKind::Admin => &mut status.admin,
            KubeconfigKind::ControllerManager => &mut status.controller_manager,
            KubeconfigKind::Scheduler => &mut status.scheduler,
        }
    }
}

pub struct KubeconfigSecret {
    kind: KubeconfigKind,
    ctx: Arc<Context>,
    secret_name: String,
    server: String,
    ca: Option<CertificateKeyPair>,
    checksum: String,
}

impl KubeconfigSecret {
    pub fn new(kind: KubeconfigKind, ctx: Arc<Context>) -> Self {
        Self {
            kind,
            ctx,
            secret_name: String::new(),
            server: String::new(),
            ca: None,
            checksum: String::new(),
        }
    }

    /// Usable when it targets the expected server, trusts the current CA and
    /// carries a client certificate issued by it
    fn is_valid(&self, ca: &CertificateKeyPair, data: &BTreeMap<String, ByteString>) -> bool {
        let Some(raw) = data.get(self.kind.key()) else {
            return false;
        };
        let Ok(config) = Kubeconfig::from_yaml(&raw.0) else {
            return false;
        };
        if config.server() != Some(self.server.as_str()) {
            return false;
        }
        if config.certificate_authority().ok().as_deref() != Some(ca.certificate.as_str()) {
            return false;
        }
        match config.credentials() {
            Ok(credentials) => {
                pki::verify_certificate(&credentials, &ca.certificate, self.ctx.config.certificate_expiration_deadline)
                    .is_ok()
            }
            Err(_) => false,
        }
    }

    fn generate(&self, tenant: &TenantControlPlane, ca: &CertificateKeyPair) -> Result<BTreeMap<String, ByteString>> {
        let request = self.kind.request();
        let credentials = pki::generate_certificate(ca, &request)?;
        let config = Kubeconfig::new(
            &tenant.name_any(),
            &self.server,
            &ca.certificate,
            &request.common_name,
            &credentials,
        );
        Ok(super::secret_data([(self.kind.key(), config.to_yaml()?.as_str())]))
    }
}

#[async_trait]
impl Resource for KubeconfigSecret {
    fn name(&self) -> &'static str {
        self.kind.resource_name()
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.secret_name = derived_name(tenant, self.kind.resource_name());
        let port = tenant.spec.network_profile.port;
        self.server = match self.kind {
            KubeconfigKind::Admin => format!("https://{}:{}", tenant.declared_control_plane_address()?, port),
            _ => format!("https://localhost:{port}"),
        };
        self.ca = Some(load_authority(&self.ctx, tenant, CertificateKind::Ca, self.name()).await?);
        Ok(())
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let Some(ca) = self.ca.as_ref() else {
            return Err(crate::error::Error::missing(self.name(), "CA not loaded"));
        };
        let secrets: Objects<Secret> = Objects::namespaced(self.ctx.store.clone(), &tenant.namespace_or_default());
        let status = tenant.status_or_default();
        let recorded = self.kind.status(&status.kubeconfig).checksum.clone();

        let this = &*self;
        let mut checksum = String::new();
        let (result, _) = create_or_update(&secrets, &self.secret_name, |secret| {
            adopt(&mut secret.metadata, tenant);
            secret
                .labels_mut()
                .insert(CERTIFICATE_LIFECYCLE_LABEL.to_string(), LIFECYCLE_KUBECONFIG.to_string());

            let data = secret.data.get_or_insert_with(BTreeMap::new);
            if recorded.is_empty() || recorded != secret_checksum(data) || !this.is_valid(ca, data) {
                *data = this.generate(tenant, ca)?;
            }
            checksum = secret_checksum(data);
            secret
                .annotations_mut()
                .insert(CHECKSUM_ANNOTATION.to_string(), checksum.clone());
            Ok(())
        })
        .await?;

        if result != OperationResult::None {
            info!(tenant = %tenant.key(), secret = %self.secret_name, %result, "kubeconfig written");
        }
        self.checksum = checksum;
        Ok(result)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let status = tenant.status_or_default();
        !self
            .kind
            .status(&status.kubeconfig)
            .matches(&self.secret_name, &self.checksum)
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        self.kind
            .status_mut(&mut status.kubeconfig)
            .record(&self.secret_name, &self.checksum);
    }
}
