//! Tenant PKI secrets
//!
//! Two certificate authorities (cluster CA and front-proxy CA), the
//! service-account signing key pair and three leaf certificates. Every pair
//! lives in its own secret using the kubeadm file names as keys.
//!
//! A stored pair is reused while the checksum recorded in the tenant status
//! still matches the secret and the pair verifies; otherwise it is
//! regenerated in place.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::{adopt, derived_name, secret_value, Resource};
use crate::controllers::Context;
use crate::crd::{
    CertificatesStatus, SecretStatus, TenantControlPlane, TenantControlPlaneStatus, CERTIFICATE_LIFECYCLE_LABEL,
    CHECKSUM_ANNOTATION, LIFECYCLE_X509,
};
use crate::error::{Error, Result};
use crate::pki::{self, CertificateKeyPair, CertificateRequest, PublicKeyPair};
use crate::store::Objects;
use crate::utilities::{create_or_update, secret_checksum, OperationResult};

/// Which pair a [`Certificate`] manages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    Ca,
    FrontProxyCa,
    ServiceAccount,
    ApiServer,
    ApiServerKubeletClient,
    FrontProxyClient,
}

impl CertificateKind {
    pub fn resource_name(&self) -> &'static str {
        match self {
            CertificateKind::Ca => "ca",
            CertificateKind::FrontProxyCa => "front-proxy-ca",
            CertificateKind::ServiceAccount => "sa-certificate",
            CertificateKind::ApiServer => "api-server-certificate",
            CertificateKind::ApiServerKubeletClient => "api-server-kubelet-client-certificate",
            CertificateKind::FrontProxyClient => "front-proxy-client-certificate",
        }
    }

    fn secret_suffix(&self) -> &'static str {
        match self {
            CertificateKind::Ca => "ca",
            CertificateKind::FrontProxyCa => "front-proxy-ca-certificate",
            CertificateKind::ServiceAccount => "sa-certificate",
            CertificateKind::ApiServer => "api-server-certificate",
            CertificateKind::ApiServerKubeletClient => "api-server-kubelet-client-certificate",
            CertificateKind::FrontProxyClient => "front-proxy-client-certificate",
        }
    }

    /// Secret keys holding the public half and the private key
    pub fn keys(&self) -> (&'static str, &'static str) {
        match self {
            CertificateKind::Ca => ("ca.crt", "ca.key"),
            CertificateKind::FrontProxyCa => ("front-proxy-ca.crt", "front-proxy-ca.key"),
            CertificateKind::ServiceAccount => ("sa.pub", "sa.key"),
            CertificateKind::ApiServer => ("apiserver.crt", "apiserver.key"),
            CertificateKind::ApiServerKubeletClient => ("apiserver-kubelet-client.crt", "apiserver-kubelet-client.key"),
            CertificateKind::FrontProxyClient => ("front-proxy-client.crt", "front-proxy-client.key"),
        }
    }

    /// Authority signing this kind, for leaves
    fn issuer(&self) -> Option<CertificateKind> {
        match self {
            CertificateKind::ApiServer | CertificateKind::ApiServerKubeletClient => Some(CertificateKind::Ca),
            CertificateKind::FrontProxyClient => Some(CertificateKind::FrontProxyCa),
            _ => None,
        }
    }

    pub fn status<'a>(&self, status: &'a CertificatesStatus) -> &'a SecretStatus {
        match self {
            CertificateKind::Ca => &status.ca,
            CertificateKind::FrontProxyCa => &status.front_proxy_ca,
            CertificateKind::ServiceAccount => &status.sa,
            CertificateKind::ApiServer => &status.api_server,
            CertificateKind::ApiServerKubeletClient => &status.api_server_kubelet_client,
            CertificateKind::FrontProxyClient => &status.front_proxy_client,
        }
    }

    fn status_mut<'a>(&self, status: &'a mut CertificatesStatus) -> &'a mut SecretStatus {
        match self {
            CertificateKind::Ca => &mut status.ca,
            CertificateKind::FrontProxyCa => &mut status.front_proxy_ca,
            CertificateKind::ServiceAccount => &mut status.sa,
            CertificateKind::ApiServer => &mut status.api_server,
            CertificateKind::ApiServerKubeletClient => &mut status.api_server_kubelet_client,
            CertificateKind::FrontProxyClient => &mut status.front_proxy_client,
        }
    }
}

/// Read a certificate/key pair from a tenant secret
pub(crate) async fn load_pair(
    ctx: &Context,
    tenant: &TenantControlPlane,
    secret_name: &str,
    (certificate_key, private_key_key): (&str, &str),
) -> Result<CertificateKeyPair> {
    let secrets: Objects<Secret> = Objects::namespaced(ctx.store.clone(), &tenant.namespace_or_default());
    let secret = secrets.get_required(secret_name).await?;
    let read = |key: &str| {
        secret_value(&secret, key).ok_or_else(|| Error::Certificate(format!("secret {secret_name} has no {key}")))
    };
    Ok(CertificateKeyPair {
        certificate: read(certificate_key)?,
        private_key: read(private_key_key)?,
    })
}

/// Load the CA pair recorded in the tenant status
pub(crate) async fn load_authority(
    ctx: &Context,
    tenant: &TenantControlPlane,
    kind: CertificateKind,
    resource: &str,
) -> Result<CertificateKeyPair> {
    let status = tenant.status_or_default();
    let recorded = kind.status(&status.certificates);
    if recorded.secret_name.is_empty() {
        return Err(Error::missing(
            resource,
            format!("{} secret not yet recorded", kind.resource_name()),
        ));
    }
    load_pair(ctx, tenant, &recorded.secret_name, kind.keys()).await
}

/// Subject alternative names of the API server certificate
pub fn api_server_sans(tenant: &TenantControlPlane, address: &str) -> Vec<String> {
    let network = &tenant.spec.network_profile;
    let name = tenant.name_any();
    let namespace = tenant.namespace_or_default();

    let mut sans = vec![
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{}", network.cluster_domain),
    ];
    if let Some(service_ip) = super::first_address(&network.service_cidr) {
        sans.push(service_ip.to_string());
    }
    sans.push(address.to_string());
    sans.extend(network.cert_sans.iter().cloned());
    sans.extend([
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        format!("{name}.{namespace}.svc"),
        format!("{name}.{namespace}.svc.cluster.local"),
    ]);
    if let Some(ingress) = tenant.spec.control_plane.ingress.as_ref() {
        sans.push(ingress.hostname.clone());
    }
    sans
}

// =============================================================================
// Certificate Resource
// =============================================================================

pub struct Certificate {
    kind: CertificateKind,
    ctx: Arc<Context>,
    secret_name: String,
    /// Signing authority, for leaves
    issuer: Option<CertificateKeyPair>,
    request: Option<CertificateRequest>,
    /// Checksum of the secret after the last create-or-update
    checksum: String,
}

impl Certificate {
    pub fn new(kind: CertificateKind, ctx: Arc<Context>) -> Self {
        Self {
            kind,
            ctx,
            secret_name: String::new(),
            issuer: None,
            request: None,
            checksum: String::new(),
        }
    }

    fn is_valid(&self, data: &BTreeMap<String, ByteString>) -> bool {
        let (public, private) = self.kind.keys();
        let read = |key: &str| data.get(key).and_then(|v| String::from_utf8(v.0.clone()).ok());
        let (Some(public), Some(private)) = (read(public), read(private)) else {
            return false;
        };
        let window = self.ctx.config.certificate_expiration_deadline;

        let verdict = match (self.kind, self.issuer.as_ref()) {
            (CertificateKind::ServiceAccount, _) => pki::verify_public_key_pair(&PublicKeyPair {
                public_key: public,
                private_key: private,
            }),
            (_, Some(issuer)) => pki::verify_certificate(
                &CertificateKeyPair {
                    certificate: public,
                    private_key: private,
                },
                &issuer.certificate,
                window,
            ),
            (_, None) => pki::verify_ca(
                &CertificateKeyPair {
                    certificate: public,
                    private_key: private,
                },
                window,
            ),
        };
        verdict.is_ok()
    }

    fn generate(&self) -> Result<BTreeMap<String, ByteString>> {
        let (public, private) = self.kind.keys();
        let (public_value, private_value) = match (self.kind, self.issuer.as_ref(), self.request.as_ref()) {
            (CertificateKind::ServiceAccount, _, _) => {
                let pair = pki::generate_public_key_pair()?;
                (pair.public_key, pair.private_key)
            }
            (CertificateKind::Ca, _, _) => {
                let pair = pki::generate_ca("kubernetes")?;
                (pair.certificate, pair.private_key)
            }
            (CertificateKind::FrontProxyCa, _, _) => {
                let pair = pki::generate_ca("front-proxy-ca")?;
                (pair.certificate, pair.private_key)
            }
            (_, Some(issuer), Some(request)) => {
                let pair = pki::generate_certificate(issuer, request)?;
                (pair.certificate, pair.private_key)
            }
            _ => return Err(Error::Internal(format!("{} generated before define", self.kind.resource_name()))),
        };
        Ok(super::secret_data([(public, public_value.as_str()), (private, private_value.as_str())]))
    }
}

#[async_trait]
impl Resource for Certificate {
    fn name(&self) -> &'static str {
        self.kind.resource_name()
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.secret_name = derived_name(tenant, self.kind.secret_suffix());

        if let Some(issuer_kind) = self.kind.issuer() {
            self.issuer = Some(load_authority(&self.ctx, tenant, issuer_kind, self.name()).await?);
        }

        self.request = match self.kind {
            CertificateKind::ApiServer => {
                let address = tenant.declared_control_plane_address()?;
                Some(CertificateRequest::new("kube-apiserver").sans(api_server_sans(tenant, &address)))
            }
            CertificateKind::ApiServerKubeletClient => {
                Some(CertificateRequest::new("kube-apiserver-kubelet-client").organization("system:masters"))
            }
            CertificateKind::FrontProxyClient => Some(CertificateRequest::new("front-proxy-client")),
            _ => None,
        };
        Ok(())
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let secrets: Objects<Secret> = Objects::namespaced(self.ctx.store.clone(), &tenant.namespace_or_default());
        let status = tenant.status_or_default();
        let recorded = self.kind.status(&status.certificates).checksum.clone();

        let this = &*self;
        let mut checksum = String::new();
        let (result, _) = create_or_update(&secrets, &self.secret_name, |secret| {
            adopt(&mut secret.metadata, tenant);
            if this.kind != CertificateKind::ServiceAccount {
                secret
                    .labels_mut()
                    .insert(CERTIFICATE_LIFECYCLE_LABEL.to_string(), LIFECYCLE_X509.to_string());
            }

            let data = secret.data.get_or_insert_with(BTreeMap::new);
            if recorded.is_empty() || recorded != secret_checksum(data) || !this.is_valid(data) {
                *data = this.generate()?;
            }

            checksum = secret_checksum(data);
            secret
                .annotations_mut()
                .insert(CHECKSUM_ANNOTATION.to_string(), checksum.clone());
            Ok(())
        })
        .await?;

        if result != OperationResult::None {
            info!(tenant = %tenant.key(), secret = %self.secret_name, %result, "certificate material written");
        }
        self.checksum = checksum;
        Ok(result)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let status = tenant.status_or_default();
        !self
            .kind
            .status(&status.certificates)
            .matches(&self.secret_name, &self.checksum)
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        self.kind
            .status_mut(&mut status.certificates)
            .record(&self.secret_name, &self.checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::resources::handle;
    use crate::resources::testing::{apply_status, Harness};
    use crate::resources::Outcome;
    use assert_matches::assert_matches;

    fn addressed(name: &str) -> TenantControlPlane {
        let mut tcp = tenant("default", name);
        tcp.spec.network_profile.address = Some("192.0.2.10".into());
        tcp
    }

    async fn converge(harness: &Harness, kind: CertificateKind, tcp: &mut TenantControlPlane) -> Outcome {
        let mut resource = Certificate::new(kind, harness.ctx.clone());
        let outcome = handle(&mut resource, tcp).await.unwrap();
        apply_status(&resource, tcp);
        outcome
    }

    async fn read_certificate(harness: &Harness, secret: &str, key: &str) -> String {
        let secrets: Objects<Secret> = Objects::namespaced(harness.ctx.store.clone(), "default");
        secret_value(&secrets.get_required(secret).await.unwrap(), key).unwrap()
    }

    #[tokio::test]
    async fn test_ca_is_generated_then_reused() {
        let harness = Harness::new();
        let mut tcp = addressed("alpha");

        assert_eq!(
            converge(&harness, CertificateKind::Ca, &mut tcp).await,
            Outcome::Applied(OperationResult::Created)
        );
        let status = tcp.status_or_default();
        assert_eq!(status.certificates.ca.secret_name, "alpha-ca");
        assert_eq!(status.certificates.ca.checksum.len(), 64);

        let writes = harness.store.writes();
        assert_eq!(converge(&harness, CertificateKind::Ca, &mut tcp).await, Outcome::Unchanged);
        assert_eq!(harness.store.writes(), writes);
    }

    #[tokio::test]
    async fn test_leaf_requires_ca() {
        let harness = Harness::new();
        let tcp = addressed("alpha");
        let mut resource = Certificate::new(CertificateKind::ApiServer, harness.ctx.clone());
        assert_matches!(resource.define(&tcp).await, Err(Error::MissingPrerequisite { .. }));
    }

    #[tokio::test]
    async fn test_api_server_waits_for_address() {
        let harness = Harness::new();
        let mut tcp = tenant("default", "alpha");
        converge(&harness, CertificateKind::Ca, &mut tcp).await;

        let mut resource = Certificate::new(CertificateKind::ApiServer, harness.ctx.clone());
        let err = resource.define(&tcp).await.unwrap_err();
        assert!(err.is_sentinel());
    }

    #[tokio::test]
    async fn test_cleared_checksum_regenerates_with_new_serial() {
        let harness = Harness::new();
        let mut tcp = addressed("alpha");
        converge(&harness, CertificateKind::Ca, &mut tcp).await;
        converge(&harness, CertificateKind::ApiServer, &mut tcp).await;

        let before = read_certificate(&harness, "alpha-api-server-certificate", "apiserver.crt").await;
        let mut status = tcp.status_or_default();
        status.certificates.api_server.checksum.clear();
        tcp.status = Some(status);

        assert_eq!(
            converge(&harness, CertificateKind::ApiServer, &mut tcp).await,
            Outcome::Applied(OperationResult::Updated)
        );
        let after = read_certificate(&harness, "alpha-api-server-certificate", "apiserver.crt").await;

        let before = pki::certificate_info(before.as_bytes()).unwrap();
        let after = pki::certificate_info(after.as_bytes()).unwrap();
        assert_ne!(before.serial, after.serial);
        assert_eq!(before.subject, after.subject);
    }

    #[tokio::test]
    async fn test_rotated_ca_invalidates_leaves() {
        let harness = Harness::new();
        let mut tcp = addressed("alpha");
        converge(&harness, CertificateKind::Ca, &mut tcp).await;
        converge(&harness, CertificateKind::ApiServerKubeletClient, &mut tcp).await;

        let mut status = tcp.status_or_default();
        status.certificates.ca.checksum.clear();
        tcp.status = Some(status);
        converge(&harness, CertificateKind::Ca, &mut tcp).await;

        assert_eq!(
            converge(&harness, CertificateKind::ApiServerKubeletClient, &mut tcp).await,
            Outcome::Applied(OperationResult::Updated)
        );
        let ca = read_certificate(&harness, "alpha-ca", "ca.crt").await;
        let leaf = CertificateKeyPair {
            certificate: read_certificate(&harness, "alpha-api-server-kubelet-client-certificate", "apiserver-kubelet-client.crt").await,
            private_key: read_certificate(&harness, "alpha-api-server-kubelet-client-certificate", "apiserver-kubelet-client.key").await,
        };
        pki::verify_certificate(&leaf, &ca, std::time::Duration::ZERO).unwrap();
    }

    #[tokio::test]
    async fn test_service_account_pair_is_not_lifecycle_managed() {
        let harness = Harness::new();
        let mut tcp = addressed("alpha");
        converge(&harness, CertificateKind::ServiceAccount, &mut tcp).await;

        let secrets: Objects<Secret> = Objects::namespaced(harness.ctx.store.clone(), "default");
        let secret = secrets.get_required("alpha-sa-certificate").await.unwrap();
        assert!(!secret.labels().contains_key(CERTIFICATE_LIFECYCLE_LABEL));
        assert!(secret_value(&secret, "sa.pub").unwrap().contains("PUBLIC KEY"));
        assert_eq!(
            secret.annotations()[CHECKSUM_ANNOTATION],
            tcp.status_or_default().certificates.sa.checksum
        );
    }

    #[test]
    fn test_api_server_sans() {
        let mut tcp = tenant("team-a", "alpha");
        tcp.spec.network_profile.cert_sans = vec!["api.example.com".into()];
        let sans = api_server_sans(&tcp, "192.0.2.10");
        for expected in [
            "kubernetes.default.svc.cluster.local",
            "10.96.0.1",
            "192.0.2.10",
            "api.example.com",
            "alpha.team-a.svc",
        ] {
            assert!(sans.iter().any(|s| s == expected), "missing {expected}");
        }
    }
}
