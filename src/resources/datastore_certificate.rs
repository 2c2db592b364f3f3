//! TLS material the tenant uses to reach its DataStore
//!
//! etcd tenants get their own client certificate, with the tenant user as
//! common name, signed by the DataStore CA. SQL DataStores share the
//! operator's client certificate. DataStores without TLS need no secret.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::{adopt, derived_name, Resource};
use crate::controllers::Context;
use crate::crd::{
    DataStore, DataStoreDriver, SecretStatus, TenantControlPlane, TenantControlPlaneStatus,
    CERTIFICATE_LIFECYCLE_LABEL, CHECKSUM_ANNOTATION, LIFECYCLE_X509,
};
use crate::datastore::{resolve_content, TlsMaterial};
use crate::error::{Error, Result};
use crate::pki::{self, CertificateKeyPair, CertificateRequest};
use crate::store::Objects;
use crate::utilities::{create_or_update, secret_checksum, OperationResult};

pub const CA_KEY: &str = "ca.crt";
pub const CERTIFICATE_KEY: &str = "server.crt";
pub const PRIVATE_KEY_KEY: &str = "server.key";

/// Where the material comes from
enum Source {
    /// Issue a client certificate from the DataStore CA
    Issue { ca: CertificateKeyPair },
    /// Copy the DataStore's client certificate
    Copy { material: TlsMaterial },
}

fn layout(ca: &str, certificate: &str, private_key: &str) -> BTreeMap<String, ByteString> {
    super::secret_data([
        (CA_KEY, ca),
        (CERTIFICATE_KEY, certificate),
        (PRIVATE_KEY_KEY, private_key),
        ("tls.crt", certificate),
        ("tls.key", private_key),
    ])
}

pub struct DatastoreCertificate {
    ctx: Arc<Context>,
    secret_name: String,
    user: String,
    source: Option<Source>,
    checksum: String,
}

impl DatastoreCertificate {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            secret_name: String::new(),
            user: String::new(),
            source: None,
            checksum: String::new(),
        }
    }

    async fn resolve_source(&self, datastore: &DataStore) -> Result<Option<Source>> {
        let Some(tls) = datastore.spec.tls_config.as_ref() else {
            return Ok(None);
        };
        let store = &self.ctx.store;
        let ca_certificate = resolve_content(store, &tls.certificate_authority.certificate).await?;

        if datastore.spec.driver == DataStoreDriver::Etcd {
            let key = tls.certificate_authority.private_key.as_ref().ok_or_else(|| {
                Error::Configuration(format!(
                    "datastore {} must provide the CA private key to issue etcd client certificates",
                    datastore.name_any()
                ))
            })?;
            return Ok(Some(Source::Issue {
                ca: CertificateKeyPair {
                    certificate: ca_certificate,
                    private_key: resolve_content(store, key).await?,
                },
            }));
        }

        let client = tls.client_certificate.as_ref().ok_or_else(|| {
            Error::Configuration(format!("datastore {} has no client certificate", datastore.name_any()))
        })?;
        let key = client.private_key.as_ref().ok_or_else(|| {
            Error::Configuration(format!("datastore {} has no client key", datastore.name_any()))
        })?;
        Ok(Some(Source::Copy {
            material: TlsMaterial {
                certificate_authority: ca_certificate,
                client_certificate: Some(resolve_content(store, &client.certificate).await?),
                client_key: Some(resolve_content(store, key).await?),
            },
        }))
    }

    fn issued_is_valid(&self, ca: &CertificateKeyPair, data: &BTreeMap<String, ByteString>) -> bool {
        let read = |key: &str| data.get(key).and_then(|v| String::from_utf8(v.0.clone()).ok());
        let (Some(stored_ca), Some(certificate), Some(private_key)) =
            (read(CA_KEY), read(CERTIFICATE_KEY), read(PRIVATE_KEY_KEY))
        else {
            return false;
        };
        stored_ca == ca.certificate
            && pki::verify_certificate(
                &CertificateKeyPair {
                    certificate,
                    private_key,
                },
                &ca.certificate,
                self.ctx.config.certificate_expiration_deadline,
            )
            .is_ok()
    }
}

#[async_trait]
impl Resource for DatastoreCertificate {
    fn name(&self) -> &'static str {
        "datastore-certificate"
    }

    async fn define(&mut self, tenant: &TenantControlPlane) -> Result<()> {
        self.secret_name = derived_name(tenant, "datastore-certificate");
        let storage = tenant.status_or_default().storage;
        if storage.data_store_name.is_empty() {
            return Err(Error::missing(self.name(), "tenant is not bound to a datastore yet"));
        }
        self.user = if storage.setup.user.is_empty() {
            tenant.datastore_schema()
        } else {
            storage.setup.user
        };

        let datastores: Objects<DataStore> = Objects::all(self.ctx.store.clone());
        let datastore = datastores.get_required(&storage.data_store_name).await?;
        self.source = self.resolve_source(&datastore).await?;
        Ok(())
    }

    fn should_cleanup(&self, _tenant: &TenantControlPlane) -> bool {
        self.source.is_none()
    }

    async fn clean_up(&mut self, tenant: &TenantControlPlane) -> Result<bool> {
        let secrets: Objects<Secret> = Objects::namespaced(self.ctx.store.clone(), &tenant.namespace_or_default());
        let deleted = secrets.delete(&self.secret_name).await?;
        let recorded = !tenant.status_or_default().storage.certificate.secret_name.is_empty();
        Ok(deleted || recorded)
    }

    async fn create_or_update(&mut self, tenant: &TenantControlPlane) -> Result<OperationResult> {
        let Some(source) = self.source.as_ref() else {
            return Ok(OperationResult::None);
        };
        let secrets: Objects<Secret> = Objects::namespaced(self.ctx.store.clone(), &tenant.namespace_or_default());
        let recorded = tenant.status_or_default().storage.certificate.checksum;

        let this = &*self;
        let mut checksum = String::new();
        let (result, _) = create_or_update(&secrets, &self.secret_name, |secret| {
            adopt(&mut secret.metadata, tenant);
            let data = secret.data.get_or_insert_with(BTreeMap::new);

            match source {
                Source::Issue { ca } => {
                    secret
                        .metadata
                        .labels
                        .get_or_insert_with(BTreeMap::new)
                        .insert(CERTIFICATE_LIFECYCLE_LABEL.to_string(), LIFECYCLE_X509.to_string());
                    if recorded.is_empty() || recorded != secret_checksum(data) || !this.issued_is_valid(ca, data) {
                        let pair = pki::generate_certificate(ca, &CertificateRequest::new(this.user.clone()))?;
                        *data = layout(&ca.certificate, &pair.certificate, &pair.private_key);
                    }
                }
                Source::Copy { material } => {
                    *data = layout(
                        &material.certificate_authority,
                        material.client_certificate.as_deref().unwrap_or_default(),
                        material.client_key.as_deref().unwrap_or_default(),
                    );
                }
            }

            checksum = secret_checksum(data);
            secret
                .annotations_mut()
                .insert(CHECKSUM_ANNOTATION.to_string(), checksum.clone());
            Ok(())
        })
        .await?;

        if result != OperationResult::None {
            info!(tenant = %tenant.key(), secret = %self.secret_name, %result, "datastore certificate written");
        }
        self.checksum = checksum;
        Ok(result)
    }

    fn should_status_be_updated(&self, tenant: &TenantControlPlane) -> bool {
        let recorded = tenant.status_or_default().storage.certificate;
        match self.source {
            Some(_) => !recorded.matches(&self.secret_name, &self.checksum),
            None => recorded != SecretStatus::default(),
        }
    }

    fn update_status(&self, status: &mut TenantControlPlaneStatus) {
        match self.source {
            Some(_) => status.storage.certificate.record(&self.secret_name, &self.checksum),
            None => status.storage.certificate = SecretStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::tenant_control_plane::tests::tenant;
    use crate::crd::{CertKeyRef, ContentRef, DataStoreSpec, TlsConfig};
    use crate::resources::testing::{apply_status, Harness};
    use crate::resources::{handle, secret_value, Outcome};

    fn inline(content: &str) -> ContentRef {
        ContentRef {
            content: Some(content.to_string()),
            secret_reference: None,
        }
    }

    async fn bound(harness: &Harness, spec: DataStoreSpec) -> TenantControlPlane {
        let datastores: Objects<DataStore> = Objects::all(harness.ctx.store.clone());
        datastores.create(&DataStore::new("shared", spec)).await.unwrap();
        let mut tcp = tenant("team-a", "alpha");
        let mut status = tcp.status_or_default();
        status.storage.data_store_name = "shared".into();
        tcp.status = Some(status);
        tcp
    }

    #[tokio::test]
    async fn test_etcd_client_certificate_is_issued() {
        let harness = Harness::new();
        let ca = pki::generate_ca("etcd-ca").unwrap();
        let mut tcp = bound(
            &harness,
            DataStoreSpec {
                driver: DataStoreDriver::Etcd,
                endpoints: vec!["etcd:2379".into()],
                basic_auth: None,
                tls_config: Some(TlsConfig {
                    certificate_authority: CertKeyRef {
                        certificate: inline(&ca.certificate),
                        private_key: Some(inline(&ca.private_key)),
                    },
                    client_certificate: None,
                }),
            },
        )
        .await;

        let mut resource = DatastoreCertificate::new(harness.ctx.clone());
        assert_eq!(
            handle(&mut resource, &tcp).await.unwrap(),
            Outcome::Applied(OperationResult::Created)
        );
        apply_status(&resource, &mut tcp);

        let secrets: Objects<Secret> = Objects::namespaced(harness.ctx.store.clone(), "team-a");
        let secret = secrets.get_required("alpha-datastore-certificate").await.unwrap();
        let pair = CertificateKeyPair {
            certificate: secret_value(&secret, "tls.crt").unwrap(),
            private_key: secret_value(&secret, "tls.key").unwrap(),
        };
        pki::verify_certificate(&pair, &ca.certificate, std::time::Duration::ZERO).unwrap();
        assert!(pki::certificate_info(pair.certificate.as_bytes())
            .unwrap()
            .subject
            .contains(&tcp.datastore_schema()));

        let mut resource = DatastoreCertificate::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::Unchanged);
    }

    #[tokio::test]
    async fn test_sql_client_certificate_is_copied() {
        let harness = Harness::new();
        let tcp = bound(
            &harness,
            DataStoreSpec {
                driver: DataStoreDriver::PostgreSQL,
                endpoints: vec!["pg:5432".into()],
                basic_auth: None,
                tls_config: Some(TlsConfig {
                    certificate_authority: CertKeyRef {
                        certificate: inline("ca-pem"),
                        private_key: None,
                    },
                    client_certificate: Some(CertKeyRef {
                        certificate: inline("client-pem"),
                        private_key: Some(inline("client-key")),
                    }),
                }),
            },
        )
        .await;

        let mut resource = DatastoreCertificate::new(harness.ctx.clone());
        handle(&mut resource, &tcp).await.unwrap();
        let secrets: Objects<Secret> = Objects::namespaced(harness.ctx.store.clone(), "team-a");
        let secret = secrets.get_required("alpha-datastore-certificate").await.unwrap();
        assert_eq!(secret_value(&secret, "server.crt").as_deref(), Some("client-pem"));
        assert_eq!(secret_value(&secret, "tls.key").as_deref(), Some("client-key"));
        assert_eq!(secret_value(&secret, "ca.crt").as_deref(), Some("ca-pem"));
        assert!(!secret.labels().contains_key(CERTIFICATE_LIFECYCLE_LABEL));
    }

    #[tokio::test]
    async fn test_plaintext_datastore_cleans_up() {
        let harness = Harness::new();
        let mut tcp = bound(
            &harness,
            DataStoreSpec {
                driver: DataStoreDriver::MySQL,
                endpoints: vec!["mysql:3306".into()],
                basic_auth: None,
                tls_config: None,
            },
        )
        .await;
        let mut status = tcp.status_or_default();
        status.storage.certificate.record("alpha-datastore-certificate", "stale");
        tcp.status = Some(status);

        let mut resource = DatastoreCertificate::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::CleanedUp);
        apply_status(&resource, &mut tcp);
        assert_eq!(tcp.status_or_default().storage.certificate, SecretStatus::default());

        let mut resource = DatastoreCertificate::new(harness.ctx.clone());
        assert_eq!(handle(&mut resource, &tcp).await.unwrap(), Outcome::Unchanged);
    }
}
