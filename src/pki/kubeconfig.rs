//! Kubeconfig documents
//!
//! Minimal model of the kubeconfig format: one cluster, one user with
//! embedded client certificate data, one context.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::CertificateKeyPair;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    pub current_context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    pub certificate_authority_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    pub client_certificate_data: String,
    pub client_key_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

fn decode(field: &str, data: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| Error::Kubeconfig(format!("{field} is not base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| Error::Kubeconfig(format!("{field} is not UTF-8: {e}")))
}

impl Kubeconfig {
    /// Build a single-context kubeconfig for `user`
    pub fn new(cluster_name: &str, server: &str, ca_certificate: &str, user: &str, credentials: &CertificateKeyPair) -> Self {
        let context = format!("{user}@{cluster_name}");
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: Cluster {
                    server: server.to_string(),
                    certificate_authority_data: STANDARD.encode(ca_certificate),
                },
            }],
            users: vec![NamedUser {
                name: user.to_string(),
                user: User {
                    client_certificate_data: STANDARD.encode(&credentials.certificate),
                    client_key_data: STANDARD.encode(&credentials.private_key),
                },
            }],
            contexts: vec![NamedContext {
                name: context.clone(),
                context: Context {
                    cluster: cluster_name.to_string(),
                    user: user.to_string(),
                },
            }],
            current_context: context,
        }
    }

    /// Cluster-only kubeconfig, as published in `kube-public/cluster-info`
    pub fn cluster_info(server: &str, ca_certificate: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: String::new(),
                cluster: Cluster {
                    server: server.to_string(),
                    certificate_authority_data: STANDARD.encode(ca_certificate),
                },
            }],
            users: Vec::new(),
            contexts: Vec::new(),
            current_context: String::new(),
        }
    }

    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(raw).map_err(|e| Error::Kubeconfig(format!("parsing kubeconfig: {e}")))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn server(&self) -> Option<&str> {
        self.clusters.first().map(|c| c.cluster.server.as_str())
    }

    /// Decoded CA certificate of the first cluster
    pub fn certificate_authority(&self) -> Result<String> {
        let cluster = self
            .clusters
            .first()
            .ok_or_else(|| Error::Kubeconfig("no cluster defined".into()))?;
        decode("certificate-authority-data", &cluster.cluster.certificate_authority_data)
    }

    /// Decoded client certificate and key of the first user
    pub fn credentials(&self) -> Result<CertificateKeyPair> {
        let user = self
            .users
            .first()
            .ok_or_else(|| Error::Kubeconfig("no user defined".into()))?;
        Ok(CertificateKeyPair {
            certificate: decode("client-certificate-data", &user.user.client_certificate_data)?,
            private_key: decode("client-key-data", &user.user.client_key_data)?,
        })
    }
}
