//! Operator configuration
//!
//! Built from the command line (see `main.rs`) and shared read-only with
//! every controller and resource.

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the tenant controllers
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// DataStore used by tenants that do not name one
    pub default_datastore: String,
    /// Certificates are rotated this long before they expire
    pub certificate_expiration_deadline: Duration,
    /// Image running the `migrate` subcommand
    pub migrate_image: String,
    /// Namespace hosting migration jobs
    pub migrate_namespace: String,
    /// Service account of migration jobs
    pub migrate_service_account: String,
    /// Default migration timeout when the tenant carries no annotation
    pub migrate_timeout: Duration,
    /// Period of the resync requeue after a fully converged pass
    pub resync_interval: Duration,
    /// Capacity of the channel feeding tenant reconciliations
    pub trigger_capacity: usize,
    /// Registry hosting control plane images
    pub image_registry: String,
    /// kine image used in front of SQL datastores
    pub kine_image: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_datastore: "default".to_string(),
            certificate_expiration_deadline: Duration::from_secs(24 * 3600),
            migrate_image: "ghcr.io/hangar-io/hangar:latest".to_string(),
            migrate_namespace: "hangar-system".to_string(),
            migrate_service_account: "hangar-controller-manager".to_string(),
            migrate_timeout: Duration::from_secs(5 * 60),
            resync_interval: Duration::from_secs(5 * 60),
            trigger_capacity: 1024,
            image_registry: "registry.k8s.io".to_string(),
            kine_image: "rancher/kine:v0.11.4".to_string(),
        }
    }
}

/// Parse durations such as `90s`, `5m`, `24h` or a bare number of seconds
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid duration {raw:?}")))?;
    let multiplier: u64 = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(Error::Configuration(format!("invalid duration unit in {raw:?}"))),
    };
    let seconds = value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Configuration(format!("duration {raw:?} is too large")))?;
    Ok(Duration::from_secs(seconds))
}

/// Render a duration the way [`parse_duration`] reads it back
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
