//! Hangar operator
//!
//! Two entry points share this binary:
//!
//! - `hangar manager` runs the TenantControlPlane, certificate lifecycle and
//!   DataStore controllers together with the health and metrics servers
//! - `hangar migrate` copies one tenant's data to another DataStore; the
//!   manager launches it as a Job when a tenant changes DataStore
//!
//! `hangar crd` prints the CustomResourceDefinitions.

use anyhow::Context as _;
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, CustomResourceExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hangar::config::parse_duration;
use hangar::controllers::certificate_lifecycle::{self, LifecycleContext};
use hangar::controllers::datastore::{self as datastore_controller, DatastoreContext};
use hangar::controllers::tenant;
use hangar::crd::{CERTIFICATE_LIFECYCLE_LABEL, TENANT_LABEL};
use hangar::datastore::migrate::{migrate, MigrationRequest};
use hangar::{
    trigger_channel, ConnectionFactory, Context, DataStore, DriverFactory, Error, KubeStore, KubeconfigClients, Metrics,
    ObjectStoreRef, OperatorConfig, TenantControlPlane,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Hangar - hosted Kubernetes control planes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controllers
    Manager(ManagerArgs),
    /// Move a tenant's data to another DataStore
    Migrate(MigrateArgs),
    /// Print the CustomResourceDefinitions as YAML
    Crd,
}

#[derive(ClapArgs, Debug)]
struct ManagerArgs {
    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// DataStore used by tenants that do not name one
    #[arg(long, env = "DATASTORE", default_value = "default")]
    datastore: String,

    /// Rotate certificates this long before they expire
    #[arg(long, env = "CERTIFICATE_EXPIRATION_DEADLINE", default_value = "24h")]
    certificate_expiration_deadline: String,

    /// Image of the migration jobs
    #[arg(long, env = "MIGRATE_IMAGE", default_value = "ghcr.io/hangar-io/hangar:latest")]
    migrate_image: String,

    /// Namespace of the migration jobs
    #[arg(long, env = "MIGRATE_NAMESPACE", default_value = "hangar-system")]
    migrate_namespace: String,

    /// Service account of the migration jobs
    #[arg(long, env = "MIGRATE_SERVICE_ACCOUNT", default_value = "hangar-controller-manager")]
    migrate_service_account: String,

    /// Default migration timeout
    #[arg(long, env = "MIGRATE_TIMEOUT", default_value = "5m")]
    migrate_timeout: String,

    /// Requeue period of converged tenants
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "5m")]
    resync_interval: String,

    /// Registry hosting the control plane images
    #[arg(long, env = "IMAGE_REGISTRY", default_value = "registry.k8s.io")]
    image_registry: String,

    /// kine image used in front of SQL datastores
    #[arg(long, env = "KINE_IMAGE", default_value = "rancher/kine:v0.11.4")]
    kine_image: String,
}

impl ManagerArgs {
    fn config(&self) -> hangar::Result<OperatorConfig> {
        Ok(OperatorConfig {
            default_datastore: self.datastore.clone(),
            certificate_expiration_deadline: parse_duration(&self.certificate_expiration_deadline)?,
            migrate_image: self.migrate_image.clone(),
            migrate_namespace: self.migrate_namespace.clone(),
            migrate_service_account: self.migrate_service_account.clone(),
            migrate_timeout: parse_duration(&self.migrate_timeout)?,
            resync_interval: parse_duration(&self.resync_interval)?,
            image_registry: self.image_registry.clone(),
            kine_image: self.kine_image.clone(),
            ..OperatorConfig::default()
        })
    }
}

#[derive(ClapArgs, Debug)]
struct MigrateArgs {
    #[arg(long)]
    tenant_namespace: String,

    #[arg(long)]
    tenant_name: String,

    /// DataStore receiving the tenant data
    #[arg(long)]
    target_datastore: String,

    #[arg(long, default_value = "5m")]
    timeout: String,
}

impl MigrateArgs {
    fn request(&self) -> hangar::Result<MigrationRequest> {
        Ok(MigrationRequest {
            tenant_namespace: self.tenant_namespace.clone(),
            tenant_name: self.tenant_name.clone(),
            target_datastore: self.target_datastore.clone(),
            timeout: parse_duration(&self.timeout)?,
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    match args.command {
        Command::Manager(manager) => run_manager(manager).await,
        Command::Migrate(request) => run_migrate(request).await,
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&TenantControlPlane::crd())?);
            println!("---");
            print!("{}", serde_yaml::to_string(&DataStore::crd())?);
            Ok(())
        }
    }
}

async fn run_manager(args: ManagerArgs) -> anyhow::Result<()> {
    let config = args.config()?;

    info!("Starting Hangar operator");
    info!("  Version: {}", hangar::VERSION);
    info!("  Default DataStore: {}", config.default_datastore);
    info!("  Image registry: {}", config.image_registry);

    let client = Client::try_default().await.context("connecting to the management cluster")?;
    let store: ObjectStoreRef = Arc::new(KubeStore::new(client.clone()));
    let metrics = Arc::new(Metrics::new()?);
    let (triggers, receiver) = trigger_channel(config.trigger_capacity);

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let exported = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, exported).await {
            error!("Metrics server error: {}", e);
        }
    });

    let lifecycle_ctx = Arc::new(LifecycleContext {
        triggers: triggers.clone(),
        generator_triggers: None,
        window: config.certificate_expiration_deadline,
        metrics: metrics.clone(),
    });
    let connections: Arc<dyn ConnectionFactory> = Arc::new(DriverFactory::new(store.clone()));
    let datastore_ctx = Arc::new(DatastoreContext {
        store: store.clone(),
        connections: connections.clone(),
        triggers,
        metrics: metrics.clone(),
    });
    let ctx = Arc::new(Context {
        store: store.clone(),
        connections,
        tenant_clients: Arc::new(KubeconfigClients::new(store)),
        config,
        metrics,
    });

    let owned = || watcher::Config::default().labels(TENANT_LABEL);
    let tenants = Controller::new(Api::<TenantControlPlane>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Secret>::all(client.clone()), owned())
        .owns(Api::<Service>::all(client.clone()), owned())
        .owns(Api::<Deployment>::all(client.clone()), owned())
        .reconcile_on(ReceiverStream::new(receiver))
        .shutdown_on_signal()
        .run(tenant::reconcile, tenant::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((tenant, _)) => debug!(tenant = %tenant, "reconciled"),
                Err(e) => warn!("tenant reconcile failed: {}", e),
            }
        });

    let certificates = Controller::new(
        Api::<Secret>::all(client.clone()),
        watcher::Config::default().labels(CERTIFICATE_LIFECYCLE_LABEL),
    )
    .shutdown_on_signal()
    .run(certificate_lifecycle::reconcile, certificate_lifecycle::error_policy, lifecycle_ctx)
    .for_each(|result| async move {
        if let Err(e) = result {
            warn!("certificate lifecycle reconcile failed: {}", e);
        }
    });

    let datastores = Controller::new(Api::<DataStore>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(datastore_controller::reconcile, datastore_controller::error_policy, datastore_ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!("DataStore reconcile failed: {}", e);
            }
        });

    info!("Controllers started");
    tokio::join!(tenants, certificates, datastores);

    info!("Operator shutdown complete");
    Ok(())
}

async fn run_migrate(args: MigrateArgs) -> anyhow::Result<()> {
    let request = args.request()?;

    let client = Client::try_default().await.context("connecting to the management cluster")?;
    let store: ObjectStoreRef = Arc::new(KubeStore::new(client));
    let connections = DriverFactory::new(store.clone());

    let copied = migrate(&store, &connections, &request).await?;
    info!(keys = copied, "migration finished");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,kube=info,sqlx=warn,h2=warn")));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> hangar::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>) -> hangar::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(buffer) => {
                                let mut response = respond(StatusCode::OK, buffer);
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
