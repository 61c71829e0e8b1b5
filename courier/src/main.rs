use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http::Method;
use std::sync::Arc;
use tracing::{error, info, warn};

use courier_cluster::discovery::{DiscoveryClientConfig, RegistryConfig};
use courier_cluster::rpc::ReqwestTransport;
use courier_cluster::{
    HealthCheckSpec, HealthMonitor, RequestOptions, ServiceClients, ServiceDiscoveryClient, ServiceRegistry,
};
use courier_core::{
    bootstrap::{init_database, load_config},
    logging, Config, MemoryRegistrationStore, PgRegistrationStore, RegistrationStore, ServiceDescriptor,
    ServiceQuery, ServiceStatus,
};

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Service registry and resilient inter-service client", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, global = true, env = "COURIER_CONFIG_PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register this process and keep it alive until Ctrl-C
    Serve,
    /// Print registered instances as JSON
    Discover {
        /// Only instances of this service
        #[arg(long)]
        name: Option<String>,
        /// Only instances carrying this tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Issue one request to a target service and print the response
    Call {
        target: String,
        path: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
}

/// Everything the subcommands share
struct Runtime {
    registry: Arc<ServiceRegistry>,
    discovery: Arc<ServiceDiscoveryClient>,
    transport: Arc<ReqwestTransport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(service = %config.service.name, "Courier starting...");

    // 3. Registry store, then the discovery stack on top of it
    let store = init_store(&config).await?;
    let runtime = build_runtime(&config, store).await?;

    let result = match args.command {
        Command::Serve => serve(&config, &runtime).await,
        Command::Discover { name, tags } => discover(&runtime, name, tags).await,
        Command::Call {
            target,
            path,
            method,
            body,
        } => call(&config, &runtime, &target, &path, &method, body.as_deref()).await,
    };

    runtime.registry.shutdown();
    result
}

async fn init_store(config: &Config) -> Result<Arc<dyn RegistrationStore>> {
    if config.database.url.is_empty() {
        warn!("database.url not set, registrations live in memory only");
        return Ok(Arc::new(MemoryRegistrationStore::new()));
    }

    let pool = init_database(&config.database).await?;

    info!("Running database migrations...");
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            anyhow::anyhow!("Migration failed: {e}")
        })?;
    info!("Migrations completed");

    Ok(Arc::new(PgRegistrationStore::new(pool)))
}

async fn build_runtime(config: &Config, store: Arc<dyn RegistrationStore>) -> Result<Runtime> {
    let registry = Arc::new(ServiceRegistry::new(store, RegistryConfig::from(&config.registry)).await);
    let transport = Arc::new(ReqwestTransport::new().context("Failed to build HTTP transport")?);
    let monitor = Arc::new(HealthMonitor::new(transport.clone()));
    let discovery = Arc::new(ServiceDiscoveryClient::new(
        Arc::clone(&registry),
        monitor,
        DiscoveryClientConfig::from(&config.discovery),
    ));

    Ok(Runtime {
        registry,
        discovery,
        transport,
    })
}

fn self_descriptor(config: &Config) -> ServiceDescriptor {
    let service = &config.service;
    let mut descriptor = ServiceDescriptor::new(&service.name, &service.host, service.port)
        .with_version(&service.version)
        .with_protocol(&service.protocol)
        .with_status(ServiceStatus::Healthy);
    descriptor.endpoints.clone_from(&service.endpoints);
    descriptor.tags.clone_from(&service.tags);
    descriptor.metadata.clone_from(&service.metadata);

    if let Some(node) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
        descriptor.metadata.entry("hostname".to_string()).or_insert(node);
    }
    descriptor
}

async fn serve(config: &Config, runtime: &Runtime) -> Result<()> {
    let cleanup = runtime.registry.start_cleanup();

    let health_check = config.service.health_endpoint.as_ref().map(|endpoint| {
        HealthCheckSpec::from_config(
            format!("{}{endpoint}", config.service_address()),
            &config.discovery,
        )
    });
    let id = runtime
        .discovery
        .register_service(self_descriptor(config), health_check)
        .await?;
    info!(service_id = %id, address = %config.service_address(), "Registered, waiting for Ctrl-C");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    runtime.discovery.shutdown().await;
    runtime.registry.shutdown();
    if let Err(e) = cleanup.await {
        warn!(error = %e, "Registry cleanup task ended abnormally");
    }
    info!("Courier stopped");
    Ok(())
}

async fn discover(runtime: &Runtime, name: Option<String>, tags: Vec<String>) -> Result<()> {
    let mut query = name.map_or_else(ServiceQuery::all, ServiceQuery::by_name);
    for tag in tags {
        query = query.with_tag(tag);
    }

    let services = runtime.discovery.discover_services(&query).await;
    println!("{}", serde_json::to_string_pretty(&services)?);
    Ok(())
}

async fn call(
    config: &Config,
    runtime: &Runtime,
    target: &str,
    path: &str,
    method: &str,
    body: Option<&str>,
) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {method}"))?;
    let mut options = RequestOptions::new();
    if let Some(body) = body {
        options = options.with_json(serde_json::from_str(body).context("--body must be valid JSON")?);
    }

    let clients = ServiceClients::new(
        Arc::clone(&runtime.discovery),
        runtime.transport.clone(),
        config.client.clone(),
    );
    let client = clients.client(target).await?;
    let outcome = client.request(method, path, options).await;
    let metrics = client.get_metrics();
    clients.shutdown().await;

    match outcome {
        Ok(response) => {
            let report = serde_json::json!({ "response": response, "metrics": metrics });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            let report = serde_json::json!({ "error": e, "metrics": metrics });
            eprintln!("{}", serde_json::to_string_pretty(&report)?);
            Err(e.into())
        }
    }
}
