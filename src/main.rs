use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Parser, Subcommand};
use extension_controller::controller::{
    self, BackoffConfig, ControllerArgs, NoopActuator, DEFAULT_MAX_CONCURRENT_RECONCILES,
};
use extension_controller::crd::{Cluster, Extension, ExtensionClass};
use extension_controller::Error;
use futures::future::try_join_all;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the extensions and clusters visible to the operator
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Extension types to run a controller for (comma separated)
    #[arg(long = "extension-type", env = "EXTENSION_TYPES", value_delimiter = ',', required = true)]
    extension_types: Vec<String>,

    /// Extension class handled by the controllers ("any" accepts every class)
    #[arg(long, env = "EXTENSION_CLASS", default_value = "shoot")]
    extension_class: String,

    /// Controller name; only valid with a single extension type
    #[arg(long, env = "CONTROLLER_NAME")]
    controller_name: Option<String>,

    /// Finalizer suffix; only valid with a single extension type
    #[arg(long, env = "FINALIZER_SUFFIX")]
    finalizer_suffix: Option<String>,

    /// Seconds between full resyncs
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 60)]
    resync_seconds: u64,

    /// Concurrent reconciles per controller
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = DEFAULT_MAX_CONCURRENT_RECONCILES)]
    max_concurrent_reconciles: usize,

    /// Reconcile on every spec and cluster change instead of waiting for the operation annotation
    #[arg(long, env = "IGNORE_OPERATION_ANNOTATION")]
    ignore_operation_annotation: bool,

    /// Deadline for one reconcile attempt in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECONDS", default_value_t = 180)]
    reconcile_timeout_seconds: u64,

    /// First retry delay in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 1000)]
    backoff_base_ms: u64,

    /// Retry delay cap in seconds
    #[arg(long, env = "BACKOFF_MAX_SECONDS", default_value_t = 300)]
    backoff_max_seconds: u64,

    /// Random spread added to each retry delay, as a fraction of the delay
    #[arg(long, env = "BACKOFF_JITTER", default_value_t = 0.1)]
    backoff_jitter: f64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Namespace holding the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Address of the health and metrics server
    #[cfg(feature = "rest-api")]
    #[arg(long, env = "API_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    api_bind_address: std::net::SocketAddr,
}

impl RunArgs {
    fn extension_class(&self) -> Result<Option<ExtensionClass>, Error> {
        match self.extension_class.as_str() {
            "" | "any" => Ok(None),
            class => class.parse().map(Some).map_err(Error::ConfigError),
        }
    }

    fn controller_args(&self, extension_type: &str) -> Result<ControllerArgs<NoopActuator>, Error> {
        let single = self.extension_types.len() == 1;
        if !single && (self.controller_name.is_some() || self.finalizer_suffix.is_some()) {
            return Err(Error::ConfigError(
                "--controller-name and --finalizer-suffix require exactly one extension type"
                    .to_string(),
            ));
        }

        let mut args = ControllerArgs::new(extension_type, NoopActuator);
        if let Some(name) = &self.controller_name {
            args.name = name.clone();
        }
        if let Some(suffix) = &self.finalizer_suffix {
            args.finalizer_suffix = suffix.clone();
        }
        args.extension_class = self.extension_class()?;
        args.resync = Duration::from_secs(self.resync_seconds);
        args.max_concurrent_reconciles = self.max_concurrent_reconciles;
        args.ignore_operation_annotation = self.ignore_operation_annotation;
        args.reconcile_timeout = Duration::from_secs(self.reconcile_timeout_seconds);
        args.backoff = BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_secs(self.backoff_max_seconds),
            jitter: self.backoff_jitter,
        };
        args.validate()?;
        Ok(args)
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Only list extensions in this namespace
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Extension Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;

    let extensions: Api<Extension> = match &args.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let extensions = extensions.list(&Default::default()).await?;
    let clusters = Api::<Cluster>::all(client).list(&Default::default()).await?;

    println!("Clusters: {}", clusters.items.len());
    println!("Extensions: {}", extensions.items.len());
    for ext in &extensions.items {
        let state = ext
            .last_operation()
            .map(|op| format!("{} {:?}", op.type_, op.state))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}/{} type={} class={} last-operation={}",
            ext.metadata.namespace.as_deref().unwrap_or_default(),
            ext.metadata.name.as_deref().unwrap_or_default(),
            ext.spec.type_,
            ext.class(),
            state
        );
    }
    Ok(())
}

fn init_tracing(log_json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(log_json.then(|| fmt::layer().json().with_target(true)))
        .with((!log_json).then(|| fmt::layer().with_target(true)));

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        let otel_layer = extension_controller::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);
    info!("Starting Extension Operator v{}", env!("CARGO_PKG_VERSION"));

    // Fail on bad flags before touching the cluster
    let controller_args = args
        .extension_types
        .iter()
        .map(|t| args.controller_args(t))
        .collect::<Result<Vec<_>, _>>()?;

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });
    info!("Leader election using holder ID: {}", holder_identity);

    let (leader_tx, mut leader_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let leases: Api<Lease> = Api::namespaced(client.clone(), &args.namespace);
        let namespace = args.namespace.clone();
        tokio::spawn(async move {
            run_leader_election(leases, namespace, holder_identity, leader_tx).await;
        });
    }

    #[cfg(feature = "rest-api")]
    {
        use extension_controller::rest_api::{run_server, ApiState};

        let state = ApiState {
            leader: leader_rx.clone(),
        };
        let addr = args.api_bind_address;
        let server_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(addr, state, server_shutdown).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    info!("Waiting for leadership");
    tokio::select! {
        acquired = leader_rx.wait_for(|leader| *leader) => {
            if acquired.is_err() {
                return Err(Error::ConfigError("leader election stopped".to_string()));
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before acquiring leadership");
            extension_controller::telemetry::shutdown_telemetry();
            return Ok(());
        }
    }

    let controllers = try_join_all(
        controller_args
            .into_iter()
            .map(|a| controller::run_controller(client.clone(), a, shutdown_rx.clone())),
    );
    tokio::pin!(controllers);

    let result = tokio::select! {
        res = &mut controllers => res.map(|_| ()),
        reason = shutdown_signal(leader_rx) => {
            info!("Shutting down: {}", reason);
            let _ = shutdown_tx.send(true);
            controllers.await.map(|_| ())
        }
    };

    // Flush any remaining traces
    extension_controller::telemetry::shutdown_telemetry();

    result
}

/// Resolves on Ctrl-C or when this replica stops being the leader
async fn shutdown_signal(mut leader: watch::Receiver<bool>) -> &'static str {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "interrupted",
        _ = leader.wait_for(|leader| !*leader) => "lost leadership",
    }
}

const LEASE_NAME: &str = "extension-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const LEASE_DURATION: Duration = Duration::from_secs(LEASE_DURATION_SECS as u64);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leadership as seen from this replica
///
/// A failed renew keeps leadership until the last successful renew is a
/// full lease duration old, after which another replica may take over.
#[derive(Debug, Default)]
struct LeaderTracker {
    last_renewed: Option<Instant>,
}

impl LeaderTracker {
    /// Fold in one attempt sent at `started`; returns whether we still lead at `now`
    fn observe<E>(&mut self, attempt: &Result<bool, E>, started: Instant, now: Instant) -> bool {
        match attempt {
            Ok(true) => {
                // the server's renew time is never earlier than the send time
                self.last_renewed = Some(started);
                true
            }
            Ok(false) => {
                self.last_renewed = None;
                false
            }
            Err(_) => {
                let valid = self
                    .last_renewed
                    .is_some_and(|renewed| now.saturating_duration_since(renewed) < LEASE_DURATION);
                if !valid {
                    self.last_renewed = None;
                }
                valid
            }
        }
    }
}

async fn run_leader_election(
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    leader: watch::Sender<bool>,
) {
    let mut tracker = LeaderTracker::default();
    loop {
        let was_leader = *leader.borrow();
        let started = Instant::now();
        let attempt = try_acquire_or_renew(&leases, &namespace, &identity).await;
        if let Err(e) = &attempt {
            warn!("Leader election error: {:?}", e);
        }
        let is_leader = tracker.observe(&attempt, started, Instant::now());

        match (was_leader, is_leader) {
            (false, true) => info!("Acquired leadership for lease {}", LEASE_NAME),
            (true, false) => warn!("Lost leadership for lease {}", LEASE_NAME),
            _ => {}
        }
        leader.send_replace(is_leader);

        let wait = if is_leader && attempt.is_ok() {
            RENEW_INTERVAL
        } else {
            RETRY_INTERVAL
        };
        tokio::time::sleep(wait).await;
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        leases.create(&PostParams::default(), &lease).await?;
        info!("Created lease {} with holder {}", LEASE_NAME, identity);
        return Ok(true);
    };

    let spec = existing.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());

    let patch = if holder == Some(identity) {
        serde_json::json!({
            "metadata": { "resourceVersion": existing.metadata.resource_version },
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        })
    } else {
        let expired = spec
            .and_then(|s| s.renew_time.as_ref())
            .map(|renew| {
                let duration = spec
                    .and_then(|s| s.lease_duration_seconds)
                    .unwrap_or(LEASE_DURATION_SECS);
                now > renew.0 + chrono::Duration::seconds(i64::from(duration))
            })
            .unwrap_or(true);
        if !expired {
            return Ok(false);
        }
        info!("Lease held by {:?} has expired, taking over", holder);
        serde_json::json!({
            "metadata": { "resourceVersion": existing.metadata.resource_version },
            "spec": {
                "holderIdentity": identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        })
    };

    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        // another replica renewed or took over first
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}
