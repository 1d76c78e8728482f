use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use admission_dispatch::config::{DispatcherConfig, Overrides, SourceKind, TlsMode};
use admission_dispatch::tls::ServingCertificate;
use admission_dispatch::webhook::{
    AdmissionPipeline, AdmissionServer, ConfigurationStore, DispatchMode,
    FileConfigurationStore, HttpsWebhookCaller, InMemoryConfigurationStore,
    KubeConfigurationStore, KubeNamespaceLabels, NamespaceLabels, SnapshotStore,
    StaticNamespaceLabels,
};
use admission_dispatch::Error;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the admission dispatcher
    Run(RunArgs),
    /// Validate webhook configuration manifests and exit
    Check(CheckArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Settings file (TOML)
    #[arg(long, env = "ADMISSION_CONFIG")]
    config: Option<PathBuf>,

    /// Address the HTTP surface listens on
    #[arg(long, env = "ADMISSION_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,

    /// PEM serving certificate
    #[arg(long, env = "ADMISSION_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the serving certificate
    #[arg(long, env = "ADMISSION_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Serve with an ephemeral self-signed certificate (development only)
    #[arg(long, env = "ADMISSION_SELF_SIGNED")]
    self_signed: bool,

    /// Where webhook configurations are registered: kubernetes, directory or memory
    #[arg(long, env = "ADMISSION_SOURCE")]
    source: Option<SourceKind>,

    /// Manifest directory for the directory source
    #[arg(long, env = "ADMISSION_MANIFEST_DIR")]
    manifest_dir: Option<PathBuf>,

    /// How often the configuration snapshot is refreshed, in milliseconds
    #[arg(long, env = "ADMISSION_REFRESH_INTERVAL_MS")]
    refresh_interval_ms: Option<u64>,

    /// parallel or sequential webhook invocation
    #[arg(long, env = "ADMISSION_DISPATCH_MODE")]
    dispatch_mode: Option<DispatchMode>,

    /// Emit logs as JSON
    #[arg(long, env = "ADMISSION_LOG_JSON")]
    log_json: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen_addr: self.listen_addr,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            self_signed: self.self_signed,
            source: self.source,
            manifest_dir: self.manifest_dir.clone(),
            refresh_interval_ms: self.refresh_interval_ms,
            dispatch_mode: self.dispatch_mode,
            log_json: self.log_json,
        }
    }
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Manifest directory to validate
    #[arg(env = "ADMISSION_MANIFEST_DIR")]
    manifest_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Admission Dispatcher v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Check(check_args) => run_check(check_args).await,
        Commands::Run(run_args) => run_dispatcher(run_args).await,
    }
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
        let otel_layer = admission_dispatch::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

async fn run_check(args: CheckArgs) -> Result<(), Error> {
    let store = FileConfigurationStore::new(&args.manifest_dir);
    let mut entries = tokio::fs::read_dir(&args.manifest_dir).await?;
    let mut failures = 0usize;
    let mut total = 0usize;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_manifest = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if !is_manifest {
            continue;
        }

        let contents = tokio::fs::read_to_string(&path).await?;
        match admission_dispatch::webhook::store::parse_manifest(&path, &contents) {
            Ok(configurations) => {
                for configuration in configurations {
                    total += 1;
                    match configuration.validate() {
                        Ok(()) => println!(
                            "ok      {} ({} webhook(s)) in {}",
                            configuration.name,
                            configuration.webhooks.len(),
                            path.display()
                        ),
                        Err(e) => {
                            failures += 1;
                            println!("invalid {}: {}", path.display(), e);
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                println!("invalid {}: {}", path.display(), e);
            }
        }
    }

    let registered = store.list().await?;
    println!(
        "{} configuration(s) checked, {} loadable, {} problem(s)",
        total,
        registered.len(),
        failures
    );

    if failures > 0 {
        return Err(Error::ConfigError(format!(
            "{failures} invalid manifest(s) in {}",
            args.manifest_dir.display()
        )));
    }
    Ok(())
}

fn static_namespace_labels(config: &DispatcherConfig) -> Arc<dyn NamespaceLabels> {
    if config.namespaces.is_empty() {
        warn!("No namespaces configured; requests in namespaces selected by label are denied");
    } else {
        info!("Serving labels for {} namespace(s)", config.namespaces.len());
    }
    Arc::new(StaticNamespaceLabels::from_table(config.namespaces.clone()))
}

async fn run_dispatcher(args: RunArgs) -> Result<(), Error> {
    let file_config = DispatcherConfig::load_or_default(args.config.as_deref()).await?;
    let config = args.overrides().apply(file_config);
    config.validate()?;

    init_tracing(config.log_json);

    info!(
        "Starting Admission Dispatcher v{} (source: {}, dispatch: {})",
        env!("CARGO_PKG_VERSION"),
        config.source,
        config.dispatch_mode
    );

    let caller = Arc::new(HttpsWebhookCaller::new());

    let (store, namespaces): (Arc<dyn ConfigurationStore>, Arc<dyn NamespaceLabels>) =
        match config.source {
            SourceKind::Kubernetes => {
                let client = kube::Client::try_default()
                    .await
                    .map_err(Error::KubeError)?;
                info!("Connected to Kubernetes cluster");
                (
                    Arc::new(KubeConfigurationStore::new(client.clone())),
                    Arc::new(KubeNamespaceLabels::new(client)),
                )
            }
            SourceKind::Directory => {
                let dir = config.manifest_dir.clone().ok_or_else(|| {
                    Error::ConfigError("the directory source needs manifest_dir".to_string())
                })?;
                info!("Loading webhook configurations from {}", dir.display());
                (
                    Arc::new(FileConfigurationStore::new(dir)),
                    static_namespace_labels(&config),
                )
            }
            SourceKind::Memory => {
                warn!("Webhook configurations are kept in memory and lost on restart");
                (
                    Arc::new(InMemoryConfigurationStore::new()),
                    static_namespace_labels(&config),
                )
            }
        };

    let snapshots = Arc::new(SnapshotStore::new(store));
    if let Err(e) = snapshots.refresh().await {
        warn!("Initial configuration load failed, retrying in background: {}", e);
    }
    let refresher = Arc::clone(&snapshots).spawn_refresh(config.refresh_interval());

    let pipeline = AdmissionPipeline::new(snapshots, caller)
        .with_mode(config.dispatch_mode)
        .with_namespace_labels(namespaces);

    let mut server = AdmissionServer::new(Arc::new(pipeline));
    match config.tls_mode() {
        TlsMode::Files { cert, key } => {
            server = server.with_tls(ServingCertificate::load(&cert, &key).await?);
        }
        TlsMode::SelfSigned(names) => {
            warn!("Serving with a self-signed certificate; do not use in production");
            server = server.with_tls(ServingCertificate::self_signed(names)?);
        }
        TlsMode::Insecure => {}
    }

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received, draining connections");
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        });
    }

    let result = server.serve(config.listen_addr, handle).await;

    refresher.abort();

    // Flush any remaining traces
    admission_dispatch::telemetry::shutdown_telemetry();

    result
}
