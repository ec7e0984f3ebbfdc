//! kubetask - run scheduler tasks on Kubernetes
//!
//! Local driver for the execution engine and queue admission manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use kubetask_common::client::FileKubeconfigResolver;
use kubetask_common::config::OsEnv;
use kubetask_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kubetask_common::{CachedClientProvider, ClusterClientProvider, CrdRegistry, EngineConfig, TaskType};
use kubetask_job::{Engine, ExecutionRequest, LiveInstanceSet};
use kubetask_queue::{
    InMemoryQueueRepository, InMemoryQueuedTaskRepository, KubeQueueOps, NewQueue, QueueManager,
    QueueSettings,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// kubetask - Kubernetes task execution and queue admission
#[derive(Parser, Debug)]
#[command(name = "kubetask", version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (YAML)
    #[arg(long, env = "KUBETASK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log line format
    #[arg(long, env = "KUBETASK_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Text, global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the manifests a request compiles to
    Compile(RequestArgs),
    /// Submit a request and wait for its outcome
    ///
    /// Ctrl-C resolves the run as KILLED and deletes what was submitted.
    Run(RequestArgs),
    /// Delete every object a request may have created
    Cancel(RequestArgs),
    /// Queue admission
    #[command(subcommand)]
    Queue(QueueCommands),
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    /// Execution request file (YAML or JSON)
    #[arg(long, short)]
    request: PathBuf,

    /// Scheduler task type selecting the workload shape
    #[arg(long)]
    task_type: Option<TaskType>,
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Create a queue and its Volcano queue
    Create {
        /// Queue request file (YAML or JSON)
        #[arg(long, short)]
        file: PathBuf,
    },
    /// Print the Volcano queue a request renders to
    Render {
        #[arg(long, short)]
        file: PathBuf,
    },
    /// List the GPU resource keys capabilities may use
    GpuTypes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..Default::default()
    })?;

    let config = EngineConfig::load(cli.config.as_deref(), &OsEnv)?;
    let provider: Arc<dyn ClusterClientProvider> = Arc::new(CachedClientProvider::new(
        Arc::new(FileKubeconfigResolver::new(config.kubeconfigs.clone())),
        config.connect_timeout(),
        config.read_timeout(),
    ));

    match cli.command {
        Commands::Compile(args) => {
            let req = load_request(&args, &config)?;
            let engine = Engine::from_config(&config, provider, Arc::new(LiveInstanceSet::new()))?;
            for manifest in engine.compile(&req)? {
                println!("---\n{}", manifest.to_yaml()?);
            }
        }
        Commands::Run(args) => {
            let req = load_request(&args, &config)?;
            let code = run(&config, provider, req).await?;
            std::process::exit(code);
        }
        Commands::Cancel(args) => {
            let req = load_request(&args, &config)?;
            let engine = Engine::from_config(&config, provider, Arc::new(LiveInstanceSet::new()))?;
            engine.cancel(&req).await?;
            info!(task_instance_id = req.task_instance_id, "Cancelled");
        }
        Commands::Queue(command) => queue(&config, provider, command).await?,
    }
    Ok(())
}

async fn run(
    config: &EngineConfig,
    provider: Arc<dyn ClusterClientProvider>,
    req: ExecutionRequest,
) -> anyhow::Result<i32> {
    let live = Arc::new(LiveInstanceSet::new());
    live.insert(req.task_instance_id);
    let engine = Engine::from_config(config, provider, live.clone())?;

    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, killing task");
            on_signal.cancel();
        }
    });

    let result = engine.run(&req, token.clone()).await;
    if token.is_cancelled() || result.is_err() {
        if let Err(e) = engine.cancel(&req).await {
            warn!(error = %e, "Cleanup failed");
        }
    }
    live.remove(req.task_instance_id);

    let outcome = result?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.exit_code())
}

async fn queue(
    config: &EngineConfig,
    provider: Arc<dyn ClusterClientProvider>,
    command: QueueCommands,
) -> anyhow::Result<()> {
    let crds = Arc::new(CrdRegistry::with_overrides(&config.api_version_overrides));
    let manager = QueueManager::new(
        Arc::new(InMemoryQueueRepository::new()),
        Arc::new(InMemoryQueuedTaskRepository::new()),
        Arc::new(KubeQueueOps::new(provider, crds)),
        QueueSettings::from(config),
    );

    match command {
        QueueCommands::Create { file } => {
            let request: NewQueue = load(&file)?;
            let queue = manager.create(request).await?;
            println!("{}", serde_json::to_string_pretty(&queue)?);
        }
        QueueCommands::Render { file } => {
            let request: NewQueue = load(&file)?;
            let queue = manager
                .create(NewQueue {
                    cluster: config.local_test_cluster_code.clone(),
                    ..request
                })
                .await?;
            println!("{}", serde_yaml::to_string(&manager.manifest(&queue))?);
        }
        QueueCommands::GpuTypes => {
            for gpu in manager.gpu_types() {
                println!("{}", gpu);
            }
        }
    }
    Ok(())
}

fn load_request(args: &RequestArgs, config: &EngineConfig) -> anyhow::Result<ExecutionRequest> {
    let req: ExecutionRequest = load(&args.request)?;
    let req = match args.task_type {
        Some(task_type) => req.for_task_type(task_type, config.queue_enabled)?,
        None => {
            req.validate()?;
            req
        }
    };
    Ok(req)
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
