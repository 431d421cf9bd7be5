use clap::Parser;
use pkg_api::server::{ServerConfig, start_server};
use pkg_scheduler::PlacementPolicy;
use pkg_types::config::{ServerConfigFile, load_config_file};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "packd-server", about = "packd control plane server")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value_t = pkg_constants::paths::DEFAULT_SERVER_CONFIG.to_string())]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for record-store persistence (omit for an ephemeral cluster)
    #[arg(long)]
    data_dir: Option<String>,

    /// Shared cluster token for node registration and the admin API
    #[arg(long)]
    token: Option<String>,

    /// Placement policy: 'spread' or 'binpack'
    #[arg(long)]
    placement: Option<PlacementPolicy>,

    /// Allow the scheduler to evict lower-priority pods for room
    #[arg(long)]
    preemption: Option<bool>,

    /// Reconcile pass cadence in seconds
    #[arg(long)]
    reconcile_interval_secs: Option<u64>,

    /// Log format: 'text' or 'json'
    #[arg(long, default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_format);

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let port = cli
        .port
        .or(file_cfg.port)
        .unwrap_or(pkg_constants::network::DEFAULT_SERVER_PORT);
    let data_dir = cli.data_dir.or(file_cfg.data_dir);
    let token = cli
        .token
        .or(file_cfg.token)
        .unwrap_or_else(|| "demo-token-123".to_string());
    let placement = match cli.placement {
        Some(policy) => policy,
        None => file_cfg
            .placement
            .as_deref()
            .map(|s| s.parse())
            .transpose()
            .map_err(|e: String| anyhow::anyhow!(e))?
            .unwrap_or_default(),
    };
    let preemption = cli.preemption.or(file_cfg.preemption).unwrap_or(false);
    let reconcile_interval_secs = cli
        .reconcile_interval_secs
        .or(file_cfg.reconcile_interval_secs)
        .unwrap_or(pkg_constants::scheduling::RECONCILE_INTERVAL_SECS);

    info!("Starting packd-server");
    info!("  Port:       {}", port);
    match &data_dir {
        Some(dir) => info!("  Data dir:   {}", dir),
        None => info!("  Data dir:   (ephemeral)"),
    }
    info!("  Token:      {}***", &token[..token.len().min(4)]);
    info!("  Placement:  {:?}", placement);
    info!("  Preemption: {}", preemption);

    let config = ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        data_dir,
        token,
        placement,
        preemption,
        reconcile_interval: Duration::from_secs(reconcile_interval_secs),
    };

    start_server(config).await
}

/// Standard tracing initialization (text or json).
fn init_tracing(log_format: &str) {
    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
                )
                .init();
        }
        _ => {
            tracing_subscriber::fmt::init();
        }
    }
}
