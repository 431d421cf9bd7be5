mod runtime;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use pkg_channel::backoff::Backoff;
use pkg_channel::client::Connection;
use pkg_constants::channel::{DEFAULT_NODE_POD_SLOTS, NODE_HEARTBEAT_INTERVAL_SECS};
use pkg_constants::paths::{NODE_ID_FILE, NODE_STATE_DIR_PREFIX};
use pkg_types::config::{NodeConfigFile, load_config_file};
use pkg_types::node::{NodeAllocated, NodeCapacity, NodeStatus, RegisterNodeInput, RuntimeKind};
use pkg_types::protocol::{
    HeartbeatPayload, Inbound, NodeReconnectPayload, NodeRegistered, Payload, PodStatusUpdate,
    DeployAck,
};
use pkg_types::pod::PodStatus;

use runtime::{ProcessRuntime, RunEvent};

#[derive(Parser, Debug)]
#[command(name = "packd-node", about = "packd node agent (runtime host)")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value_t = pkg_constants::paths::DEFAULT_NODE_CONFIG.to_string())]
    config: String,

    /// Control-plane channel endpoint, e.g. ws://10.0.0.1:7100/channel
    #[arg(long)]
    server: Option<String>,

    /// Shared cluster token
    #[arg(long)]
    token: Option<String>,

    /// Node name
    #[arg(long)]
    node_name: Option<String>,

    /// Reconnect attempts before giving up (-1 retries forever)
    #[arg(long)]
    max_reconnect_attempts: Option<i32>,

    /// Log format: 'text' or 'json'
    #[arg(long, default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_format);

    // Load config file (returns defaults if file not found)
    let file_cfg: NodeConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let server = cli
        .server
        .or(file_cfg.server)
        .unwrap_or_else(|| "ws://127.0.0.1:7100/channel".to_string());
    let token = cli
        .token
        .or(file_cfg.token)
        .unwrap_or_else(|| "demo-token-123".to_string());
    let node_name = cli
        .node_name
        .or(file_cfg.node_name)
        .unwrap_or_else(hostname);
    let runtime_kind = file_cfg.runtime.unwrap_or(RuntimeKind::Node);
    let labels = file_cfg.labels.unwrap_or_default();
    let capability_tags = file_cfg.capability_tags.unwrap_or_default();
    let max_reconnect_attempts = cli
        .max_reconnect_attempts
        .or(file_cfg.max_reconnect_attempts)
        .unwrap_or(-1);

    if runtime_kind != RuntimeKind::Node {
        anyhow::bail!("this agent hosts the node runtime; browser hosts attach on their own");
    }

    let state_dir = PathBuf::from(format!("{NODE_STATE_DIR_PREFIX}{node_name}"));
    tokio::fs::create_dir_all(&state_dir).await?;

    // Detect real machine resources to report as allocatable capacity.
    let allocatable = {
        use sysinfo::System;
        let mut sys = System::new_all();
        sys.refresh_all();
        let cpu_millis = (sys.cpus().len() as u64) * 1000;
        let memory_bytes = sys.total_memory();
        info!(
            "Detected machine capacity: {} vCPU ({} millicores), {:.1} GiB RAM",
            sys.cpus().len(),
            cpu_millis,
            memory_bytes as f64 / 1_073_741_824.0
        );
        NodeCapacity {
            cpu_millis,
            memory_bytes,
            pods: DEFAULT_NODE_POD_SLOTS,
            storage_bytes: 0,
        }
    };

    info!("Starting packd-node for node: {}", node_name);
    let (pack_runtime, events) =
        ProcessRuntime::new(state_dir.join("packs"), "node".to_string());
    let pack_runtime = Arc::new(pack_runtime);

    let register = RegisterNodeInput {
        name: node_name.clone(),
        runtime_kind,
        capability_tags,
        allocatable,
        labels,
        taints: vec![],
    };

    let agent = Agent {
        server,
        token,
        state_dir,
        register,
        runtime: pack_runtime.clone(),
    };

    tokio::select! {
        outcome = agent.run(max_reconnect_attempts, events) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down agent");
            pack_runtime.stop_all();
            Ok(())
        }
    }
}

struct Agent {
    server: String,
    token: String,
    state_dir: PathBuf,
    register: RegisterNodeInput,
    runtime: Arc<ProcessRuntime>,
}

impl Agent {
    /// Connect, (re)register, serve; reconnect with capped backoff until
    /// the attempt budget runs out.
    async fn run(
        &self,
        max_reconnect_attempts: i32,
        mut events: mpsc::Receiver<RunEvent>,
    ) -> anyhow::Result<()> {
        let mut backoff = Backoff::reconnect(max_reconnect_attempts);
        loop {
            match Connection::connect(&self.server, &self.token).await {
                Ok((conn, inbound)) => {
                    backoff.reset();
                    let conn = Arc::new(conn);
                    match self.attach(&conn).await {
                        Ok(node_id) => {
                            info!(%node_id, "attached to control plane");
                            self.serve(conn, inbound, node_id, &mut events).await;
                            warn!("channel closed, reconnecting");
                        }
                        Err(e) => error!(error = %e, "registration failed"),
                    }
                }
                Err(e) => warn!(error = %e, "connect failed"),
            }
            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    anyhow::bail!(
                        "gave up after {} reconnect attempts",
                        backoff.attempts()
                    );
                }
            }
        }
    }

    /// `node:reconnect` with the saved id when we have one, falling back to
    /// a fresh `node:register`.
    async fn attach(&self, conn: &Connection) -> anyhow::Result<Uuid> {
        if let Some(node_id) = self.saved_node_id().await {
            match conn
                .request_default(Payload::NodeReconnect(NodeReconnectPayload { node_id }))
                .await
            {
                // The ack comes back under the request's own type.
                Ok(Payload::NodeReconnect(NodeReconnectPayload { node_id })) => {
                    return Ok(node_id);
                }
                Ok(other) => warn!(kind = %other.kind(), "unexpected reconnect response"),
                Err(e) => warn!(error = %e, "reconnect refused, registering fresh"),
            }
        }
        match conn
            .request_default(Payload::NodeRegister(self.register.clone()))
            .await?
        {
            Payload::NodeRegistered(NodeRegistered { node_id }) => {
                self.save_node_id(node_id).await;
                Ok(node_id)
            }
            other => anyhow::bail!("unexpected register response {}", other.kind()),
        }
    }

    /// One attached session: heartbeats out, commands in, run events up.
    async fn serve(
        &self,
        conn: Arc<Connection>,
        mut inbound: mpsc::Receiver<Inbound>,
        node_id: Uuid,
        events: &mut mpsc::Receiver<RunEvent>,
    ) {
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(NODE_HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let hb = Payload::NodeHeartbeat(HeartbeatPayload {
                        node_id,
                        status: NodeStatus::Online,
                        allocated: NodeAllocated {
                            cpu_millis: 0,
                            memory_bytes: 0,
                            pods: self.runtime.running(),
                        },
                        timestamp: chrono::Utc::now(),
                    });
                    if conn.send(hb).is_err() {
                        return;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { return };
                    let _ = conn.send(Payload::PodStatusUpdate(status_update_for(event)));
                }
                frame = inbound.recv() => {
                    let Some(frame) = frame else { return };
                    self.handle_frame(&conn, frame).await;
                }
            }
        }
    }

    async fn handle_frame(&self, conn: &Arc<Connection>, frame: Inbound) {
        match frame.payload {
            Payload::PodDeploy(deploy) => {
                if let Some(id) = frame.correlation_id.as_deref() {
                    let _ = conn.reply(
                        Payload::PodDeployAck(DeployAck {
                            pod_id: deploy.pod_id,
                        }),
                        id,
                    );
                }
                let _ = conn.send(Payload::PodStatusUpdate(PodStatusUpdate {
                    pod_id: deploy.pod_id,
                    status: PodStatus::Starting,
                    message: None,
                    reason: None,
                }));
                if let Err(e) = self.runtime.launch(&deploy).await {
                    error!(pod = %deploy.pod_id, error = %e, "launch failed");
                    let _ = conn.send(Payload::PodStatusUpdate(PodStatusUpdate {
                        pod_id: deploy.pod_id,
                        status: PodStatus::Failed,
                        message: Some(e.to_string()),
                        reason: Some("LAUNCH_FAILED".into()),
                    }));
                }
            }
            Payload::PodStop(stop) => {
                info!(pod = %stop.pod_id, reason = %stop.reason, graceful = stop.graceful, "stop requested");
                if !self.runtime.stop(stop.pod_id, stop.graceful) {
                    // Nothing running locally; report it stopped so the
                    // control plane converges anyway.
                    let _ = conn.send(Payload::PodStatusUpdate(PodStatusUpdate {
                        pod_id: stop.pod_id,
                        status: PodStatus::Stopped,
                        message: Some(format!("not running on this node: {}", stop.reason)),
                        reason: Some(stop.reason),
                    }));
                }
            }
            other => {
                tracing::debug!(kind = %other.kind(), "frame ignored");
            }
        }
    }

    async fn saved_node_id(&self) -> Option<Uuid> {
        let path = self.state_dir.join(NODE_ID_FILE);
        let content = tokio::fs::read_to_string(path).await.ok()?;
        content.trim().parse().ok()
    }

    async fn save_node_id(&self, node_id: Uuid) {
        let path = self.state_dir.join(NODE_ID_FILE);
        if let Err(e) = tokio::fs::write(&path, node_id.to_string()).await {
            warn!(error = %e, "node id not persisted; reconnect will re-register");
        }
    }
}

/// Map a runtime event onto the wire status the control plane expects.
fn status_update_for(event: RunEvent) -> PodStatusUpdate {
    match event {
        RunEvent::Started { pod_id, .. } => PodStatusUpdate {
            pod_id,
            status: PodStatus::Running,
            message: None,
            reason: None,
        },
        RunEvent::Exited { pod_id, code: Some(0) } => PodStatusUpdate {
            pod_id,
            status: PodStatus::Stopped,
            message: Some("exit 0".into()),
            reason: None,
        },
        RunEvent::Exited { pod_id, code } => PodStatusUpdate {
            pod_id,
            status: PodStatus::Failed,
            message: Some(match code {
                Some(code) => format!("exit {code}"),
                None => "killed by signal".to_string(),
            }),
            reason: Some("EXITED".into()),
        },
        RunEvent::Stopped { pod_id } => PodStatusUpdate {
            pod_id,
            status: PodStatus::Stopped,
            message: Some("stopped on request".into()),
            reason: None,
        },
        RunEvent::Failed { pod_id, reason } => PodStatusUpdate {
            pod_id,
            status: PodStatus::Failed,
            message: Some(reason.clone()),
            reason: Some(reason),
        },
    }
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

/// Get the system hostname, fallback to "node-1".
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "node-1".to_string())
}
