//! Control-plane assembly: build every subsystem, serve the admin API and
//! the message channel on one listener, and tear down in reverse
//! dependency order (reconciler → controllers → scheduler → gateway →
//! store) so in-flight work drains before its dependencies vanish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{delete, get, post, put},
};
use tokio::net::TcpListener;
use tracing::info;

use pkg_bundle::{BundleResolver, HttpTransport};
use pkg_constants::network::CHANNEL_PATH;
use pkg_controllers::{DeploymentReconciler, EvictionController, NodeHealthController};
use pkg_gateway::auth::StaticTokenVerifier;
use pkg_gateway::{Gateway, GatewayConfig};
use pkg_metrics::MetricsRegistry;
use pkg_scheduler::{PlacementPolicy, Scheduler, SchedulerConfig};
use pkg_state::StateStore;
use pkg_state::record::{MemoryRecordStore, RecordStore, SlateRecordStore};

use crate::handlers::{cluster, namespaces, nodes, packs, pods, services};
use crate::{AppState, auth};

/// Server configuration passed from the binary's CLI.
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Record-store directory; `None` keeps the cluster ephemeral.
    pub data_dir: Option<String>,
    pub token: String,
    pub placement: PlacementPolicy,
    pub preemption: bool,
    pub reconcile_interval: Duration,
}

pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let record: Arc<dyn RecordStore> = match &config.data_dir {
        Some(dir) => Arc::new(SlateRecordStore::open(dir).await?),
        None => Arc::new(MemoryRecordStore::new()),
    };
    let store = Arc::new(StateStore::new(record));
    store.load().await?;

    let metrics = Arc::new(MetricsRegistry::with_well_known());
    let gateway = Gateway::new(
        store.clone(),
        Arc::new(StaticTokenVerifier::new(config.token.clone())),
        GatewayConfig::default(),
        metrics.clone(),
    );
    let scheduler = Scheduler::new(
        store.clone(),
        gateway.clone(),
        SchedulerConfig {
            policy: config.placement,
            preemption: config.preemption,
        },
        metrics.clone(),
    );
    let bundles = BundleResolver::new(Arc::new(HttpTransport::new()), metrics.clone());
    let node_health = NodeHealthController::new(store.clone());
    let eviction = EvictionController::new(store.clone(), gateway.clone());
    let reconciler = DeploymentReconciler::with_interval(
        store.clone(),
        scheduler.clone(),
        gateway.clone(),
        bundles.clone(),
        metrics.clone(),
        config.reconcile_interval,
    );

    let gateway_task = gateway.start();
    let scheduler_task = scheduler.start();
    let node_health_task = node_health.start();
    let eviction_task = eviction.start();
    let reconciler_task = reconciler.start();

    let state = AppState {
        store: store.clone(),
        gateway: gateway.clone(),
        scheduler: scheduler.clone(),
        metrics,
        admin_token: config.token,
    };

    let admin = Router::new()
        .route(
            "/api/v1/packs",
            post(packs::register_pack).get(packs::list_packs),
        )
        .route("/api/v1/packs/{id}", delete(packs::delete_pack))
        .route(
            "/api/v1/packs/{id}/metadata",
            put(packs::update_pack_metadata),
        )
        .route(
            "/api/v1/services",
            post(services::create_service).get(services::list_services),
        )
        .route(
            "/api/v1/services/{id}",
            get(services::get_service).delete(services::delete_service),
        )
        .route("/api/v1/services/{id}/scale", put(services::scale_service))
        .route(
            "/api/v1/services/{id}/version",
            put(services::update_service_version),
        )
        .route("/api/v1/pods", post(pods::create_pod).get(pods::list_pods))
        .route("/api/v1/pods/{id}", get(pods::get_pod))
        .route("/api/v1/pods/{id}/history", get(pods::pod_history))
        .route("/api/v1/pods/{id}/rollback", post(pods::rollback_pod))
        .route("/api/v1/nodes", get(nodes::list_nodes))
        .route("/api/v1/nodes/{id}", delete(nodes::delete_node))
        .route("/api/v1/nodes/{id}/drain", post(nodes::drain_node))
        .route("/api/v1/nodes/{id}/uncordon", post(nodes::uncordon_node))
        .route(
            "/api/v1/namespaces",
            post(namespaces::create_namespace).get(namespaces::list_namespaces),
        )
        .route(
            "/api/v1/namespaces/{name}",
            delete(namespaces::delete_namespace),
        )
        .route(
            "/api/v1/priorityclasses",
            put(namespaces::set_priority_class).get(namespaces::list_priority_classes),
        )
        .route("/api/v1/cluster/info", get(cluster::cluster_info))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .with_state(state.clone());

    let public = Router::new()
        .route("/healthz", get(cluster::healthz))
        .route("/metrics", get(cluster::metrics))
        .with_state(state);

    let channel = Router::new()
        .route(CHANNEL_PATH, get(pkg_gateway::ws_handler))
        .with_state(gateway.clone());

    let app = channel.merge(public).merge(admin);

    info!("control plane listening on {}", config.addr);
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    reconciler.stop();
    eviction.stop();
    node_health.stop();
    scheduler.stop();
    gateway.stop();
    for task in [
        reconciler_task,
        eviction_task,
        node_health_task,
        scheduler_task,
        gateway_task,
    ] {
        let _ = task.await;
    }
    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    // Listen for both SIGINT (Ctrl+C) and SIGTERM (supervisors).
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
    }
}
