//! Signal Controller
//!
//! Peer signaling server and session coordinator for a clustered media relay.
//!
//! # Servers
//!
//! - Framed TCP listener for peer signaling (default: 0.0.0.0:8443)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the service registry and message bus to Redis
//! 4. Optionally start an embedded location registry service
//! 5. Register this node and start the coordinator
//! 6. Start health HTTP server and the signaling listener
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use common::secret::ExposeSecret;
use location_registry::{LocationRegistry, LocationService, RedisLocationStore};
use message_bus::{MessageBus, RedisBus};
use service_registry::backend::RedisDiscovery;
use service_registry::{service, Node, NodeRegistration, ServiceRegistry};
use signal_controller::config::Config;
use signal_controller::observability::metrics::init_metrics_recorder;
use signal_controller::observability::{health_router, HealthState};
use signal_controller::transport::{run_listener, DEFAULT_MAILBOX_CAPACITY};
use signal_controller::{Coordinator, CoordinatorSettings};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to in-flight work after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "signal_controller=debug,location_registry=info,service_registry=info,message_bus=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Signal Controller");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        node_id = %config.node_id,
        region = %config.region,
        signal_bind_address = %config.signal_bind_address,
        health_bind_address = %config.health_bind_address,
        reconcile_interval_seconds = config.reconcile_interval.as_secs(),
        rpc_timeout_ms = u64::try_from(config.rpc_timeout.as_millis()).unwrap_or(u64::MAX),
        embed_location_service = config.embed_location_service,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    info!("Connecting to Redis...");
    let discovery = Arc::new(
        RedisDiscovery::connect(config.redis_url.expose_secret())
            .await
            .context("service registry connection")?,
    );
    let registry = Arc::new(ServiceRegistry::new(discovery.clone()));

    // Every node reaches every other through the same Redis
    let bus: Arc<dyn MessageBus> = Arc::new(
        RedisBus::connect(config.redis_url.expose_secret(), config.rpc_timeout)
            .await
            .context("message bus connection")?,
    );
    info!("Redis connection established");

    // Embedded location registry, registered like any other location node
    let location_registration = if config.embed_location_service {
        let store = RedisLocationStore::connect(config.redis_url.expose_secret())
            .await
            .context("location store connection")?;
        let location_id = format!("{}-location", config.node_id);
        let location_service = Arc::new(LocationService::new(
            location_id.clone(),
            LocationRegistry::new(Arc::new(store)),
            Arc::clone(&bus),
            config.max_inflight_requests,
        ));
        location_service
            .start(shutdown_token.child_token())
            .await
            .context("location service start")?;

        let registration = Arc::new(NodeRegistration::new(
            discovery.clone(),
            Node::new(config.region.clone(), location_id, service::LOCATION),
            config.node_lease_ttl,
        ));
        registration
            .register()
            .await
            .context("location node registration")?;
        registration.spawn_keepalive(shutdown_token.child_token());
        Some(registration)
    } else {
        None
    };

    // This node's own record; its load is the local peer count
    let registration = Arc::new(NodeRegistration::new(
        discovery.clone(),
        Node::new(
            config.region.clone(),
            config.node_id.clone(),
            service::COORDINATOR,
        ),
        config.node_lease_ttl,
    ));
    registration
        .register()
        .await
        .context("coordinator node registration")?;
    registration.spawn_keepalive(shutdown_token.child_token());

    let coordinator = Coordinator::new(
        CoordinatorSettings::from_config(&config),
        Arc::clone(&registry),
        Arc::clone(&bus),
        registration.load_gauge(),
        shutdown_token.child_token(),
    );
    coordinator.start().await.map_err(|e| {
        error!(error = %e, "Failed to start coordinator");
        e
    })?;

    // Health server; bind BEFORE spawning to fail fast on bind errors
    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .context("invalid health bind address")?;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(Arc::clone(&health_state)).merge(metrics_router);
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(health_listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let signal_addr: SocketAddr = config
        .signal_bind_address
        .parse()
        .context("invalid signal bind address")?;
    let signal_listener = tokio::net::TcpListener::bind(signal_addr)
        .await
        .with_context(|| format!("Failed to bind signal listener to {signal_addr}"))?;
    tokio::spawn(run_listener(
        signal_listener,
        Arc::clone(&coordinator),
        DEFAULT_MAILBOX_CAPACITY,
        shutdown_token.child_token(),
    ));
    info!(addr = %signal_addr, "Signal listener started");

    health_state.set_ready();
    info!("Signal Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();

    // Leave the registry first so peers and siblings stop routing here
    if let Err(e) = registration.deregister().await {
        warn!(error = %e, "Coordinator deregistration failed");
    }
    if let Some(location_registration) = location_registration {
        if let Err(e) = location_registration.deregister().await {
            warn!(error = %e, "Location deregistration failed");
        }
    }

    shutdown_token.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("Signal Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the process
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
