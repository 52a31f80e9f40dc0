use mesh_controlplane::admin_listener::AdminListener;
use mesh_controlplane::cache::InMemoryResponseCache;
use mesh_controlplane::client::HyperHttpClient;
use mesh_controlplane::config::RuntimeConfig;
use mesh_controlplane::controller::MeshController;
use mesh_controlplane::events::{forward_events, EventBus, MeshEvent};
use mesh_controlplane::registry::InMemoryRegistry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting mesh control plane");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = RuntimeConfig::from_env();
    info!(
        "config: mesh={}, admin={}, event_capacity={}",
        runtime.config_path, runtime.admin_addr, runtime.event_capacity
    );

    let content = tokio::fs::read_to_string(&runtime.config_path).await?;
    let mesh_config = runtime.parse_mesh_config(&content)?;

    let registry = Arc::new(InMemoryRegistry::new());
    let client = Arc::new(HyperHttpClient::new(registry.clone()));
    let mut builder =
        MeshController::builder(registry, client).events(EventBus::new(runtime.event_capacity));
    let cache = runtime
        .cache_ttl()
        .map(|ttl| (Arc::new(InMemoryResponseCache::new(ttl)), ttl));
    if let Some((cache, ttl)) = &cache {
        info!(ttl_ms = ttl.as_millis() as u64, "response cache enabled");
        builder = builder.response_cache(cache.clone(), *ttl);
    }
    let controller = Arc::new(builder.build());

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    if let Some((cache, ttl)) = cache {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = cache.purge_expired();
                        let stats = cache.stats();
                        debug!(purged, entries = stats.entries, hit_rate = stats.hit_rate(), "response cache swept");
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    let mut events_task = tokio::spawn(forward_events(
        controller.events().subscribe(),
        shutdown_tx.subscribe(),
        log_event,
    ));

    controller.initialize(mesh_config).await?;

    let admin_listener = AdminListener::bind(&runtime.admin_addr, controller.clone()).await?;
    let admin_addr = admin_listener.local_addr();
    info!(
        "admin endpoints on {} (/health, /metrics, /mesh/metrics, /mesh/instances)",
        admin_addr
    );

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut admin_task => {
            admin_finished = true;
            match res {
                Ok(()) => info!("admin task completed"),
                Err(err) => error!("admin task join error: {}", err),
            }
        }
    }

    if let Err(e) = controller.shutdown().await {
        error!("mesh shutdown failed: {}", e);
    }

    let _ = shutdown_tx.send(());

    if !admin_finished {
        match admin_task.await {
            Ok(()) => info!("admin task completed"),
            Err(err) => error!("admin task join error: {}", err),
        }
    }
    if let Err(err) = (&mut events_task).await {
        error!("event task join error: {}", err);
    }

    info!("shutdown complete");
    Ok(())
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::ServiceHealthChanged {
            service,
            instance_id,
            previous,
            current,
        } => info!(
            event = event.name(),
            service = %service,
            instance = %instance_id,
            previous = ?previous,
            current = ?current,
            "instance health changed"
        ),
        MeshEvent::MetricsUpdated { .. } => debug!(event = event.name()),
        _ => match serde_json::to_string(event) {
            Ok(json) => info!(event = event.name(), payload = %json),
            Err(_) => info!(event = event.name()),
        },
    }
}
