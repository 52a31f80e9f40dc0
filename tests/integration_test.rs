use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mesh_controlplane::cache::InMemoryResponseCache;
use mesh_controlplane::client::HyperHttpClient;
use mesh_controlplane::config::{
    GatewayConfig, HealthCheckConfig, MeshConfig, PolicyAction, PolicyConfig, PolicyRule,
    PolicyType, RouteConfig, ServiceConfig,
};
use mesh_controlplane::controller::MeshController;
use mesh_controlplane::events::MeshEvent;
use mesh_controlplane::registry::{HealthStatus, InMemoryRegistry, ServiceRegistry};
use mesh_controlplane::request::MeshRequest;
use mesh_controlplane::MeshError;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// A mock upstream answering `<name> <method> <path>`; `/healthz` fails while
/// `healthy` is false.
async fn start_mock_upstream(name: &'static str, healthy: Arc<AtomicBool>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            let healthy = healthy.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let healthy = healthy.clone();
                    async move {
                        let status = if req.uri().path() == "/healthz"
                            && !healthy.load(Ordering::SeqCst)
                        {
                            StatusCode::SERVICE_UNAVAILABLE
                        } else {
                            StatusCode::OK
                        };
                        let body = format!(
                            "{} {} {}",
                            name,
                            req.method(),
                            req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/")
                        );
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    format!("127.0.0.1:{}", addr.port())
}

fn mesh_config(addresses: Vec<String>) -> MeshConfig {
    let mut config = MeshConfig::from_toml(
        r#"
        name = "shop"
        namespace = "test"
        version = "1.0"
        "#,
    )
    .unwrap();
    let replicas = addresses.len() as u32;
    config.services.push(
        ServiceConfig::new("orders", replicas, 8080)
            .with_addresses(addresses)
            .with_health_check(HealthCheckConfig {
                path: "/healthz".to_string(),
                interval_ms: 100,
                timeout_ms: 50,
            }),
    );
    config.gateways.push(
        GatewayConfig::ingress("public", 80, &["shop.local"]).with_route(
            RouteConfig::new("/api/orders/*", "orders")
                .with_methods(&["GET", "POST"])
                .with_rewrite("/orders/")
                .with_timeout(2_000),
        ),
    );
    config
}

fn controller() -> (Arc<MeshController>, Arc<InMemoryRegistry>) {
    let registry = Arc::new(InMemoryRegistry::new());
    let client = Arc::new(HyperHttpClient::new(registry.clone()));
    (
        Arc::new(MeshController::new(registry.clone(), client)),
        registry,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_routed_through_gateway() {
    let upstream = start_mock_upstream("a", Arc::new(AtomicBool::new(true))).await;
    let (controller, _) = controller();
    controller.initialize(mesh_config(vec![upstream])).await.unwrap();

    let response = controller
        .route_request(MeshRequest::get("shop.local:80", "/api/orders/42?expand=items"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.service, "orders");
    assert_eq!(response.instance, "orders-0");
    assert_eq!(&response.body[..], b"a GET /orders/42?expand=items");

    let metrics = controller.metrics().get("orders").unwrap();
    assert_eq!(metrics.requests_total, 1);
    assert_eq!(metrics.requests_success, 1);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_body_forwarded() {
    let upstream = start_mock_upstream("a", Arc::new(AtomicBool::new(true))).await;
    let (controller, _) = controller();
    controller.initialize(mesh_config(vec![upstream])).await.unwrap();

    let request = MeshRequest::new(Method::POST, "shop.local", "/api/orders/")
        .with_header("content-type", "application/json")
        .with_body(Bytes::from_static(b"{\"sku\":1}"));
    let response = controller.route_request(request).await.unwrap();
    assert_eq!(&response.body[..], b"a POST /orders/");

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unhealthy_instance_is_skipped() {
    let healthy_a = Arc::new(AtomicBool::new(true));
    let a = start_mock_upstream("a", healthy_a.clone()).await;
    let b = start_mock_upstream("b", Arc::new(AtomicBool::new(true))).await;
    let (controller, registry) = controller();
    let mut events = controller.events().subscribe();
    controller.initialize(mesh_config(vec![a, b])).await.unwrap();

    healthy_a.store(false, Ordering::SeqCst);

    let changed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(MeshEvent::ServiceHealthChanged {
                instance_id,
                current,
                ..
            }) = events.recv().await
            {
                if instance_id == "orders-0" && current == HealthStatus::Unhealthy {
                    return;
                }
            }
        }
    })
    .await;
    assert!(changed.is_ok(), "orders-0 was never marked unhealthy");

    let instances = registry.discover_service("orders").await.unwrap();
    assert_eq!(instances[0].health, HealthStatus::Unhealthy);
    assert_eq!(instances[1].health, HealthStatus::Healthy);

    for _ in 0..4 {
        let response = controller
            .route_request(MeshRequest::get("shop.local", "/api/orders/1"))
            .await
            .unwrap();
        assert_eq!(response.instance, "orders-1");
        assert!(response.body.starts_with(b"b "));
    }

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_instance_is_upstream_error() {
    // Bind and drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (controller, _) = controller();
    controller
        .initialize(mesh_config(vec![format!("127.0.0.1:{}", port)]))
        .await
        .unwrap();

    let err = controller
        .route_request(MeshRequest::get("shop.local", "/api/orders/1"))
        .await
        .unwrap_err();
    assert!(err.is_upstream());
    assert_eq!(err.upstream_status(), None);
    assert_eq!(controller.metrics().get("orders").unwrap().requests_error, 1);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_weighted_versions() {
    let a = start_mock_upstream("a", Arc::new(AtomicBool::new(true))).await;
    let b = start_mock_upstream("b", Arc::new(AtomicBool::new(true))).await;
    let (controller, registry) = controller();
    controller.initialize(mesh_config(vec![a, b])).await.unwrap();

    // Mark the second replica as a canary and send it no traffic.
    let mut canary = registry.discover_service("orders").await.unwrap()[1].clone();
    canary = canary.with_metadata("version", "v2");
    registry.register_service(canary).await.unwrap();
    controller
        .add_policy(
            PolicyConfig::new("canary", PolicyType::Traffic, "orders").with_rule(PolicyRule::new(
                PolicyAction::Weight {
                    version: "v2".to_string(),
                    weight: 0,
                },
            )),
        )
        .unwrap();

    for _ in 0..4 {
        let response = controller
            .route_request(MeshRequest::get("shop.local", "/api/orders/1"))
            .await
            .unwrap();
        assert_eq!(response.instance, "orders-0");
    }

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cache_and_latency_metrics_follow_traffic() {
    let upstream = start_mock_upstream("a", Arc::new(AtomicBool::new(true))).await;
    let registry = Arc::new(InMemoryRegistry::new());
    let client = Arc::new(HyperHttpClient::new(registry.clone()));
    let controller = MeshController::builder(registry, client)
        .response_cache(
            Arc::new(InMemoryResponseCache::new(Duration::from_secs(30))),
            Duration::from_secs(30),
        )
        .build();
    controller.initialize(mesh_config(vec![upstream])).await.unwrap();

    let before = controller.metrics().get("orders").unwrap();
    assert_eq!(before.latency_p95, 0.0);
    assert_eq!(before.cache_hit_rate, 0.0);

    for path in ["/api/orders/1", "/api/orders/2", "/api/orders/1", "/api/orders/1"] {
        let response = controller
            .route_request(MeshRequest::get("shop.local", path))
            .await
            .unwrap();
        assert!(response.body.starts_with(b"a GET /orders/"));
    }

    let after = controller.metrics().get("orders").unwrap();
    assert_eq!(after.requests_total, 4);
    assert_eq!(after.cache_hit_rate, 0.5);
    assert!(after.latency_p95 > 0.0);
    assert!(after.latency_p99 >= after.latency_p95);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_events() {
    let upstream = start_mock_upstream("a", Arc::new(AtomicBool::new(true))).await;
    let (controller, registry) = controller();
    let mut events = controller.events().subscribe();

    controller.initialize(mesh_config(vec![upstream])).await.unwrap();
    assert!(controller.scale_service("orders", 2).await.unwrap());
    controller.shutdown().await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, MeshEvent::ServiceHealthChanged { .. }) {
            names.push(event.name());
        }
    }
    assert_eq!(
        names,
        vec![
            "gateway:setup",
            "monitoring:metrics_enabled",
            "mesh:initialized",
            "service:scaled",
            "mesh:shutdown",
        ]
    );
    assert_eq!(registry.instance_count(), 0);

    let err = controller
        .route_request(MeshRequest::get("shop.local", "/api/orders/1"))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::NotRunning));
}
