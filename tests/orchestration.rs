//! Ordered startup and shutdown against live health endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use control_plane::config::parse_config;
use control_plane::events::ControlEvent;
use control_plane::lifecycle::{OrchestratorError, Outcome};
use control_plane::registry::ServiceState;
use control_plane::ControlPlane;

mod common;

async fn stack(db_up: bool, startup_timeout_secs: u64) -> (Arc<ControlPlane>, Arc<AtomicBool>) {
    let db_flag = Arc::new(AtomicBool::new(db_up));
    let db = common::start_health_endpoint(db_flag.clone()).await;
    let cache = common::start_health_endpoint(Arc::new(AtomicBool::new(true))).await;
    let api = common::start_health_endpoint(Arc::new(AtomicBool::new(true))).await;

    let config = parse_config(&format!(
        r#"
        [orchestrator]
        startup_timeout_secs = {startup_timeout_secs}
        drain_timeout_secs = 1

        [[services]]
        name = "db"
        kind = "database"
        endpoint = "http://{db}"
        critical = true

        [[services]]
        name = "cache"
        kind = "cache"
        endpoint = "http://{cache}"

        [[services]]
        name = "api"
        kind = "gateway"
        endpoint = "http://{api}"
        dependencies = ["db", "cache"]
        "#
    ))
    .unwrap();

    (Arc::new(ControlPlane::new(config).unwrap()), db_flag)
}

#[tokio::test]
async fn test_startup_db_cache_api() {
    let (plane, _) = stack(true, 10).await;
    let mut events = plane.events.subscribe();

    let report = plane.orchestrator.startup(&[]).await.unwrap();
    assert!(report.success);
    assert_eq!(
        report.levels,
        vec![vec!["cache".to_string(), "db".to_string()], vec!["api".to_string()]]
    );

    // api starts only after both of its dependencies are healthy.
    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ControlEvent::StateChanged { service, to, .. } = event {
            order.push((service, to));
        }
    }
    let api_starting = order
        .iter()
        .position(|(s, to)| s == "api" && *to == ServiceState::Starting)
        .unwrap();
    for dep in ["db", "cache"] {
        let healthy = order
            .iter()
            .position(|(s, to)| s == dep && *to == ServiceState::Healthy)
            .unwrap();
        assert!(healthy < api_starting, "{dep} must be healthy before api starts");
    }

    for name in ["db", "cache", "api"] {
        assert_eq!(plane.registry.state(name), Some(ServiceState::Healthy));
    }
}

#[tokio::test]
async fn test_startup_fails_when_db_never_healthy() {
    let (plane, _) = stack(false, 2).await;

    let err = plane.orchestrator.startup(&["api".to_string()]).await.unwrap_err();
    let (failed, report) = match err {
        OrchestratorError::OperationFailed { failed, report, .. } => (failed, report),
        other => panic!("expected an operation failure, got {other}"),
    };
    assert_eq!(failed, vec!["db".to_string()]);
    assert_eq!(report.outcome("db").unwrap().outcome, Outcome::TimedOut);
    assert_eq!(report.outcome("api").unwrap().outcome, Outcome::Skipped);

    // The healthy sibling keeps running.
    assert_eq!(plane.registry.state("cache"), Some(ServiceState::Healthy));
    assert_eq!(plane.registry.state("db"), Some(ServiceState::Unhealthy));
    assert!(plane.orchestrator.last_report().is_some_and(|r| !r.success));
}

#[tokio::test]
async fn test_shutdown_of_dependency_stops_dependents_first() {
    let (plane, _) = stack(true, 10).await;
    plane.orchestrator.startup(&[]).await.unwrap();

    let report = plane.orchestrator.shutdown(&["db".to_string()], true).await.unwrap();
    assert_eq!(report.levels, vec![vec!["api".to_string()], vec!["db".to_string()]]);
    assert_eq!(plane.registry.state("api"), Some(ServiceState::Stopped));
    assert_eq!(plane.registry.state("db"), Some(ServiceState::Stopped));
    assert_eq!(plane.registry.state("cache"), Some(ServiceState::Healthy));
}

#[tokio::test]
async fn test_restart_refused_while_dependency_down() {
    let (plane, db_flag) = stack(true, 10).await;
    plane.orchestrator.startup(&[]).await.unwrap();

    db_flag.store(false, Ordering::SeqCst);
    plane.orchestrator.shutdown(&["db".to_string()], false).await.unwrap();

    let err = plane.orchestrator.restart("api").await.unwrap_err();
    assert!(err.to_string().contains("dependency 'db'"), "{err}");
}
