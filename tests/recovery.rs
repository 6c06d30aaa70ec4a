//! Automatic recovery driven by health failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use control_plane::config::parse_config;
use control_plane::events::ControlEvent;
use control_plane::lifecycle::RecoveryPhase;
use control_plane::registry::ServiceState;
use control_plane::ControlPlane;

mod common;

use common::ScriptedServices;

/// Services as `(name, dependency)`.
async fn plane(services: &[(&str, Option<&str>)]) -> (Arc<ControlPlane>, Arc<ScriptedServices>) {
    let mut toml = String::from(
        r#"
        [health]
        unhealthy_threshold = 3

        [orchestrator]
        startup_timeout_secs = 5

        [recovery]
        max_retries = 3
        delay_secs = 30
        "#,
    );
    for (name, dependency) in services {
        let deps = dependency.map(|d| format!("\"{d}\"")).unwrap_or_default();
        toml.push_str(&format!(
            "\n[[services]]\nname = \"{name}\"\nkind = \"processing\"\ndependencies = [{deps}]\n"
        ));
    }

    let scripted = Arc::new(ScriptedServices::default());
    let plane = Arc::new(ControlPlane::with_probe(parse_config(&toml).unwrap(), scripted.clone()).unwrap());
    for (name, _) in services {
        plane.hooks.register(name, scripted.clone());
    }
    plane.orchestrator.startup(&[]).await.unwrap();

    tokio::spawn(plane.recovery.clone().run(plane.shutdown_signal()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    (plane, scripted)
}

async fn fail(plane: &ControlPlane, service: &str) {
    for _ in 0..3 {
        plane.monitor.check_now(service).await;
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ControlEvent>, mut pred: F) -> ControlEvent
where
    F: FnMut(&ControlEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event not observed")
}

#[tokio::test(start_paused = true)]
async fn test_recovery_exhausts_after_exactly_three_attempts() {
    let (plane, scripted) = plane(&[("search", None)]).await;
    let mut events = plane.events.subscribe();

    scripted.break_service("search");
    fail(&plane, "search").await;

    let exhausted = wait_for(&mut events, |e| matches!(e, ControlEvent::RecoveryExhausted { .. })).await;
    assert_eq!(
        exhausted,
        ControlEvent::RecoveryExhausted {
            service: "search".into(),
            attempts: 3
        }
    );
    // One start from the initial startup plus one per attempt.
    assert_eq!(scripted.starts("search"), 4);

    let search = plane.registry.get("search").unwrap();
    assert!(search.quarantined);
    assert_eq!(search.state, ServiceState::Unhealthy);
    assert_eq!(plane.recovery.phase("search"), Some(RecoveryPhase::Exhausted { attempts: 3 }));

    // Manual restart lifts the quarantine and clears the tracker.
    scripted.fix_service("search");
    plane.orchestrator.restart("search").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let search = plane.registry.get("search").unwrap();
    assert!(!search.quarantined);
    assert_eq!(search.state, ServiceState::Healthy);
    assert!(plane.recovery.phase("search").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_successful_recovery_restores_failed_dependents() {
    let (plane, scripted) = plane(&[("db", None), ("api", Some("db"))]).await;
    let mut events = plane.events.subscribe();

    scripted.break_service("db");
    fail(&plane, "db").await;
    plane.registry.transition("api", ServiceState::Unhealthy).unwrap();

    // First attempt cannot converge; the second one can.
    wait_for(&mut events, |e| {
        matches!(e, ControlEvent::RecoveryStarted { service, attempt: 2 } if service == "db")
    })
    .await;
    scripted.fix_service("db");

    wait_for(&mut events, |e| {
        matches!(e, ControlEvent::RecoverySucceeded { service, attempts: 2 } if service == "db")
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, ControlEvent::RecoverySucceeded { service, .. } if service == "api")
    })
    .await;

    assert_eq!(plane.registry.state("db"), Some(ServiceState::Healthy));
    assert_eq!(plane.registry.state("api"), Some(ServiceState::Healthy));
}

#[tokio::test(start_paused = true)]
async fn test_failures_during_startup_are_not_recovered() {
    let (plane, scripted) = plane(&[("search", None)]).await;
    let mut events = plane.events.subscribe();

    plane.orchestrator.shutdown(&[], true).await.unwrap();
    scripted.break_service("search");
    plane.registry.transition("search", ServiceState::Starting).unwrap();
    fail(&plane, "search").await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ControlEvent::RecoveryStarted { .. }), "unexpected {event:?}");
    }
    assert_eq!(scripted.starts("search"), 1);
}
