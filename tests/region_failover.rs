//! Multi-region election: a slow, failing primary loses the election
//! to the healthy secondary within one check interval.

mod common;

use common::FakeTransport;
use revi_sdk::{
    Clock, DiagnosticBus, DiagnosticEvent, Endpoint, HealthConfig, HealthMonitor, HealthStatus,
    InstantSleeper, ManualClock, Sleeper,
};
use std::sync::Arc;

fn monitor() -> (HealthMonitor, Arc<FakeTransport>, DiagnosticBus) {
    let clock = ManualClock::new();
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let bus = DiagnosticBus::new(clock_arc.clone());
    let transport = Arc::new(FakeTransport::new(clock));
    let sleeper: Arc<dyn Sleeper> = Arc::new(InstantSleeper);
    let monitor = HealthMonitor::new(
        HealthConfig::default(),
        vec![
            Endpoint::new("us-east", "https://us.ingest.example", 0),
            Endpoint::new("eu-west", "https://eu.ingest.example", 1),
        ],
        clock_arc,
        sleeper,
        transport.clone(),
        bus.clone(),
    );
    (monitor, transport, bus)
}

#[tokio::test]
async fn slow_failing_primary_hands_over_to_the_secondary() {
    let (monitor, transport, bus) = monitor();
    let mut events = bus.subscribe();

    // Warm-up: both regions healthy.
    transport.push_probes("us-east", 50, true, 5);
    transport.push_probes("eu-west", 40, true, 5);
    for _ in 0..5 {
        monitor.check_all().await;
    }
    assert_eq!(monitor.primary().expect("primary").name, "us-east");

    // The primary goes bad: probes above the 2 s degradation threshold
    // and failing outright.
    transport.push_probes("us-east", 2_500, false, 3);
    transport.push_probes("eu-west", 40, true, 3);
    for _ in 0..3 {
        monitor.check_all().await;
    }

    // Election switched within the failing check interval.
    assert_eq!(monitor.primary().expect("primary").name, "eu-west");

    let metrics = monitor.metrics("us-east").expect("metrics");
    assert_eq!(metrics.status, HealthStatus::Unhealthy);
    assert!(metrics.p95_ms > 2_000);
    assert!(metrics.availability < 0.7);

    let history = monitor.failover_history();
    let last = history.last().expect("failover recorded");
    assert_eq!(last.from.as_deref(), Some("us-east"));
    assert_eq!(last.to, "eu-west");
    assert_eq!(last.cause, "unhealthy");

    // The change also surfaced on the diagnostic stream.
    let mut saw_failover = false;
    while let Ok(event) = events.try_recv() {
        if let DiagnosticEvent::PrimaryChanged { to, cause, .. } = event {
            if to == "eu-west" && cause == "unhealthy" {
                saw_failover = true;
            }
        }
    }
    assert!(saw_failover);
}
