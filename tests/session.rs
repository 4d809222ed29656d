use std::time::{Duration, Instant};

use load_governor::coordinate::Standing;
use load_governor::governor::EmergencyStop;
use load_governor::{
    launch, start_session, Actuation, ControlConfig, ControlState, Controller, Coordinator, CpuPool,
    FailureReason, GovernorError, ResourceKind, SessionParts, SessionSpec, SimulatedPlant, Target, TickOutcome,
};
use tokio::runtime::Handle;

const PERIOD: Duration = Duration::from_millis(20);
const SCHEDULING_SLACK: Duration = Duration::from_millis(50);

fn target(percent: f64) -> Target {
    Target::new(percent).unwrap()
}

fn fast_config() -> ControlConfig {
    ControlConfig {
        period_ms: 20,
        max_workers: 4,
        cpu_cycle_ms: 20,
        ..ControlConfig::default()
    }
}

fn running_controller(plant: &SimulatedPlant, kind: ResourceKind, percent: f64, config: &ControlConfig) -> Controller {
    let mut controller = Controller::new(
        format!("{kind}-test"),
        kind,
        target(percent),
        config,
        plant.session_parts(kind),
    );
    controller.start();
    controller
}

#[test]
fn stale_readings_hold_the_actuation() {
    let plant = SimulatedPlant::new(10.0, 4, 0);
    let config = fast_config();
    let mut controller = running_controller(&plant, ResourceKind::Cpu, 50.0, &config);
    for _ in 0..5 {
        controller.tick();
    }
    let held = plant.actuation(ResourceKind::Cpu);
    let applied = plant.applied().len();
    assert_ne!(held, Actuation::idle(ResourceKind::Cpu));

    plant.fail_next(3);
    for consecutive in 1..=3 {
        assert_eq!(controller.tick(), TickOutcome::Held { consecutive });
        assert_eq!(plant.actuation(ResourceKind::Cpu), held);
        assert_eq!(plant.applied().len(), applied);
    }

    assert!(matches!(controller.tick(), TickOutcome::Adjusted(_)));
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, ControlState::Running);
    assert_eq!(snapshot.diagnostics.consecutive_stale_ticks, 0);
    assert_eq!(snapshot.diagnostics.total_stale_ticks, 3);
}

#[test]
fn staleness_past_the_threshold_fails_the_session() {
    let plant = SimulatedPlant::new(10.0, 4, 0);
    let config = fast_config();
    let mut controller = running_controller(&plant, ResourceKind::Cpu, 50.0, &config);
    plant.fail_next(100);

    for _ in 0..config.stale_tick_threshold {
        assert!(matches!(controller.tick(), TickOutcome::Held { .. }));
    }
    let reason = FailureReason::SamplerStale {
        consecutive: config.stale_tick_threshold + 1,
    };
    assert_eq!(controller.tick(), TickOutcome::Failed(reason.clone()));
    assert_eq!(controller.state(), ControlState::Failed);

    controller.shutdown().unwrap();
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, ControlState::Failed);
    assert_eq!(snapshot.failure, Some(reason));
}

#[test]
fn new_target_keeps_workers_and_restarts_error_history() {
    let plant = SimulatedPlant::new(10.0, 4, 0);
    let mut controller = running_controller(&plant, ResourceKind::Cpu, 60.0, &fast_config());
    for _ in 0..20 {
        controller.tick();
    }
    let before = plant.actuation(ResourceKind::Cpu);
    controller.set_target(target(30.0));
    assert_eq!(plant.actuation(ResourceKind::Cpu), before);

    for _ in 0..30 {
        controller.tick();
    }
    assert!((plant.utilization(ResourceKind::Cpu) - 30.0).abs() < 2.0);
}

#[test]
fn allocation_shortfall_is_absorbed() {
    let total = 1u64 << 30;
    let plant = SimulatedPlant::new(5.0, 1, total);
    plant.set_allocation_limit(Some(total / 10));
    let config = ControlConfig {
        min_free_memory_bytes: 0,
        ..fast_config()
    };
    let mut controller = running_controller(&plant, ResourceKind::Memory, 60.0, &config);
    for _ in 0..20 {
        assert!(matches!(controller.tick(), TickOutcome::Adjusted(_)));
    }
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, ControlState::Running);
    assert!(snapshot.diagnostics.allocation_failures > 0);
    assert_eq!(snapshot.resident_bytes, total / 10);
    assert!(snapshot.induced_percent <= 10.0 + 1e-9);
}

#[test]
fn governor_ceiling_is_reported_as_veto() {
    let plant = SimulatedPlant::new(0.0, 4, 0);
    let config = ControlConfig {
        max_workers: 1,
        ..fast_config()
    };
    let mut controller = running_controller(&plant, ResourceKind::Cpu, 90.0, &config);
    for _ in 0..20 {
        controller.tick();
    }
    assert!(plant.applied().iter().all(|a| a.workers() <= 1));
    assert!(controller.snapshot().diagnostics.governor_vetoes > 0);
    assert!((plant.utilization(ResourceKind::Cpu) - 25.0).abs() < 1e-6);
}

#[test]
fn cpu_holds_its_rise_while_memory_overshoots() {
    let plant = SimulatedPlant::new(10.0, 4, 0);
    let coordinator = Coordinator::new(2.0);
    let parts = plant.session_parts(ResourceKind::Cpu).with_coordinator(coordinator.clone());
    let mut controller = Controller::new("cpu-coordinated".into(), ResourceKind::Cpu, target(60.0), &fast_config(), parts);
    controller.start();

    let overshooting = Standing {
        percent: 70.0,
        target: 50.0,
        induced: 40.0,
    };
    coordinator.report(ResourceKind::Memory, overshooting);
    for _ in 0..5 {
        controller.tick();
    }
    assert_eq!(plant.actuation(ResourceKind::Cpu), Actuation::idle(ResourceKind::Cpu));
    assert_eq!(controller.snapshot().diagnostics.coordination_holds, 5);

    coordinator.report(
        ResourceKind::Memory,
        Standing {
            percent: 51.0,
            ..overshooting
        },
    );
    for _ in 0..30 {
        controller.tick();
    }
    assert!((plant.utilization(ResourceKind::Cpu) - 60.0).abs() < 2.0);
    assert_eq!(controller.snapshot().diagnostics.coordination_holds, 5);
}

#[test]
fn coordinated_pair_both_reach_their_targets() {
    let plant = SimulatedPlant::new(10.0, 4, 1 << 30);
    let coordinator = Coordinator::new(2.0);
    let config = ControlConfig {
        min_free_memory_bytes: 0,
        ..fast_config()
    };
    let mut controllers: Vec<Controller> = [(ResourceKind::Cpu, 40.0), (ResourceKind::Memory, 30.0)]
        .into_iter()
        .map(|(kind, percent)| {
            let parts = plant.session_parts(kind).with_coordinator(coordinator.clone());
            let mut controller = Controller::new(format!("{kind}-pair"), kind, target(percent), &config, parts);
            controller.start();
            controller
        })
        .collect();

    for _ in 0..40 {
        for controller in &mut controllers {
            assert!(matches!(controller.tick(), TickOutcome::Adjusted(_)));
        }
    }
    assert!((plant.utilization(ResourceKind::Cpu) - 40.0).abs() < 2.0);
    assert!((plant.utilization(ResourceKind::Memory) - 30.0).abs() < 2.0);

    controllers[0].shutdown().unwrap();
    assert_eq!(coordinator.holds_rise(ResourceKind::Memory), None);
}

#[test]
fn sessions_need_a_runtime() {
    let spec = SessionSpec::new(ResourceKind::Cpu, target(50.0), PERIOD);
    assert!(matches!(start_session(spec, &fast_config()), Err(GovernorError::NoRuntime)));
}

#[tokio::test]
async fn stop_twice_is_the_same_as_once() {
    let plant = SimulatedPlant::new(10.0, 4, 0);
    let spec = SessionSpec::new(ResourceKind::Cpu, target(40.0), PERIOD);
    let session = launch(&Handle::current(), spec, &fast_config(), plant.session_parts(ResourceKind::Cpu)).unwrap();
    assert!(session.id().starts_with("cpu-"));
    assert_eq!(session.kind(), ResourceKind::Cpu);

    tokio::time::sleep(Duration::from_millis(100)).await;
    session.stop();
    session.stop();
    let done = tokio::time::timeout(Duration::from_secs(5), session.wait_terminal()).await.unwrap();
    assert_eq!(done.state, ControlState::Stopped);
    assert_eq!(done.active_workers, 0);

    session.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state().state, ControlState::Stopped);
    assert!(matches!(session.set_target(target(20.0)), Err(GovernorError::SessionClosed(_))));
}

#[tokio::test]
async fn live_target_update_reaches_the_loop() {
    let plant = SimulatedPlant::new(10.0, 4, 0);
    let spec = SessionSpec::new(ResourceKind::Cpu, target(40.0), PERIOD);
    let session = launch(&Handle::current(), spec, &fast_config(), plant.session_parts(ResourceKind::Cpu)).unwrap();

    session.set_target(target(25.0)).unwrap();
    let mut updates = session.subscribe();
    let updated = tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|s| s.target == target(25.0)))
        .await
        .unwrap()
        .map(|s| s.clone());
    assert!(updated.is_ok());
    session.stop_and_wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emergency_stop_retires_real_workers() {
    let plant = SimulatedPlant::new(0.0, 2, 0);
    let emergency = EmergencyStop::new();
    let cycle = Duration::from_millis(20);
    let parts = SessionParts {
        probe: Box::new(plant.probe(ResourceKind::Cpu)),
        pool: Box::new(CpuPool::new(cycle, emergency.halt())),
        logical_cpus: 2,
        emergency,
        coordinator: None,
    };
    let config = ControlConfig {
        max_workers: 2,
        ..fast_config()
    };
    let spec = SessionSpec::new(ResourceKind::Cpu, target(80.0), PERIOD);
    let session = launch(&Handle::current(), spec, &config, parts).unwrap();

    let mut updates = session.subscribe();
    tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|s| s.active_workers > 0))
        .await
        .unwrap()
        .unwrap();

    let pressed = Instant::now();
    session.emergency_stop();
    let state = session.state().state;
    assert!(matches!(state, ControlState::Stopping | ControlState::Stopped), "{state:?}");

    let done = tokio::time::timeout(Duration::from_secs(5), session.wait_terminal()).await.unwrap();
    let latency = pressed.elapsed();
    assert_eq!(done.state, ControlState::Stopped);
    assert_eq!(done.active_workers, 0);
    assert_eq!(done.diagnostics.retirement_timeouts, 0);
    // a busy phase never outlasts one cycle; the rest is thread wakeup and joins
    assert!(latency < cycle + SCHEDULING_SLACK, "stopped after {latency:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cpu_period_below_the_refresh_interval_keeps_running() {
    let config = ControlConfig {
        max_workers: 1,
        ..ControlConfig::default()
    };
    let period = Duration::from_millis(25);
    let spec = SessionSpec::new(ResourceKind::Cpu, target(30.0), period);
    let session = start_session(spec, &config).unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    let snapshot = session.state();
    assert_eq!(snapshot.state, ControlState::Running, "{:?}", snapshot.failure);
    assert_eq!(snapshot.diagnostics.total_stale_ticks, 0);
    assert!(snapshot.ticks > u64::from(config.stale_tick_threshold) + 1);

    let done = tokio::time::timeout(Duration::from_secs(5), session.stop_and_wait()).await.unwrap();
    assert_eq!(done.state, ControlState::Stopped);
}
