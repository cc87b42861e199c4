use stackctl_core::prelude::*;
use stackctl_core::runtime::ServiceStatus;
use stackctl_test_utils::{best_effort, blocking, FakeRuntime, Script, ScriptedProber};
use std::sync::Arc;
use std::time::Duration;

fn controller(runtime: &Arc<FakeRuntime>, prober: &Arc<ScriptedProber>) -> RolloutController {
    RolloutController::new(runtime.clone(), prober.clone())
}

#[tokio::test(start_paused = true)]
async fn test_all_healthy_is_success() {
    let runtime = Arc::new(FakeRuntime::new());
    let prober = Arc::new(ScriptedProber::new());
    let plan = RolloutPlan::build(vec![
        blocking("postgres", 0),
        blocking("redis", 0),
        blocking("api", 1),
        best_effort("prometheus", 2),
    ])
    .unwrap();

    let result = controller(&runtime, &prober).rollout(&plan).await;

    assert_eq!(result.status, ExitStatus::Success);
    assert!(result.failed.is_empty());
    assert_eq!(result.count(ServiceHealth::Healthy), 4);
    assert_eq!(report(&result).exit_code, 0);
}

#[tokio::test(start_paused = true)]
async fn test_best_effort_failure_is_partial() {
    let runtime = Arc::new(FakeRuntime::new());
    let prober = Arc::new(ScriptedProber::new().script("metrics", Script::NeverHealthy));
    let plan = RolloutPlan::build(vec![
        blocking("db", 0),
        blocking("proxy", 1),
        best_effort("metrics", 1),
    ])
    .unwrap();

    let result = controller(&runtime, &prober).rollout(&plan).await;

    assert_eq!(result.status, ExitStatus::Partial);
    assert_eq!(result.failed, vec!["metrics".to_string()]);
    assert_eq!(result.attempted(), 3);
    assert_eq!(result.health("db"), Some(ServiceHealth::Healthy));
    assert_eq!(result.health("proxy"), Some(ServiceHealth::Healthy));
    assert_eq!(prober.attempts("metrics"), 3);
    assert_eq!(result.halted_at_tier, None);

    let summary = report(&result);
    assert_eq!(summary.exit_code, 0);
    assert_eq!(summary.unhealthy, vec!["metrics".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_blocking_failure_halts_later_tiers() {
    let runtime = Arc::new(FakeRuntime::new());
    let prober = Arc::new(ScriptedProber::new().script("postgres", Script::NeverHealthy));
    let plan = RolloutPlan::build(vec![
        blocking("postgres", 0),
        best_effort("grafana", 0),
        blocking("api", 1),
        best_effort("prometheus", 2),
    ])
    .unwrap();

    let result = controller(&runtime, &prober).rollout(&plan).await;

    assert_eq!(result.status, ExitStatus::Fatal);
    assert_eq!(result.halted_at_tier, Some(0));
    assert_eq!(result.failed, vec!["postgres".to_string()]);
    // the rest of the failing tier still resolves
    assert_eq!(result.health("grafana"), Some(ServiceHealth::Healthy));
    for later in ["api", "prometheus"] {
        assert_eq!(result.health(later), Some(ServiceHealth::NotAttempted));
        assert!(!runtime.was_started(later), "{later} must not be started");
    }
    assert_eq!(report(&result).exit_code, ExitCode::RolloutFatal.code());
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_counts_as_unhealthy() {
    let runtime = Arc::new(FakeRuntime::new().fail_start("nginx").with_logs("nginx", "bind() failed"));
    let prober = Arc::new(ScriptedProber::new());
    let plan = RolloutPlan::build(vec![blocking("nginx", 0), blocking("api", 1)]).unwrap();

    let result = controller(&runtime, &prober).rollout(&plan).await;

    let nginx = result.outcome("nginx").unwrap();
    assert_eq!(nginx.health, ServiceHealth::Unhealthy);
    assert_eq!(nginx.attempts, 0);
    assert_eq!(prober.attempts("nginx"), 0);
    assert!(nginx.diagnostic.as_ref().unwrap().log_tail.contains("bind() failed"));
    assert_eq!(result.status, ExitStatus::Fatal);
}

#[tokio::test(start_paused = true)]
async fn test_slow_service_does_not_delay_tier_mates() {
    let runtime = Arc::new(FakeRuntime::new());
    let prober = Arc::new(
        ScriptedProber::new()
            .script("slow", Script::Slow(Duration::from_secs(20)))
            .script("flaky", Script::HealthyAfter(2)),
    );
    let patient = RetryPolicy::fixed(Duration::from_secs(1), 3, Duration::from_secs(60))
        .with_attempt_timeout(Duration::from_secs(30));
    let plan = RolloutPlan::build(vec![
        ServiceSpec::new("slow", 0).blocking().with_retry(patient),
        blocking("fast", 0),
        blocking("flaky", 0),
        blocking("api", 1),
    ])
    .unwrap();

    let result = controller(&runtime, &prober).rollout(&plan).await;
    assert_eq!(result.status, ExitStatus::Success);

    let slow_ready = prober.ready_at("slow").unwrap();
    let fast_ready = prober.ready_at("fast").unwrap();
    let flaky_ready = prober.ready_at("flaky").unwrap();
    assert!(fast_ready < slow_ready);
    assert!(flaky_ready < slow_ready);
    assert_eq!(prober.attempts("flaky"), 2);

    // next tier waits for the whole tier
    let api_first = prober.first_probe("api").unwrap();
    assert!(api_first >= slow_ready);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_probe_is_bounded() {
    let runtime = Arc::new(FakeRuntime::new());
    let prober = Arc::new(ScriptedProber::new().script("stuck", Script::Hang));
    let plan = RolloutPlan::build(vec![best_effort("stuck", 0), blocking("api", 1)]).unwrap();

    let started = tokio::time::Instant::now();
    let result = controller(&runtime, &prober).rollout(&plan).await;

    assert_eq!(result.health("stuck"), Some(ServiceHealth::Unhealthy));
    assert_eq!(result.health("api"), Some(ServiceHealth::Healthy));
    assert_eq!(result.status, ExitStatus::Partial);
    // bounded by the 3s retry budget, not by the probe
    assert!(started.elapsed() <= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_status_in_snapshot() {
    let runtime = Arc::new(FakeRuntime::new().with_status("redis", ServiceStatus::Unhealthy));
    let prober = Arc::new(ScriptedProber::new().script("redis", Script::NeverHealthy));
    let plan = RolloutPlan::build(vec![best_effort("redis", 0)]).unwrap();

    let result = controller(&runtime, &prober).rollout(&plan).await;

    let snapshot = result.outcome("redis").unwrap().diagnostic.clone().unwrap();
    assert_eq!(snapshot.status, "unhealthy");
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_skips_remaining_tiers() {
    let runtime = Arc::new(FakeRuntime::new());
    let prober = Arc::new(ScriptedProber::new().script("slow", Script::Slow(Duration::from_secs(8))));
    let patient = RetryPolicy::fixed(Duration::from_secs(1), 2, Duration::from_secs(30))
        .with_attempt_timeout(Duration::from_secs(20));
    let plan = RolloutPlan::build(vec![
        ServiceSpec::new("slow", 0).best_effort().with_retry(patient),
        best_effort("grafana", 1),
    ])
    .unwrap();

    let result = controller(&runtime, &prober)
        .with_run_timeout(Some(Duration::from_secs(5)))
        .rollout(&plan)
        .await;

    assert!(result.deadline_exceeded);
    assert_eq!(result.health("slow"), Some(ServiceHealth::Unhealthy));
    assert_eq!(result.health("grafana"), Some(ServiceHealth::NotAttempted));
    // only best-effort services were skipped
    assert_eq!(result.status, ExitStatus::Partial);
}

#[tokio::test(start_paused = true)]
async fn test_huge_timeouts_do_not_abort_service_tasks() {
    let runtime = Arc::new(FakeRuntime::new());
    let prober = Arc::new(ScriptedProber::new().script("api", Script::HealthyAfter(2)));
    let unbounded = RetryPolicy::fixed(Duration::from_secs(1), 5, Duration::from_secs(u64::MAX));
    let plan = RolloutPlan::build(vec![ServiceSpec::new("api", 0).blocking().with_retry(unbounded)]).unwrap();

    let result = controller(&runtime, &prober)
        .with_run_timeout(Some(Duration::MAX))
        .rollout(&plan)
        .await;

    assert_eq!(result.health("api"), Some(ServiceHealth::Healthy));
    assert_eq!(result.status, ExitStatus::Success);
    assert!(!result.deadline_exceeded);
}
