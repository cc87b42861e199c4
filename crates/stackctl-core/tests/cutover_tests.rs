use stackctl_core::cutover::CutoverState;
use stackctl_core::prelude::*;
use stackctl_core::{CertClientError, CertificateError, CutoverFailure, LockError, ProxyError};
use stackctl_test_utils::{self_signed_pem, FakeCertClient, FakeProxy, IssueBehavior};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CHALLENGE: &str = "server { listen 80; location /.well-known/acme-challenge/ { root /var/www/certbot; } }\n";
const PRODUCTION: &str = "server { listen 443 ssl; ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem; }\n";

struct Harness {
    dir: TempDir,
    proxy: Arc<FakeProxy>,
    client: Arc<FakeCertClient>,
    cutover: CertificateCutover,
}

fn harness(proxy: FakeProxy, client: FakeCertClient) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = CutoverSettings {
        domains: vec!["example.com".into(), "www.example.com".into()],
        contact_email: "ops@example.com".into(),
        lock_path: dir.path().join("cutover.lock"),
        lock_stale_after: Duration::from_secs(3600),
        min_validity_days: 30,
        client_timeout: Duration::from_secs(300),
    };
    harness_with(dir, settings, proxy, client)
}

fn harness_with(dir: TempDir, settings: CutoverSettings, proxy: FakeProxy, client: FakeCertClient) -> Harness {
    let proxy = Arc::new(proxy);
    let client = Arc::new(client);
    let cutover = CertificateCutover::new(
        proxy.clone(),
        client.clone(),
        ProxyTemplates::new(CHALLENGE, PRODUCTION),
        settings,
    );
    Harness {
        dir,
        proxy,
        client,
        cutover,
    }
}

fn good_cert() -> String {
    self_signed_pem(&["example.com", "www.example.com"], 90)
}

fn states(outcome: &CutoverOutcome) -> Vec<CutoverState> {
    outcome.history.iter().map(|t| t.to).collect()
}

#[tokio::test]
async fn test_first_issuance_reaches_production() {
    let h = harness(FakeProxy::new(CHALLENGE), FakeCertClient::issuing(good_cert()));

    let outcome = h.cutover.run(false).await.unwrap();

    assert_eq!(outcome.final_state, CutoverState::ProductionMode);
    assert!(outcome.reloaded);
    assert!(!outcome.skipped);
    assert_eq!(
        states(&outcome),
        vec![
            CutoverState::ChallengeMode,
            CutoverState::Issuing,
            CutoverState::Verifying,
            CutoverState::ProductionMode,
        ]
    );
    // challenge was already live, only production is written
    assert_eq!(h.proxy.applied(), vec![PRODUCTION.to_string()]);
    assert_eq!(h.proxy.live_config(), PRODUCTION);
    assert_eq!(h.client.requests().len(), 1);
}

#[tokio::test]
async fn test_renewal_swaps_through_challenge() {
    let h = harness(FakeProxy::new(PRODUCTION), FakeCertClient::issuing(good_cert()));

    h.cutover.run(false).await.unwrap();

    assert_eq!(h.proxy.applied(), vec![CHALLENGE.to_string(), PRODUCTION.to_string()]);
    assert_eq!(h.proxy.reloads(), 2);
}

#[tokio::test]
async fn test_second_run_is_a_noop() {
    let h = harness(FakeProxy::new(CHALLENGE), FakeCertClient::issuing(good_cert()));
    h.cutover.run(false).await.unwrap();
    let reloads = h.proxy.reloads();

    let outcome = h.cutover.run(false).await.unwrap();

    assert!(outcome.skipped);
    assert!(!outcome.reloaded);
    assert_eq!(outcome.final_state, CutoverState::ProductionMode);
    assert_eq!(h.proxy.reloads(), reloads);
    assert_eq!(h.client.requests().len(), 1);
}

#[tokio::test]
async fn test_force_reissues() {
    let h = harness(
        FakeProxy::new(PRODUCTION),
        FakeCertClient::issuing(good_cert()).with_installed(good_cert()),
    );

    let outcome = h.cutover.run(true).await.unwrap();

    assert!(!outcome.skipped);
    let requests = h.client.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].force_renewal);
}

#[tokio::test]
async fn test_expiring_certificate_is_replaced() {
    let h = harness(
        FakeProxy::new(PRODUCTION),
        FakeCertClient::issuing(good_cert()).with_installed(self_signed_pem(&["example.com", "www.example.com"], 5)),
    );

    let outcome = h.cutover.run(false).await.unwrap();

    assert!(!outcome.skipped);
    assert_eq!(h.client.requests().len(), 1);
}

#[tokio::test]
async fn test_issue_failure_restores_previous_config_exactly() {
    let h = harness(
        FakeProxy::new(PRODUCTION),
        FakeCertClient::failing(CertClientError::RateLimited("too many certificates".into())),
    );

    let err = h.cutover.run(false).await.unwrap_err();

    match &err {
        CutoverError::RolledBack { stage, restored, cause } => {
            assert_eq!(*stage, CutoverState::Issuing);
            assert_eq!(restored, "production");
            assert!(matches!(cause, CutoverFailure::Client(CertClientError::RateLimited(_))));
        }
        other => panic!("unexpected: {other}"),
    }
    assert!(err.proxy_is_safe());
    assert_eq!(h.proxy.live_config().as_bytes(), PRODUCTION.as_bytes());
}

#[tokio::test]
async fn test_verification_failure_rolls_back() {
    let h = harness(
        FakeProxy::new(PRODUCTION),
        FakeCertClient::issuing(self_signed_pem(&["example.com"], 90)),
    );

    let err = h.cutover.run(false).await.unwrap_err();

    assert!(matches!(
        err,
        CutoverError::RolledBack {
            stage: CutoverState::Verifying,
            cause: CutoverFailure::Certificate(CertificateError::MissingNames(_)),
            ..
        }
    ));
    assert_eq!(h.proxy.live_config(), PRODUCTION);
}

#[tokio::test]
async fn test_rejected_challenge_touches_nothing() {
    let h = harness(
        FakeProxy::new(PRODUCTION).reject(CHALLENGE),
        FakeCertClient::issuing(good_cert()),
    );

    let err = h.cutover.run(false).await.unwrap_err();

    assert!(matches!(err, CutoverError::ChallengeRejected(ProxyError::ValidationFailed { .. })));
    assert_eq!(h.proxy.reloads(), 0);
    assert!(h.client.requests().is_empty());
    assert_eq!(h.proxy.live_config(), PRODUCTION);
}

#[tokio::test]
async fn test_rejected_production_is_never_swapped_in() {
    let h = harness(
        FakeProxy::new(CHALLENGE).reject(PRODUCTION),
        FakeCertClient::issuing(good_cert()),
    );

    let err = h.cutover.run(false).await.unwrap_err();

    assert!(matches!(
        err,
        CutoverError::RolledBack {
            stage: CutoverState::Verifying,
            cause: CutoverFailure::Proxy(ProxyError::ValidationFailed { .. }),
            ..
        }
    ));
    assert!(!h.proxy.applied().contains(&PRODUCTION.to_string()));
    assert_eq!(h.proxy.reloads(), 0);
    assert_eq!(h.proxy.live_config(), CHALLENGE);
}

#[tokio::test]
async fn test_failed_production_reload_stays_in_challenge() {
    let h = harness(
        FakeProxy::new(CHALLENGE).fail_reload_of(PRODUCTION),
        FakeCertClient::issuing(good_cert()),
    );

    let err = h.cutover.run(false).await.unwrap_err();

    assert!(matches!(
        err,
        CutoverError::RolledBack {
            stage: CutoverState::Verifying,
            cause: CutoverFailure::Proxy(ProxyError::ReloadFailed(_)),
            ..
        }
    ));
    assert_eq!(h.proxy.live_config(), CHALLENGE);
}

#[tokio::test]
async fn test_previous_config_that_no_longer_validates_falls_back_to_challenge() {
    let legacy = "server { listen 80; return 301 https://$host$request_uri; }\n";
    let h = harness(
        FakeProxy::new(legacy).reject(legacy),
        FakeCertClient::failing(CertClientError::Network("connection refused".into())),
    );

    let err = h.cutover.run(false).await.unwrap_err();

    match err {
        CutoverError::RolledBack { restored, .. } => assert_eq!(restored, "challenge"),
        other => panic!("unexpected: {other}"),
    }
    assert_eq!(h.proxy.live_config(), CHALLENGE);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_client_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let settings = CutoverSettings {
        domains: vec!["example.com".into()],
        contact_email: "ops@example.com".into(),
        lock_path: dir.path().join("cutover.lock"),
        lock_stale_after: Duration::from_secs(3600),
        min_validity_days: 30,
        client_timeout: Duration::from_secs(5),
    };
    let h = harness_with(
        dir,
        settings,
        FakeProxy::new(PRODUCTION),
        FakeCertClient::new(IssueBehavior::Hang),
    );

    let err = h.cutover.run(false).await.unwrap_err();

    assert!(matches!(
        err,
        CutoverError::RolledBack {
            cause: CutoverFailure::Client(CertClientError::Timeout(_)),
            ..
        }
    ));
    assert_eq!(h.proxy.live_config(), PRODUCTION);
}

#[tokio::test]
async fn test_concurrent_cutover_is_refused() {
    let h = harness(FakeProxy::new(PRODUCTION), FakeCertClient::issuing(good_cert()));
    let lock_path = h.dir.path().join("cutover.lock");
    std::fs::write(&lock_path, "pid=1 since=2026-01-01T00:00:00Z\n").unwrap();

    let err = h.cutover.run(false).await.unwrap_err();

    assert!(matches!(err, CutoverError::Lock(LockError::Held { .. })));
    assert_eq!(h.proxy.reloads(), 0);
    assert!(lock_path.exists());
}
