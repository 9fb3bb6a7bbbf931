use std::time::Duration;

use kiro_credential::{
    AuthMethod, CredentialPool, CredentialState, Event, EventHub, OperationalEvent,
    UnavailableReason, UpstreamCredentials,
};
use tokio::time::timeout;

fn test_credential() -> UpstreamCredentials {
    UpstreamCredentials {
        access_token: "at".to_string(),
        refresh_token: "rt".to_string(),
        expires_at: i64::MAX,
        auth_method: AuthMethod::Social,
        region: "us-east-1".to_string(),
        start_url: None,
        sso_region: None,
        profile_arn: None,
        client_id: None,
        client_secret: None,
    }
}

#[tokio::test]
async fn unavailable_recovers_via_queue() {
    let hub = EventHub::new(16);
    let mut rx = hub.subscribe();
    let pool = CredentialPool::new(hub.clone());

    pool.insert(1, test_credential()).await;

    pool.mark_unavailable(1, Duration::from_millis(50), UnavailableReason::RateLimit)
        .await;

    let ev = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        ev,
        Event::Operational(OperationalEvent::UnavailableStart(_))
    ));

    let ev = timeout(Duration::from_millis(500), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        ev,
        Event::Operational(OperationalEvent::UnavailableEnd(_))
    ));

    let state = pool.state(1).await.unwrap();
    assert!(matches!(state, CredentialState::Active));
}

#[tokio::test]
async fn stale_queue_entry_does_not_recover_early() {
    let hub = EventHub::new(32);
    let pool = CredentialPool::new(hub);

    pool.insert(1, test_credential()).await;

    pool.mark_unavailable(1, Duration::from_millis(80), UnavailableReason::Timeout)
        .await;
    pool.mark_unavailable(1, Duration::from_millis(200), UnavailableReason::Timeout)
        .await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    let state = pool.state(1).await.unwrap();
    assert!(matches!(state, CredentialState::Unavailable { .. }));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let state = pool.state(1).await.unwrap();
    assert!(matches!(state, CredentialState::Active));
}

#[tokio::test]
async fn acquire_returns_first_active_candidate_in_order() {
    let hub = EventHub::new(8);
    let pool = CredentialPool::new(hub);

    pool.insert(1, test_credential()).await;
    pool.insert(2, test_credential()).await;
    pool.mark_unavailable(1, Duration::from_secs(5), UnavailableReason::RateLimit)
        .await;

    let (id, _cred) = pool.acquire(&[1, 2], None).await.unwrap();
    assert_eq!(id, 2);
}
