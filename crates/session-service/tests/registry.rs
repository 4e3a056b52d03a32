// Session registry behavior over in-memory sessions

use std::sync::Arc;
use std::time::Duration;

use viska_session_service::testing::{
    MemoryAccountStore, MemoryConnector, PresenceReport, RecordingErrorSink, RecordingPresence,
};
use viska_session_service::{
    AccountSync, ConnectionMethod, ConnectionProtocol, LoginAttempt, ServiceError, SessionRegistry,
};
use viska_xmpp_core::testing::{LoginOutcome, MemorySession};
use viska_xmpp_core::{Credential, Jid, Session, SessionState};

fn jid(s: &str) -> Jid {
    Jid::parse(s).unwrap()
}

fn credential() -> Credential {
    Credential::new("secret")
}

struct Fixture {
    registry: Arc<SessionRegistry>,
    connector: Arc<MemoryConnector>,
    presence: Arc<RecordingPresence>,
}

fn fixture() -> Fixture {
    let connector = Arc::new(MemoryConnector::new());
    let presence = Arc::new(RecordingPresence::default());
    let registry = Arc::new(
        SessionRegistry::new(connector.clone(), presence.clone()).with_dispose_timeout(Duration::from_secs(1)),
    );
    Fixture {
        registry,
        connector,
        presence,
    }
}

/// Poll `check` until it holds or a second has passed
async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_session(connector: &MemoryConnector, identity: &Jid, state: SessionState) -> Arc<MemorySession> {
    let mut found = None;
    eventually(|| {
        found = connector
            .last_session(identity)
            .filter(|session| session.state() == state);
        found.is_some()
    })
    .await;
    found.unwrap()
}

#[tokio::test]
async fn test_second_login_while_connecting_is_duplicate() {
    let f = fixture();
    let x = jid("x@example.com");
    f.connector.hold_logins(true);

    let first = {
        let registry = f.registry.clone();
        let x = x.clone();
        tokio::spawn(async move { registry.login(&x, &credential(), false).await })
    };
    let session = wait_for_session(&f.connector, &x, SessionState::Connecting).await;

    let second = f.registry.login(&x, &credential(), false).await;
    assert!(matches!(second, Err(ServiceError::DuplicateIdentity { identity }) if identity == x));

    session.release_login();
    first.await.unwrap().unwrap();
    assert_eq!(f.registry.get(&x).unwrap().state(), SessionState::Online);
    assert_eq!(f.connector.constructed(), 1);
    assert_eq!(session.login_calls(), 1);
}

#[tokio::test]
async fn test_login_on_registered_identity_without_replace_is_duplicate() {
    let f = fixture();
    let x = jid("x@example.com");
    f.registry.login(&x, &credential(), false).await.unwrap();

    let err = f.registry.login(&x, &credential(), false).await.unwrap_err();
    assert!(err.is_duplicate());
    assert_eq!(f.connector.constructed(), 1);
}

#[tokio::test]
async fn test_no_secure_transport_leaves_registry_untouched() {
    let f = fixture();
    let x = jid("x@example.com");
    f.registry.login(&x, &credential(), false).await.unwrap();
    let existing = f.connector.last_session(&x).unwrap();

    f.connector.set_methods(
        "example.com",
        vec![
            ConnectionMethod::new(ConnectionProtocol::Tcp, "xmpp.example.com", 5222, false),
            ConnectionMethod::new(ConnectionProtocol::WebSocket, "ws.example.com", 80, false),
        ],
    );
    let err = f.registry.login(&x, &credential(), true).await.unwrap_err();
    assert!(matches!(err, ServiceError::NoSecureTransport { ref domain } if domain == "example.com"));

    assert_eq!(f.connector.constructed(), 1);
    assert_eq!(existing.state(), SessionState::Online);
    assert_eq!(existing.dispose_calls(), 0);
    assert_eq!(f.registry.len(), 1);
    assert!(f.registry.identities().contains(&x));
}

#[tokio::test]
async fn test_unsupported_protocol_releases_reservation() {
    let f = fixture();
    let x = jid("x@chat.example");
    f.connector.set_methods(
        "chat.example",
        vec![ConnectionMethod::new(ConnectionProtocol::WebSocket, "ws.chat.example", 443, true)],
    );

    let err = f.registry.login(&x, &credential(), false).await.unwrap_err();
    assert!(matches!(err, ServiceError::UnsupportedProtocolVariant { ref protocol } if protocol == "websocket"));
    assert!(f.registry.identities().is_empty());
    assert!(f.registry.begin_login(&x, false).is_ok());
}

#[tokio::test]
async fn test_resolution_failure_is_reported() {
    let f = fixture();
    f.connector.fail_resolution("nowhere.example");

    let err = f
        .registry
        .login(&jid("x@nowhere.example"), &credential(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AddressResolution { .. }));
    assert!(f.registry.is_empty());
}

#[tokio::test]
async fn test_replace_disposes_old_session_first() {
    let f = fixture();
    let x = jid("x@example.com");
    f.registry.login(&x, &credential(), false).await.unwrap();
    let old = f.connector.last_session(&x).unwrap();

    f.registry.login(&x, &credential(), true).await.unwrap();
    assert_eq!(old.state(), SessionState::Disposed);

    let sessions = f.connector.sessions_for(&x);
    assert_eq!(sessions.len(), 2);
    let new = &sessions[1];
    assert_eq!(new.state(), SessionState::Online);
    assert_eq!(f.registry.len(), 1);

    // The old session's DISPOSED must not evict its replacement
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(f.registry.get(&x).unwrap().state(), SessionState::Online);
}

#[tokio::test]
async fn test_concurrent_replace_and_sync_keep_one_live_session() {
    let f = fixture();
    let x = jid("x@example.com");
    let accounts = Arc::new(MemoryAccountStore::new());
    accounts.add(x.clone(), "secret");
    let sync = AccountSync::new(f.registry.clone(), accounts, Arc::new(RecordingErrorSink::default()));
    sync.set_network_available(true);
    f.registry.login(&x, &credential(), false).await.unwrap();

    let (credential_a, credential_b) = (credential(), credential());
    let (first, second, report) = tokio::join!(
        f.registry.login(&x, &credential_a, true),
        f.registry.login(&x, &credential_b, true),
        sync.sync(),
    );
    sync.settle().await;

    let results = [first, second];
    assert!(results.iter().any(|result| result.is_ok()));
    for result in &results {
        if let Err(e) = result {
            // Refused outright, or superseded by the other replacing login
            assert!(e.is_duplicate() || e.is_disposed(), "unexpected error: {e}");
        }
    }
    assert!(report.unwrap().logins.is_empty());

    eventually(|| {
        f.connector
            .sessions_for(&x)
            .iter()
            .filter(|session| session.state() != SessionState::Disposed)
            .count()
            == 1
    })
    .await;
    assert_eq!(f.registry.len(), 1);
    assert_eq!(f.registry.get(&x).unwrap().state(), SessionState::Online);
}

#[tokio::test]
async fn test_disposed_session_is_removed() {
    let f = fixture();
    let x = jid("x@example.com");
    let session = f.registry.login(&x, &credential(), false).await.unwrap();

    session.dispose().await.unwrap();
    eventually(|| !f.registry.contains(&x)).await;
    eventually(|| f.presence.last() == Some(PresenceReport::Idle)).await;
}

#[tokio::test]
async fn test_reconnect_waits_for_running_login() {
    let f = fixture();
    let x = jid("x@example.com");
    f.connector.hold_logins(true);

    let login = {
        let registry = f.registry.clone();
        let x = x.clone();
        tokio::spawn(async move { registry.login(&x, &credential(), false).await })
    };
    let session = wait_for_session(&f.connector, &x, SessionState::Connecting).await;

    let reconnect = {
        let registry = f.registry.clone();
        let x = x.clone();
        tokio::spawn(async move { registry.reconnect(&x, &credential()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reconnect.is_finished());

    session.release_login();
    login.await.unwrap().unwrap();
    reconnect.await.unwrap().unwrap();

    assert_eq!(session.logins_while_busy(), 0);
    assert_eq!(session.login_calls(), 1);
}

#[tokio::test]
async fn test_reconnect_resumes_disconnected_session() {
    let f = fixture();
    let x = jid("x@example.com");
    f.registry.login(&x, &credential(), false).await.unwrap();
    let session = f.connector.last_session(&x).unwrap();
    session.drop_connection();

    f.registry.reconnect(&x, &credential()).await.unwrap();
    assert_eq!(session.state(), SessionState::Online);
    assert_eq!(session.login_calls(), 2);
    assert_eq!(f.connector.constructed(), 1);
    assert_eq!(f.registry.attempt(&x), Some(LoginAttempt::Succeeded));

    // Already online: nothing to do
    f.registry.reconnect(&x, &credential()).await.unwrap();
    assert_eq!(session.login_calls(), 2);
}

#[tokio::test]
async fn test_reconnect_unknown_identity() {
    let f = fixture();
    let err = f
        .registry
        .reconnect(&jid("ghost@example.com"), &credential())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnknownIdentity { .. }));
}

#[tokio::test]
async fn test_failed_login_keeps_disconnected_entry() {
    let f = fixture();
    let x = jid("x@example.com");
    f.connector.set_login_outcome(LoginOutcome::Fail("not-authorized".to_string()));

    let err = f.registry.login(&x, &credential(), false).await.unwrap_err();
    assert!(matches!(err, ServiceError::LoginFailed { ref reason, .. } if reason == "not-authorized"));

    assert!(f.registry.contains(&x));
    assert_eq!(f.registry.get(&x).unwrap().state(), SessionState::Disconnected);
    assert!(matches!(f.registry.attempt(&x), Some(LoginAttempt::Failed(_))));
    assert!(f.connector.last_session(&x).unwrap().kill_calls() >= 1);
}

#[tokio::test]
async fn test_presence_follows_online_count() {
    let f = fixture();
    let a = jid("a@example.com");
    let b = jid("b@example.com");
    f.registry.login(&a, &credential(), false).await.unwrap();
    f.registry.login(&b, &credential(), false).await.unwrap();
    eventually(|| f.presence.last() == Some(PresenceReport::Online(2))).await;

    f.connector.last_session(&a).unwrap().drop_connection();
    eventually(|| f.presence.last() == Some(PresenceReport::Online(1))).await;

    f.registry.remove(&a);
    f.registry.remove(&b);
    eventually(|| f.presence.last() == Some(PresenceReport::Idle)).await;

    let reports = f.presence.reports();
    assert!(reports.windows(2).all(|pair| pair[0] != pair[1]), "repeated report in {reports:?}");
}

#[tokio::test]
async fn test_kill_all_connections_keeps_sessions() {
    let f = fixture();
    let a = jid("a@example.com");
    let b = jid("b@example.com");
    f.registry.login(&a, &credential(), false).await.unwrap();
    f.registry.login(&b, &credential(), false).await.unwrap();

    assert_eq!(f.registry.kill_all_connections().await, 2);
    assert_eq!(f.registry.len(), 2);
    for (_, state) in f.registry.session_states() {
        assert_eq!(state, SessionState::Disconnected);
    }
    assert_eq!(f.registry.kill_all_connections().await, 0);
}
