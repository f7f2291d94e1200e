use std::sync::Arc;

use tlswire::{InMemorySessionManager, NoopSessionManager, SessionManager};

use crate::common::*;

#[test]
fn resume_by_session_id() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false).build().unwrap();

    let (c1, _s1) = connect(&client_config, &server_config);
    assert!(!c1.is_resumed());
    assert!(c1.session().unwrap().ticket().is_empty());

    let (mut c2, mut s2) = connect(&client_config, &server_config);
    assert!(c2.is_resumed());
    assert!(s2.is_resumed());
    assert_eq!(c2.session_id(), c1.session_id());
    assert_eq!(c2.ciphersuite(), c1.ciphersuite());
    assert_eq!(c2.peer_certificates(), c1.peer_certificates());
    // Nothing to verify on an abbreviated handshake.
    assert_eq!(c2.callbacks().chains_seen, 0);

    assert_eq!(transfer(&mut c2, &mut s2, b"resumed"), b"resumed");
    assert_eq!(transfer(&mut s2, &mut c2, b"resumed"), b"resumed");
}

#[test]
fn resume_by_ticket() {
    let credentials = ecdsa_credentials().with_random_session_ticket_key();
    let server_config = server_config(false, credentials)
        .session_manager(Arc::new(NoopSessionManager))
        .build()
        .unwrap();
    let client_config = client_config(false).build().unwrap();

    let (c1, _s1) = connect(&client_config, &server_config);
    assert!(!c1.is_resumed());
    assert!(!c1.session().unwrap().ticket().is_empty());

    let (mut c2, mut s2) = connect(&client_config, &server_config);
    assert!(c2.is_resumed());
    assert!(s2.is_resumed());
    assert_eq!(c2.ciphersuite(), c1.ciphersuite());
    assert_eq!(transfer(&mut c2, &mut s2, b"ticket"), b"ticket");
}

#[test]
fn forgotten_session_falls_back_to_full() {
    let client_sessions = Arc::new(InMemorySessionManager::default());
    let server_sessions = Arc::new(InMemorySessionManager::default());

    let server_config = server_config(false, ecdsa_credentials())
        .session_manager(server_sessions.clone())
        .build()
        .unwrap();
    let client_config = client_config(false)
        .session_manager(client_sessions.clone())
        .build()
        .unwrap();

    let (c1, _s1) = connect(&client_config, &server_config);
    assert_eq!(client_sessions.len(), 1);
    assert_eq!(server_sessions.len(), 1);

    assert_eq!(server_sessions.remove_all(), 1);

    let (c2, s2) = connect(&client_config, &server_config);
    assert!(!c2.is_resumed());
    assert!(!s2.is_resumed());
    assert_ne!(c2.session_id(), c1.session_id());

    // The stale session was dropped, the new one stored.
    assert_eq!(client_sessions.len(), 1);
    assert!(client_sessions.load(c1.session_id().unwrap()).is_none());
    assert!(client_sessions.load(c2.session_id().unwrap()).is_some());
}

#[test]
fn other_server_name_does_not_resume() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let sessions: Arc<dyn SessionManager> = Arc::new(InMemorySessionManager::default());

    let first = client_config(false)
        .session_manager(sessions.clone())
        .build()
        .unwrap();
    let other = tlswire::Config::builder()
        .server_name("elsewhere")
        .session_manager(sessions)
        .build()
        .unwrap();

    let _ = connect(&first, &server_config);
    let (c, _s) = connect(&other, &server_config);
    assert!(!c.is_resumed());
}

#[test]
fn session_not_saved_when_declined() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let sessions = Arc::new(InMemorySessionManager::default());
    let client_config = client_config(false)
        .session_manager(sessions.clone())
        .build()
        .unwrap();

    let mut c = client(&client_config);
    c.callbacks_mut().refuse_sessions = true;
    let mut s = server(&server_config);
    pump(&mut c, &mut s).unwrap();

    assert!(c.is_active());
    assert!(sessions.is_empty());
}
