use tlswire::{AlertDescription, CipherSuite, Error, ProtocolVersion, StaticCredentials};

use crate::common::*;

fn alerts_after_failure(to: &mut TestChannel, from: &mut TestChannel) -> Vec<AlertDescription> {
    for out in from.callbacks_mut().take_out() {
        let _ = to.received(&out);
    }
    to.callbacks().alerts.iter().map(|a| a.description).collect()
}

#[test]
fn ecdsa_tls12() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false).build().unwrap();

    let (c, s) = connect(&client_config, &server_config);

    assert_eq!(c.version(), Some(ProtocolVersion::TLS1_2));
    assert_eq!(s.version(), Some(ProtocolVersion::TLS1_2));
    assert_eq!(c.ciphersuite(), Some(CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384));
    assert_eq!(c.ciphersuite(), s.ciphersuite());
    assert_eq!(c.session_id(), s.session_id());
    assert_eq!(c.peer_certificates().len(), 1);
    assert!(s.peer_certificates().is_empty());
    assert!(c.secure_renegotiation_supported());
    assert!(s.secure_renegotiation_supported());
    assert!(!c.is_resumed());
    assert_eq!(c.callbacks().sessions, 1);
    assert_eq!(s.callbacks().sessions, 1);
    assert_eq!(c.callbacks().chains_seen, 1);
}

#[test]
fn rsa_key_transport() {
    let server_config = server_config(false, rsa_credentials()).build().unwrap();
    let client_config = client_config(false)
        .policy(policy(TestPolicy {
            suites: Some(vec![CipherSuite::RSA_AES128_GCM_SHA256]),
            ..Default::default()
        }))
        .build()
        .unwrap();

    let (mut c, mut s) = connect(&client_config, &server_config);
    assert_eq!(c.ciphersuite(), Some(CipherSuite::RSA_AES128_GCM_SHA256));
    assert_eq!(transfer(&mut c, &mut s, b"ping"), b"ping");
    assert_eq!(transfer(&mut s, &mut c, b"pong"), b"pong");
}

#[test]
fn ecdhe_rsa_cbc_uses_encrypt_then_mac() {
    let server_config = server_config(false, rsa_credentials()).build().unwrap();
    let client_config = client_config(false)
        .policy(policy(TestPolicy {
            suites: Some(vec![CipherSuite::ECDHE_RSA_AES128_CBC_SHA256]),
            ..Default::default()
        }))
        .build()
        .unwrap();

    let (mut c, mut s) = connect(&client_config, &server_config);
    assert_eq!(c.ciphersuite(), Some(CipherSuite::ECDHE_RSA_AES128_CBC_SHA256));
    assert!(c.session().unwrap().encrypt_then_mac());
    assert!(s.session().unwrap().encrypt_then_mac());
    assert_eq!(transfer(&mut c, &mut s, b"cbc"), b"cbc");
}

#[test]
fn plain_psk() {
    let server_creds = StaticCredentials::new()
        .with_psk(b"client1", b"sixteen byte key")
        .with_psk_identity_hint(b"hint");
    let client_creds = StaticCredentials::new().with_psk(b"client1", b"sixteen byte key");

    let server_config = server_config(false, server_creds).build().unwrap();
    let client_config = client_config(false)
        .credentials(std::sync::Arc::new(client_creds))
        .build()
        .unwrap();

    let (mut c, mut s) = connect(&client_config, &server_config);
    assert_eq!(c.ciphersuite(), Some(CipherSuite::PSK_AES256_GCM_SHA384));
    assert!(c.peer_certificates().is_empty());
    assert_eq!(transfer(&mut c, &mut s, b"psk"), b"psk");
}

#[test]
fn unknown_psk_identity() {
    let server_creds = StaticCredentials::new().with_psk(b"someone", b"sixteen byte key");
    let client_creds = StaticCredentials::new().with_psk(b"client1", b"sixteen byte key");

    let server_config = server_config(false, server_creds).build().unwrap();
    let client_config = client_config(false)
        .credentials(std::sync::Arc::new(client_creds))
        .build()
        .unwrap();

    let mut c = client(&client_config);
    let mut s = server(&server_config);
    let err = pump(&mut c, &mut s).unwrap_err();
    assert!(matches!(err, Error::UnknownPskIdentity), "{:?}", err);
    assert!(s.is_closed());
    let alerts = alerts_after_failure(&mut c, &mut s);
    assert_eq!(alerts, vec![AlertDescription::UnknownPskIdentity]);
    assert!(c.is_closed());
}

#[test]
fn hidden_unknown_psk_identity() {
    let server_creds = StaticCredentials::new().with_psk(b"someone", b"sixteen byte key");
    let client_creds = StaticCredentials::new().with_psk(b"client1", b"sixteen byte key");

    let server_config = server_config(false, server_creds)
        .policy(policy(TestPolicy {
            hide_unknown_users: true,
            ..Default::default()
        }))
        .build()
        .unwrap();
    let client_config = client_config(false)
        .credentials(std::sync::Arc::new(client_creds))
        .build()
        .unwrap();

    let mut c = client(&client_config);
    let mut s = server(&server_config);
    let err = pump(&mut c, &mut s).unwrap_err();
    assert!(!matches!(err, Error::UnknownPskIdentity), "{:?}", err);
    let alerts = alerts_after_failure(&mut c, &mut s);
    assert!(!alerts.contains(&AlertDescription::UnknownPskIdentity));
    assert!(!c.is_active());
}

#[test]
fn tls10_cbc() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false)
        .policy(policy(TestPolicy {
            only: Some(ProtocolVersion::TLS1_0),
            ..Default::default()
        }))
        .build()
        .unwrap();

    let (c, s) = connect(&client_config, &server_config);
    assert_eq!(c.version(), Some(ProtocolVersion::TLS1_0));
    assert_eq!(s.version(), Some(ProtocolVersion::TLS1_0));
    assert_eq!(c.ciphersuite(), Some(CipherSuite::ECDHE_ECDSA_AES256_CBC_SHA));
}

#[test]
fn tls12_only_server_rejects_old_client() {
    let server_config = server_config(false, ecdsa_credentials())
        .policy(policy(TestPolicy {
            only: Some(ProtocolVersion::TLS1_2),
            ..Default::default()
        }))
        .build()
        .unwrap();
    let client_config = client_config(false)
        .policy(policy(TestPolicy {
            only: Some(ProtocolVersion::TLS1_1),
            ..Default::default()
        }))
        .build()
        .unwrap();

    let mut c = client(&client_config);
    let mut s = server(&server_config);
    let err = pump(&mut c, &mut s).unwrap_err();
    assert!(matches!(err, Error::ProtocolVersion(_)), "{:?}", err);
    assert_eq!(
        alerts_after_failure(&mut c, &mut s),
        vec![AlertDescription::ProtocolVersion]
    );
    assert_eq!(s.callbacks().sessions, 0);
}

#[test]
fn tls12_only_server_accepts_new_client() {
    // Far down the client's preference list.
    let suite = CipherSuite::ECDHE_ECDSA_AES128_CBC_SHA256;
    let server_config = server_config(false, ecdsa_credentials())
        .policy(policy(TestPolicy {
            only: Some(ProtocolVersion::TLS1_2),
            suites: Some(vec![suite]),
            ..Default::default()
        }))
        .build()
        .unwrap();
    let client_config = client_config(false).build().unwrap();

    let (mut c, mut s) = connect(&client_config, &server_config);
    assert_eq!(c.version(), Some(ProtocolVersion::TLS1_2));
    assert_eq!(s.version(), Some(ProtocolVersion::TLS1_2));
    assert_eq!(c.ciphersuite(), Some(suite));
    assert_eq!(s.ciphersuite(), Some(suite));
    assert_eq!(transfer(&mut c, &mut s, b"one suite"), b"one suite");
    assert_eq!(c.callbacks().sessions, 1);
    assert_eq!(s.callbacks().sessions, 1);
}

#[test]
fn fallback_scsv_is_refused() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    // Offering less than the newest version we allow signals a fallback.
    let client_config = client_config(false)
        .version(ProtocolVersion::TLS1_1)
        .build()
        .unwrap();

    let mut c = client(&client_config);
    let mut s = server(&server_config);
    let err = pump(&mut c, &mut s).unwrap_err();
    assert!(matches!(err, Error::InappropriateFallback), "{:?}", err);
    assert_eq!(
        alerts_after_failure(&mut c, &mut s),
        vec![AlertDescription::InappropriateFallback]
    );
}

#[test]
fn no_common_ciphersuite() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false)
        .policy(policy(TestPolicy {
            suites: Some(vec![CipherSuite::RSA_AES128_GCM_SHA256]),
            ..Default::default()
        }))
        .build()
        .unwrap();

    let mut c = client(&client_config);
    let mut s = server(&server_config);
    let err = pump(&mut c, &mut s).unwrap_err();
    assert!(matches!(err, Error::HandshakeFailure(_)), "{:?}", err);
    assert_eq!(
        alerts_after_failure(&mut c, &mut s),
        vec![AlertDescription::HandshakeFailure]
    );
}

#[test]
fn alpn() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false)
        .alpn_protocols(["h2", "http/1.1"])
        .build()
        .unwrap();

    let mut c = client(&client_config);
    let mut s = server(&server_config);
    s.callbacks_mut().alpn_choice = Some(b"http/1.1".to_vec());
    pump(&mut c, &mut s).unwrap();

    assert_eq!(c.application_protocol(), Some(&b"http/1.1"[..]));
    assert_eq!(s.application_protocol(), Some(&b"http/1.1"[..]));
}

#[test]
fn alpn_without_choice() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false).alpn_protocols(["h2"]).build().unwrap();

    let (c, s) = connect(&client_config, &server_config);
    assert_eq!(c.application_protocol(), None);
    assert_eq!(s.application_protocol(), None);
}

#[test]
fn client_certificate() {
    let server_config = server_config(false, rsa_credentials())
        .require_client_certificate(true)
        .build()
        .unwrap();
    let client_config = client_config(false)
        .credentials(std::sync::Arc::new(ecdsa_credentials()))
        .build()
        .unwrap();

    let (c, s) = connect(&client_config, &server_config);
    assert_eq!(s.peer_certificates().len(), 1);
    assert_eq!(s.callbacks().chains_seen, 1);
    assert_eq!(c.peer_certificates().len(), 1);
}

#[test]
fn missing_required_client_certificate() {
    let server_config = server_config(false, ecdsa_credentials())
        .require_client_certificate(true)
        .build()
        .unwrap();
    let client_config = client_config(false).build().unwrap();

    let mut c = client(&client_config);
    let mut s = server(&server_config);
    let err = pump(&mut c, &mut s).unwrap_err();
    assert!(matches!(err, Error::HandshakeFailure(_)), "{:?}", err);
    assert!(s.is_closed());
    assert_eq!(
        alerts_after_failure(&mut c, &mut s),
        vec![AlertDescription::HandshakeFailure]
    );
}

#[test]
fn optional_client_certificate() {
    let server_config = server_config(false, ecdsa_credentials())
        .request_client_certificate(true)
        .build()
        .unwrap();
    let client_config = client_config(false).build().unwrap();

    let (_c, s) = connect(&client_config, &server_config);
    assert!(s.peer_certificates().is_empty());
}

#[test]
fn rejected_server_chain() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false).build().unwrap();

    let mut c = client(&client_config);
    c.callbacks_mut().reject_chain = true;
    let mut s = server(&server_config);

    let err = pump(&mut c, &mut s).unwrap_err();
    assert!(matches!(err, Error::BadCertificate(_)), "{:?}", err);
    assert!(c.is_closed());

    let mut peer_err = None;
    for out in c.callbacks_mut().take_out() {
        if let Err(e) = s.received(&out) {
            peer_err = Some(e);
        }
    }
    assert!(matches!(
        peer_err,
        Some(Error::PeerAlert(AlertDescription::BadCertificate))
    ));
    assert!(s.is_closed());
}

#[test]
fn byte_at_a_time() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false).build().unwrap();

    let mut c = client(&client_config);
    let mut s = server(&server_config);

    for _ in 0..10 {
        let to_server: Vec<u8> = c.callbacks_mut().take_out().concat();
        let to_client: Vec<u8> = s.callbacks_mut().take_out().concat();
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        for b in &to_server {
            let needed = s.received(std::slice::from_ref(b)).unwrap();
            assert!(needed > 0);
        }
        for b in &to_client {
            c.received(std::slice::from_ref(b)).unwrap();
        }
    }
    assert!(c.is_active());
    assert!(s.is_active());
}

#[test]
fn stream_handshake_timeout() {
    let client_config = client_config(false)
        .handshake_timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap();
    let mut c = client(&client_config);
    c.callbacks_mut().take_out();
    let now = std::time::Instant::now();

    // Stream transport never retransmits.
    assert!(!c.timeout_check(now).unwrap());
    assert_eq!(c.poll_timeout(), Some(now + std::time::Duration::from_secs(5)));
    assert!(!c.timeout_check(now + std::time::Duration::from_secs(4)).unwrap());

    let err = c
        .timeout_check(now + std::time::Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(c.is_closed());
}
