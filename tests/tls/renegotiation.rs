use tlswire::{AlertDescription, Config, Error};

use crate::common::*;

fn configs(server_renegotiation: bool, client_renegotiation: bool) -> (Config, Config) {
    let server_config = server_config(false, ecdsa_credentials())
        .policy(policy(TestPolicy {
            renegotiation: server_renegotiation,
            ..Default::default()
        }))
        .build()
        .unwrap();
    let client_config = client_config(false)
        .policy(policy(TestPolicy {
            renegotiation: client_renegotiation,
            ..Default::default()
        }))
        .build()
        .unwrap();
    (client_config, server_config)
}

#[test]
fn client_initiated_full() {
    let (client_config, server_config) = configs(true, false);
    let (mut c, mut s) = connect(&client_config, &server_config);
    let first_id = c.session_id().cloned();

    c.renegotiate(true).unwrap();
    assert!(c.is_renegotiating());
    assert!(c.is_active());

    pump(&mut c, &mut s).unwrap();

    assert!(!c.is_renegotiating());
    assert!(!s.is_renegotiating());
    assert!(c.is_active());
    assert!(s.is_active());
    assert!(!c.is_resumed());
    assert_ne!(c.session_id().cloned(), first_id);
    assert_eq!(c.session_id(), s.session_id());
    assert_eq!(c.callbacks().sessions, 2);
    assert_eq!(s.callbacks().sessions, 2);

    assert_eq!(transfer(&mut c, &mut s, b"after"), b"after");
    assert_eq!(transfer(&mut s, &mut c, b"after"), b"after");
}

#[test]
fn data_flows_during_renegotiation() {
    let (client_config, server_config) = configs(true, false);
    let (mut c, mut s) = connect(&client_config, &server_config);

    c.renegotiate(true).unwrap();
    // The ClientHello goes out first, the data under the old keys after it.
    assert_eq!(transfer(&mut c, &mut s, b"meanwhile"), b"meanwhile");
    assert!(s.is_renegotiating());

    pump(&mut c, &mut s).unwrap();
    assert!(!s.is_renegotiating());
    assert_eq!(transfer(&mut c, &mut s, b"done"), b"done");
}

#[test]
fn client_initiated_refused() {
    let (client_config, server_config) = configs(false, false);
    let (mut c, mut s) = connect(&client_config, &server_config);

    c.renegotiate(false).unwrap();
    pump(&mut c, &mut s).unwrap();

    let alert = c.callbacks().alerts[0];
    assert_eq!(alert.description, AlertDescription::NoRenegotiation);
    assert!(!alert.is_fatal());
    assert!(!c.is_renegotiating());
    assert!(c.is_active());
    assert!(s.is_active());
    assert_eq!(s.callbacks().sessions, 1);

    assert_eq!(transfer(&mut c, &mut s, b"still here"), b"still here");
}

#[test]
fn server_initiated_resumes() {
    let (client_config, server_config) = configs(true, true);
    let (mut c, mut s) = connect(&client_config, &server_config);
    let first_id = c.session_id().cloned();

    s.renegotiate(false).unwrap();
    assert!(s.is_renegotiating());
    pump(&mut c, &mut s).unwrap();

    assert!(!s.is_renegotiating());
    assert!(c.is_resumed());
    assert!(s.is_resumed());
    assert_eq!(c.session_id().cloned(), first_id);
    assert_eq!(c.callbacks().sessions, 2);

    assert_eq!(transfer(&mut s, &mut c, b"renewed"), b"renewed");
}

#[test]
fn server_initiated_refused() {
    let (client_config, server_config) = configs(true, false);
    let (mut c, mut s) = connect(&client_config, &server_config);

    s.renegotiate(false).unwrap();
    pump(&mut c, &mut s).unwrap();

    assert_eq!(
        s.callbacks().alerts[0].description,
        AlertDescription::NoRenegotiation
    );
    assert!(!s.is_renegotiating());
    assert!(c.is_active());
    assert!(s.is_active());
    assert_eq!(transfer(&mut s, &mut c, b"fine"), b"fine");
}

#[test]
fn renegotiate_requires_established() {
    let (client_config, _) = configs(true, true);
    let mut c = client(&client_config);
    assert!(matches!(c.renegotiate(false), Err(Error::NotEstablished)));
    assert!(!c.is_closed());
}

#[test]
fn renegotiate_twice_is_one_handshake() {
    let (client_config, server_config) = configs(true, false);
    let (mut c, mut s) = connect(&client_config, &server_config);

    c.renegotiate(true).unwrap();
    let first = c.callbacks_mut().take_out();
    c.renegotiate(true).unwrap();
    assert!(c.callbacks_mut().take_out().is_empty());

    for out in &first {
        s.received(out).unwrap();
    }
    pump(&mut c, &mut s).unwrap();
    assert_eq!(c.callbacks().sessions, 2);
}
