use tlswire::{CipherSuite, ProtocolVersion};

use crate::common::*;
use crate::records::*;

/// Deliver everything `from` emitted to `to`, returning the datagrams.
fn step(from: &mut TestChannel, to: &mut TestChannel) -> Vec<Vec<u8>> {
    let out = from.callbacks_mut().take_out();
    for d in &out {
        to.received(d).expect("receive");
    }
    out
}

#[test]
fn cookie_exchange() {
    let server_config = server_config(true, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(true).build().unwrap();
    let mut c = client(&client_config);
    let mut s = server(&server_config);

    let f1 = step(&mut c, &mut s);
    assert_eq!(all_handshake_types(&f1), vec![CLIENT_HELLO]);

    let f2 = step(&mut s, &mut c);
    assert_eq!(all_handshake_types(&f2), vec![HELLO_VERIFY_REQUEST]);

    let f3 = step(&mut c, &mut s);
    assert_eq!(all_handshake_types(&f3), vec![CLIENT_HELLO]);
    // The second ClientHello carries the cookie.
    assert!(f3.concat().len() > f1.concat().len());

    let f4 = step(&mut s, &mut c);
    let types = all_handshake_types(&f4);
    assert!(!types.contains(&HELLO_VERIFY_REQUEST), "{:?}", types);
    for t in [SERVER_HELLO, CERTIFICATE, SERVER_KEY_EXCHANGE, SERVER_HELLO_DONE] {
        assert!(types.contains(&t), "missing {} in {:?}", t, types);
    }

    pump(&mut c, &mut s).unwrap();
    assert!(c.is_active());
    assert!(s.is_active());
    assert_eq!(c.version(), Some(ProtocolVersion::DTLS1_2));
    assert_eq!(s.version(), Some(ProtocolVersion::DTLS1_2));
}

#[test]
fn repeated_first_hello_gets_a_cookie_again() {
    let server_config = server_config(true, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(true).build().unwrap();
    let mut c = client(&client_config);
    let mut s = server(&server_config);

    let f1 = step(&mut c, &mut s);
    let hvr1 = s.callbacks_mut().take_out();
    for d in &f1 {
        s.received(d).unwrap();
    }
    let hvr2 = s.callbacks_mut().take_out();
    assert_eq!(all_handshake_types(&hvr1), vec![HELLO_VERIFY_REQUEST]);
    assert_eq!(all_handshake_types(&hvr2), vec![HELLO_VERIFY_REQUEST]);

    for d in &hvr2 {
        c.received(d).unwrap();
    }
    pump(&mut c, &mut s).unwrap();
    assert!(c.is_active());
    assert!(s.is_active());
}

#[test]
fn dtls10() {
    let server_config = server_config(true, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(true)
        .policy(policy(TestPolicy {
            only: Some(ProtocolVersion::DTLS1_0),
            ..Default::default()
        }))
        .build()
        .unwrap();

    let (mut c, mut s) = connect(&client_config, &server_config);
    assert_eq!(c.version(), Some(ProtocolVersion::DTLS1_0));
    assert_eq!(c.ciphersuite(), Some(CipherSuite::ECDHE_ECDSA_AES256_CBC_SHA));
    assert_eq!(transfer(&mut c, &mut s, b"dtls 1.0"), b"dtls 1.0");
}

#[test]
fn small_mtu_fragments_handshake() {
    const MTU: usize = 256;
    let server_config = server_config(true, rsa_credentials())
        .mtu(MTU)
        .build()
        .unwrap();
    let client_config = client_config(true).mtu(MTU).build().unwrap();
    let mut c = client(&client_config);
    let mut s = server(&server_config);

    let mut certificate_records = 0;
    for _ in 0..20 {
        let to_server = c.callbacks_mut().take_out();
        let to_client = s.callbacks_mut().take_out();
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        for d in to_server.iter().chain(to_client.iter()) {
            assert!(d.len() <= MTU, "datagram of {} bytes", d.len());
        }
        certificate_records += handshake_types_count(&to_client, CERTIFICATE);
        for d in &to_server {
            s.received(d).unwrap();
        }
        for d in &to_client {
            c.received(d).unwrap();
        }
    }

    // An RSA certificate does not fit one small datagram.
    assert!(certificate_records > 1);
    assert!(c.is_active());
    assert!(s.is_active());
}

fn handshake_types_count(datagrams: &[Vec<u8>], t: u8) -> usize {
    all_handshake_types(datagrams)
        .into_iter()
        .filter(|x| *x == t)
        .count()
}

#[test]
fn resumption() {
    let server_config = server_config(true, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(true).build().unwrap();

    let (c1, _s1) = connect(&client_config, &server_config);
    let (mut c2, mut s2) = connect(&client_config, &server_config);

    assert!(c2.is_resumed());
    assert!(s2.is_resumed());
    assert_eq!(c2.session_id(), c1.session_id());
    assert_eq!(transfer(&mut c2, &mut s2, b"again"), b"again");
}

#[test]
fn psk() {
    let creds = || tlswire::StaticCredentials::new().with_psk(b"device-7", b"0123456789abcdef");
    let server_config = server_config(true, creds()).build().unwrap();
    let client_config = client_config(true)
        .credentials(std::sync::Arc::new(creds()))
        .build()
        .unwrap();

    let (mut c, mut s) = connect(&client_config, &server_config);
    assert!(c.ciphersuite().unwrap().is_psk());
    assert_eq!(transfer(&mut s, &mut c, b"psk"), b"psk");
}
