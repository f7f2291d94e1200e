use std::time::{Duration, Instant};

use tlswire::AlertDescription;

use crate::common::*;
use crate::records::*;

fn configs(renegotiation: bool) -> (tlswire::Config, tlswire::Config) {
    let server_config = server_config(true, ecdsa_credentials())
        .policy(policy(TestPolicy {
            renegotiation,
            ..Default::default()
        }))
        .build()
        .unwrap();
    let client_config = client_config(true)
        .policy(policy(TestPolicy {
            renegotiation,
            ..Default::default()
        }))
        .build()
        .unwrap();
    (client_config, server_config)
}

#[test]
fn client_initiated() {
    let (client_config, server_config) = configs(true);
    let (mut c, mut s) = connect(&client_config, &server_config);

    c.renegotiate(true).unwrap();
    let hello = c.callbacks_mut().take_out();
    // Under the current keys, so nothing readable.
    assert!(all_handshake_types(&hello).is_empty());
    assert!(all_records(&hello).iter().all(|r| r.epoch == 1));
    for d in &hello {
        s.received(d).unwrap();
    }

    pump(&mut c, &mut s).unwrap();
    assert!(!c.is_renegotiating());
    assert!(!s.is_renegotiating());
    assert_eq!(c.callbacks().sessions, 2);
    assert_eq!(s.callbacks().sessions, 2);

    // Second handshake moved both sides to epoch 2.
    c.send(b"epoch two").unwrap();
    let out = c.callbacks_mut().take_out();
    assert_eq!(all_records(&out)[0].epoch, 2);
    for d in &out {
        s.received(d).unwrap();
    }
    assert_eq!(s.callbacks_mut().take_data(), b"epoch two");
}

#[test]
fn server_initiated() {
    let (client_config, server_config) = configs(true);
    let (mut c, mut s) = connect(&client_config, &server_config);

    s.renegotiate(false).unwrap();
    pump(&mut c, &mut s).unwrap();

    assert!(c.is_resumed());
    assert!(s.is_resumed());
    assert_eq!(transfer(&mut s, &mut c, b"after"), b"after");
    assert_eq!(transfer(&mut c, &mut s, b"after"), b"after");
}

#[test]
fn lost_hello_request_is_repeated() {
    let (client_config, server_config) = configs(true);
    let (mut c, mut s) = connect(&client_config, &server_config);
    let now = Instant::now();

    s.renegotiate(false).unwrap();
    let lost = s.callbacks_mut().take_out();
    assert!(!lost.is_empty());

    s.timeout_check(now).unwrap();
    assert!(s.timeout_check(now + Duration::from_secs(1)).unwrap());

    pump(&mut c, &mut s).unwrap();
    assert_eq!(s.callbacks().sessions, 2);
    assert!(!s.is_renegotiating());
}

#[test]
fn refused_renegotiation_stops_retransmitting() {
    let (client_config, server_config) = configs(false);
    let (mut c, mut s) = connect(&client_config, &server_config);
    let now = Instant::now();

    c.renegotiate(true).unwrap();
    pump(&mut c, &mut s).unwrap();
    assert_eq!(
        c.callbacks().alerts[0].description,
        AlertDescription::NoRenegotiation
    );
    assert!(!c.is_renegotiating());

    assert!(!c.timeout_check(now).unwrap());
    assert!(!c.timeout_check(now + Duration::from_secs(5)).unwrap());
    assert!(c.callbacks_mut().take_out().is_empty());
    assert!(c.is_active());
}
