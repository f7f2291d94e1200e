use std::time::{Duration, Instant};

use tlswire::Error;

use crate::common::*;
use crate::records::*;

fn configs() -> (tlswire::Config, tlswire::Config) {
    let server_config = server_config(true, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(true).build().unwrap();
    (client_config, server_config)
}

fn step(from: &mut TestChannel, to: &mut TestChannel) -> Vec<Vec<u8>> {
    let out = from.callbacks_mut().take_out();
    for d in &out {
        to.received(d).expect("receive");
    }
    out
}

#[test]
fn timers_are_armed_lazily() {
    let (client_config, _) = configs();
    let now = Instant::now();
    let mut c = client(&client_config);

    assert_eq!(c.poll_timeout(), None);
    assert!(!c.timeout_check(now).unwrap());
    assert_eq!(c.poll_timeout(), Some(now + Duration::from_secs(1)));
}

#[test]
fn lost_client_hello() {
    let (client_config, server_config) = configs();
    let now = Instant::now();
    let mut c = client(&client_config);
    let mut s = server(&server_config);

    let lost = c.callbacks_mut().take_out();
    assert!(!c.timeout_check(now).unwrap());
    assert!(c.callbacks_mut().take_out().is_empty());

    assert!(c.timeout_check(now + Duration::from_millis(1100)).unwrap());
    let again = c.callbacks_mut().take_out();
    assert_eq!(all_handshake_types(&again), all_handshake_types(&lost));

    // Same message, fresh record sequence numbers.
    let lost_seq = all_records(&lost)[0].seq;
    let again_seq = all_records(&again)[0].seq;
    assert!(again_seq > lost_seq);

    for d in &again {
        s.received(d).unwrap();
    }
    pump(&mut c, &mut s).unwrap();
    assert!(c.is_active());
    assert!(s.is_active());
}

#[test]
fn backoff_doubles() {
    let (client_config, _) = configs();
    let now = Instant::now();
    let mut c = client(&client_config);
    c.callbacks_mut().take_out();

    c.timeout_check(now).unwrap();
    let t1 = now + Duration::from_secs(1);
    assert!(c.timeout_check(t1).unwrap());
    assert_eq!(c.poll_timeout(), Some(t1 + Duration::from_secs(2)));

    assert!(!c.timeout_check(t1 + Duration::from_secs(1)).unwrap());
    let t2 = t1 + Duration::from_secs(2);
    assert!(c.timeout_check(t2).unwrap());
    assert_eq!(c.poll_timeout(), Some(t2 + Duration::from_secs(4)));
}

#[test]
fn lost_server_flight() {
    let (client_config, server_config) = configs();
    let now = Instant::now();
    let mut c = client(&client_config);
    let mut s = server(&server_config);

    step(&mut c, &mut s); // ClientHello
    step(&mut s, &mut c); // HelloVerifyRequest
    step(&mut c, &mut s); // ClientHello with cookie
    let lost = s.callbacks_mut().take_out();
    assert!(all_handshake_types(&lost).contains(&SERVER_HELLO_DONE));

    c.timeout_check(now).unwrap();
    assert!(c.timeout_check(now + Duration::from_secs(1)).unwrap());

    // The repeated ClientHello makes the server repeat its flight.
    step(&mut c, &mut s);
    let again = s.callbacks_mut().take_out();
    assert_eq!(all_handshake_types(&again), all_handshake_types(&lost));

    for d in &again {
        c.received(d).unwrap();
    }
    pump(&mut c, &mut s).unwrap();
    assert!(c.is_active());
    assert!(s.is_active());
}

#[test]
fn lost_final_flight() {
    let (client_config, server_config) = configs();
    let now = Instant::now();
    let mut c = client(&client_config);
    let mut s = server(&server_config);

    step(&mut c, &mut s); // ClientHello
    step(&mut s, &mut c); // HelloVerifyRequest
    step(&mut c, &mut s); // ClientHello with cookie
    step(&mut s, &mut c); // ServerHello .. ServerHelloDone
    let client_flight = step(&mut c, &mut s);
    assert!(all_handshake_types(&client_flight).contains(&CLIENT_KEY_EXCHANGE));

    // Server is done, its ChangeCipherSpec and Finished vanish.
    assert!(s.is_active());
    assert!(!c.is_active());
    let lost = s.callbacks_mut().take_out();
    assert!(all_records(&lost).iter().any(|r| r.ctype == CHANGE_CIPHER_SPEC));

    // The final flight has no timer of its own.
    assert!(!s.timeout_check(now + Duration::from_secs(30)).unwrap());
    assert!(s.callbacks_mut().take_out().is_empty());

    c.timeout_check(now).unwrap();
    assert!(c.timeout_check(now + Duration::from_secs(1)).unwrap());
    let resent = step(&mut c, &mut s);
    assert_eq!(all_records(&resent).len(), all_records(&client_flight).len());

    let again = s.callbacks_mut().take_out();
    let lost_shape: Vec<(u8, u16)> = all_records(&lost).iter().map(|r| (r.ctype, r.epoch)).collect();
    let again_shape: Vec<(u8, u16)> = all_records(&again).iter().map(|r| (r.ctype, r.epoch)).collect();
    assert_eq!(lost_shape, again_shape);

    for d in &again {
        c.received(d).unwrap();
    }
    assert!(c.is_active());
    assert_eq!(c.callbacks().sessions, 1);
    assert_eq!(s.callbacks().sessions, 1);
    assert_eq!(transfer(&mut c, &mut s, b"made it"), b"made it");
}

#[test]
fn duplicate_flight_is_harmless() {
    let (client_config, server_config) = configs();
    let mut c = client(&client_config);
    let mut s = server(&server_config);

    step(&mut c, &mut s);
    step(&mut s, &mut c);
    step(&mut c, &mut s);
    let server_flight = s.callbacks_mut().take_out();
    for _ in 0..2 {
        for d in &server_flight {
            c.received(d).unwrap();
        }
    }

    pump(&mut c, &mut s).unwrap();
    assert!(c.is_active());
    assert!(s.is_active());
    assert_eq!(c.callbacks().sessions, 1);
}

#[test]
fn handshake_gives_up() {
    let (client_config, _) = configs();
    let now = Instant::now();
    let mut c = client(&client_config);
    c.callbacks_mut().take_out();

    c.timeout_check(now).unwrap();
    let err = c.timeout_check(now + Duration::from_secs(41)).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
    assert!(c.is_closed());
    // Nobody to tell.
    assert!(c.callbacks_mut().take_out().is_empty());
    assert_eq!(c.poll_timeout(), None);
}

#[test]
fn no_timers_once_established() {
    let (client_config, server_config) = configs();
    let (mut c, mut s) = connect(&client_config, &server_config);
    let now = Instant::now();

    assert!(!c.timeout_check(now + Duration::from_secs(100)).unwrap());
    assert!(!s.timeout_check(now + Duration::from_secs(100)).unwrap());
    assert!(c.callbacks_mut().take_out().is_empty());
    assert!(s.callbacks_mut().take_out().is_empty());
}
