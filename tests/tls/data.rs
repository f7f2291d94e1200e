use tlswire::{CipherSuite, Error, ProtocolVersion};

use crate::common::*;

fn tls12() -> (TestChannel, TestChannel) {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false).build().unwrap();
    connect(&client_config, &server_config)
}

#[test]
fn both_directions() {
    let (mut c, mut s) = tls12();
    assert_eq!(transfer(&mut c, &mut s, b"hello server"), b"hello server");
    assert_eq!(transfer(&mut s, &mut c, b"hello client"), b"hello client");
    assert_eq!(transfer(&mut c, &mut s, b"again"), b"again");

    // Record sequence numbers continue from the Finished record.
    let seqs = &s.callbacks().sequences;
    assert_eq!(seqs.len(), 2);
    assert_eq!(seqs[1], seqs[0] + 1);
}

#[test]
fn large_write_is_split_into_records() {
    let (mut c, mut s) = tls12();
    let data: Vec<u8> = (0..17_000).map(|i| i as u8).collect();

    assert_eq!(transfer(&mut c, &mut s, &data), data);
    assert_eq!(s.callbacks().sequences.len(), 2);
}

#[test]
fn empty_write_sends_nothing() {
    let (mut c, _s) = tls12();
    c.send(&[]).unwrap();
    assert!(c.callbacks_mut().take_out().is_empty());
}

#[test]
fn send_before_established() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false).build().unwrap();
    let mut c = client(&client_config);
    let mut s = server(&server_config);

    assert!(matches!(c.send(b"early"), Err(Error::NotEstablished)));
    assert!(!c.is_closed());

    pump(&mut c, &mut s).unwrap();
    assert_eq!(transfer(&mut c, &mut s, b"late"), b"late");
}

#[test]
fn tls10_splits_first_byte() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false)
        .policy(policy(TestPolicy {
            only: Some(ProtocolVersion::TLS1_0),
            ..Default::default()
        }))
        .build()
        .unwrap();
    let (mut c, mut s) = connect(&client_config, &server_config);

    assert_eq!(transfer(&mut c, &mut s, b"hello world"), b"hello world");
    assert_eq!(s.callbacks().sequences.len(), 2);

    // A single byte has nothing to split.
    assert_eq!(transfer(&mut c, &mut s, b"x"), b"x");
    assert_eq!(s.callbacks().sequences.len(), 3);
}

#[test]
fn tls12_cbc_does_not_split() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false)
        .policy(policy(TestPolicy {
            suites: Some(vec![CipherSuite::ECDHE_ECDSA_AES128_CBC_SHA]),
            ..Default::default()
        }))
        .build()
        .unwrap();
    let (mut c, mut s) = connect(&client_config, &server_config);

    assert_eq!(transfer(&mut c, &mut s, b"hello world"), b"hello world");
    assert_eq!(s.callbacks().sequences.len(), 1);
}

#[test]
fn records_split_across_reads() {
    let (mut c, mut s) = tls12();
    c.send(b"0123456789").unwrap();
    let record: Vec<u8> = c.callbacks_mut().take_out().concat();

    let (head, tail) = record.split_at(3);
    let needed = s.received(head).unwrap();
    assert_eq!(needed, 2);
    assert!(s.callbacks().data.is_empty());

    let needed = s.received(tail).unwrap();
    assert_eq!(needed, 5);
    assert_eq!(s.callbacks_mut().take_data(), b"0123456789");
}

#[test]
fn records_coalesced_in_one_read() {
    let (mut c, mut s) = tls12();
    c.send(b"one").unwrap();
    c.send(b"two").unwrap();
    let both: Vec<u8> = c.callbacks_mut().take_out().concat();

    s.received(&both).unwrap();
    assert_eq!(s.callbacks_mut().take_data(), b"onetwo");
}
