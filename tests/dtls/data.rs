use tlswire::Error;

use crate::common::*;
use crate::records::*;

fn dtls12() -> (TestChannel, TestChannel) {
    let server_config = server_config(true, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(true).build().unwrap();
    connect(&client_config, &server_config)
}

#[test]
fn both_directions() {
    let (mut c, mut s) = dtls12();
    assert_eq!(transfer(&mut c, &mut s, b"to server"), b"to server");
    assert_eq!(transfer(&mut s, &mut c, b"to client"), b"to client");
}

#[test]
fn one_record_per_datagram() {
    let (mut c, mut s) = dtls12();
    let data = vec![0x5a; 3000];

    c.send(&data).unwrap();
    let datagrams = c.callbacks_mut().take_out();
    assert!(datagrams.len() >= 3);
    for d in &datagrams {
        assert!(d.len() <= 1232);
        assert_eq!(parse_records(d).len(), 1);
    }

    for d in &datagrams {
        s.received(d).unwrap();
    }
    assert_eq!(s.callbacks_mut().take_data(), data);
    assert_eq!(s.callbacks().sequences.len(), datagrams.len());
}

#[test]
fn replayed_datagram_is_dropped() {
    let (mut c, mut s) = dtls12();

    c.send(b"once").unwrap();
    let d = c.callbacks_mut().take_out().remove(0);
    s.received(&d).unwrap();
    s.received(&d).unwrap();

    assert_eq!(s.callbacks_mut().take_data(), b"once");
    assert!(s.is_active());
}

#[test]
fn reordered_datagrams_are_delivered() {
    let (mut c, mut s) = dtls12();

    c.send(b"first").unwrap();
    c.send(b"second").unwrap();
    let out = c.callbacks_mut().take_out();
    assert_eq!(out.len(), 2);

    s.received(&out[1]).unwrap();
    s.received(&out[0]).unwrap();
    assert_eq!(s.callbacks_mut().take_data(), b"secondfirst");

    let seqs = &s.callbacks().sequences;
    assert_eq!(seqs[0], seqs[1] + 1);
}

#[test]
fn tampered_datagram_is_dropped() {
    let (mut c, mut s) = dtls12();

    c.send(b"genuine").unwrap();
    let mut d = c.callbacks_mut().take_out().remove(0);
    let last = d.len() - 1;
    d[last] ^= 0x80;

    // Datagram transport cannot close on a forged packet.
    s.received(&d).unwrap();
    assert!(s.callbacks().data.is_empty());
    assert!(s.is_active());
    assert!(s.callbacks_mut().take_out().is_empty());

    assert_eq!(transfer(&mut c, &mut s, b"next"), b"next");
}

#[test]
fn garbage_datagram_is_ignored() {
    let (mut c, mut s) = dtls12();

    s.received(b"definitely not a record").unwrap();
    s.received(&[]).unwrap();
    assert!(s.is_active());
    assert_eq!(transfer(&mut c, &mut s, b"fine"), b"fine");
}

#[test]
fn close_notify() {
    let (mut c, mut s) = dtls12();

    c.close();
    pump(&mut c, &mut s).unwrap();
    assert!(s.callbacks().alerts[0].is_close_notify());
    assert!(c.is_closed());
    assert!(s.is_closed());
    assert!(matches!(s.send(b"x"), Err(Error::Closed)));
}
