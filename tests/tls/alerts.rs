use tlswire::{AlertDescription, Error};

use crate::common::*;

fn tls12() -> (TestChannel, TestChannel) {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let client_config = client_config(false).build().unwrap();
    connect(&client_config, &server_config)
}

#[test]
fn close_notify_exchange() {
    let (mut c, mut s) = tls12();

    c.close();
    assert!(!c.is_active());
    assert!(!c.is_closed());
    assert!(matches!(c.send(b"nope"), Err(Error::Closed)));

    pump(&mut c, &mut s).unwrap();

    assert!(s.callbacks().alerts[0].is_close_notify());
    assert!(c.callbacks().alerts[0].is_close_notify());
    assert!(s.is_closed());
    assert!(c.is_closed());
    assert!(matches!(c.received(&[0; 5]), Err(Error::Closed)));
}

#[test]
fn data_still_arrives_while_closing() {
    let (mut c, mut s) = tls12();

    c.close();
    let close = c.callbacks_mut().take_out();

    assert_eq!(transfer(&mut s, &mut c, b"last words"), b"last words");

    for out in &close {
        s.received(out).unwrap();
    }
    assert!(s.is_closed());
    for out in s.callbacks_mut().take_out() {
        c.received(&out).unwrap();
    }
    assert!(c.is_closed());
}

#[test]
fn records_after_close_notify_are_ignored() {
    let (mut c, mut s) = tls12();

    c.close();
    let mut out = c.callbacks_mut().take_out().concat();
    // Would fail authentication if it were processed.
    out.extend_from_slice(&[23, 3, 3, 0, 5, 1, 2, 3, 4, 5]);

    s.received(&out).unwrap();
    assert!(s.is_closed());
    assert!(s.callbacks().alerts[0].is_close_notify());
    assert!(s.callbacks().data.is_empty());
}

#[test]
fn tampered_record() {
    let (mut c, mut s) = tls12();

    c.send(b"hello").unwrap();
    let mut out = c.callbacks_mut().take_out().concat();
    let last = out.len() - 1;
    out[last] ^= 0x01;

    let err = s.received(&out).unwrap_err();
    assert!(matches!(err, Error::BadRecordMac), "{:?}", err);
    assert!(s.is_closed());
    assert!(s.callbacks().data.is_empty());

    let mut peer_err = None;
    for out in s.callbacks_mut().take_out() {
        peer_err = c.received(&out).err();
    }
    assert!(matches!(
        peer_err,
        Some(Error::PeerAlert(AlertDescription::BadRecordMac))
    ));
    assert!(c.is_closed());
}

#[test]
fn garbage_before_handshake() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let mut s = server(&server_config);

    // An application data record, not a ClientHello.
    let err = s.received(&[23, 3, 3, 0, 3, 1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::UnexpectedMessage(_)), "{:?}", err);
    assert!(s.is_closed());

    let alert = s.callbacks_mut().take_out().concat();
    assert_eq!(alert, [21, 3, 3, 0, 2, 2, 10]);
}

#[test]
fn not_tls_at_all() {
    let server_config = server_config(false, ecdsa_credentials()).build().unwrap();
    let mut s = server(&server_config);

    let err = s.received(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
    assert!(err.is_fatal());
    assert!(s.is_closed());
}
