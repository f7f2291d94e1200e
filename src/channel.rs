//! The channel: one TLS or DTLS connection, without any IO.
//!
//! Bytes from the transport go in through [`Channel::received`], bytes for
//! the transport come out through [`Callbacks::emit`]. Decrypted
//! application data is handed to [`Callbacks::deliver`].

use std::time::Instant;

use crate::alert::{Alert, AlertDescription};
use crate::config::Config;
use crate::handshake::{
    opens_handshake, ClientHandshake, Context, Established, Handshake, HandshakeIo, Previous,
    ServerHandshake,
};
use crate::record::{Record, RecordLayer, RecordReader};
use crate::session::Session;
use crate::timer::{ExponentialBackoff, Timeout};
use crate::types::{CipherSuite, ContentType, ProtocolVersion, SessionId, Side};
use crate::util::all_consumed;
use crate::Error;

/// The application side of a channel.
///
/// All calls happen synchronously from within the channel's methods.
pub trait Callbacks {
    /// Bytes to write to the transport. On datagram transport, one call is
    /// one datagram.
    fn emit(&mut self, data: &[u8]);

    /// Decrypted application data, with the record sequence number it came in.
    fn deliver(&mut self, sequence: u64, data: &[u8]);

    /// Every alert received from the peer.
    fn on_alert(&mut self, alert: Alert) {
        let _ = alert;
    }

    /// A handshake completed. Return false to keep the session out of the
    /// session manager.
    fn on_session(&mut self, session: &Session) -> bool {
        let _ = session;
        true
    }

    /// Judge the peer's certificate chain (leaf first, DER).
    ///
    /// Accepts everything by default. Return an error such as
    /// [`Error::BadCertificate`] to abort the handshake.
    fn verify_certificate_chain(
        &mut self,
        chain: &[Vec<u8>],
        server_name: Option<&str>,
    ) -> Result<(), Error> {
        let _ = (chain, server_name);
        Ok(())
    }

    /// For a server, pick one of the client's ALPN protocols, or none.
    fn choose_application_protocol(&mut self, offered: &[Vec<u8>]) -> Option<Vec<u8>> {
        let _ = offered;
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    /// We sent close_notify.
    Closing,
    Closed,
}

/// A TLS 1.0-1.2 or DTLS 1.0/1.2 connection.
pub struct Channel<C: Callbacks> {
    config: Config,
    callbacks: C,
    side: Side,
    status: Status,

    reader: RecordReader,
    record: RecordLayer,
    io: HandshakeIo,

    /// Handshake in progress, initial or renegotiation.
    handshake: Option<Handshake>,
    handshake_timeout: Timeout,
    active: Option<Established>,
}

impl<C: Callbacks> Channel<C> {
    /// Start a client. The ClientHello is emitted right away.
    pub fn client(config: Config, callbacks: C) -> Result<Self, Error> {
        let mut channel = Channel::new(config, callbacks, Side::Client);
        channel.start(Handshake::Client(ClientHandshake::new(None, false)));
        channel.run(|c| c.drive())?;
        Ok(channel)
    }

    /// Start a server, waiting for a ClientHello.
    pub fn server(config: Config, callbacks: C) -> Result<Self, Error> {
        let mut channel = Channel::new(config, callbacks, Side::Server);
        channel.start(Handshake::Server(ServerHandshake::new(None, false, false)));
        Ok(channel)
    }

    fn new(config: Config, callbacks: C, side: Side) -> Self {
        let datagram = config.datagram();
        let policy = config.policy();
        let backoff =
            ExponentialBackoff::new(policy.dtls_initial_timeout(), policy.dtls_maximum_timeout());
        Channel {
            side,
            status: Status::Open,
            reader: RecordReader::new(datagram),
            record: RecordLayer::new(datagram, config.version(), config.mtu()),
            io: HandshakeIo::new(datagram, config.max_queue_rx(), backoff),
            handshake: None,
            handshake_timeout: Timeout::Disabled,
            active: None,
            callbacks,
            config,
        }
    }

    /// Feed bytes from the transport.
    ///
    /// On stream transport the result hints how many more bytes complete
    /// the next record. A datagram must be passed whole.
    pub fn received(&mut self, data: &[u8]) -> Result<usize, Error> {
        if self.status == Status::Closed {
            return Err(Error::Closed);
        }
        self.run(|c| c.process_input(data))?;
        Ok(self.reader.bytes_needed())
    }

    /// Send application data.
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.status != Status::Open {
            return Err(Error::Closed);
        }
        if self.active.is_none() {
            return Err(Error::NotEstablished);
        }
        self.run(|c| c.send_application_data(data))
    }

    /// Send close_notify. Data may still be received until the peer
    /// answers with its own.
    pub fn close(&mut self) {
        if self.status != Status::Open {
            return;
        }
        debug!("Sending close_notify");
        let sent = self.send_alert(Alert::close_notify());
        self.flush();
        if sent.is_err() {
            self.shutdown();
        } else {
            self.status = Status::Closing;
        }
    }

    /// Start a new handshake over the established one.
    ///
    /// The current session keeps carrying data until the new handshake
    /// completes. With `force_full` no session is resumed.
    pub fn renegotiate(&mut self, force_full: bool) -> Result<(), Error> {
        if self.status != Status::Open {
            return Err(Error::Closed);
        }
        let Some(active) = &self.active else {
            return Err(Error::NotEstablished);
        };
        if self.handshake.is_some() {
            debug!("Handshake already in progress");
            return Ok(());
        }
        let previous = Previous::of(active);
        if !previous.permits_renegotiation(self.config.policy()) {
            return Err(Error::Config(
                "Peer does not support secure renegotiation".into(),
            ));
        }

        debug!("Starting renegotiation, force_full: {}", force_full);
        let handshake = match self.side {
            Side::Client => {
                self.io.start_handshake(self.record.read_epoch());
                Handshake::Client(ClientHandshake::new(Some(previous), force_full))
            }
            Side::Server => Handshake::Server(ServerHandshake::new(Some(previous), force_full, true)),
        };
        self.start(handshake);
        self.run(|c| c.drive())
    }

    /// Drive timers. Returns true if a handshake flight was retransmitted.
    ///
    /// A handshake running longer than the configured handshake timeout
    /// fails with [`Error::Timeout`].
    pub fn timeout_check(&mut self, now: Instant) -> Result<bool, Error> {
        if self.status == Status::Closed {
            return Ok(false);
        }
        self.run(|c| {
            c.handshake_timeout
                .arm_if_unarmed(now, c.config.handshake_timeout());
            if c.handshake_timeout.is_expired(now) {
                return Err(Error::Timeout("handshake"));
            }
            c.io.handle_timeout(&mut c.record, now)
        })
    }

    /// When [`Channel::timeout_check`] next has work to do, if ever.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.io.flight_deadline(), self.handshake_timeout.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// A handshake has completed and the channel is not closing.
    pub fn is_active(&self) -> bool {
        self.status == Status::Open && self.active.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.status == Status::Closed
    }

    /// Whether a renegotiation is in progress.
    pub fn is_renegotiating(&self) -> bool {
        self.handshake
            .as_ref()
            .map(|h| h.is_renegotiation())
            .unwrap_or(false)
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.session().map(|s| s.version())
    }

    pub fn ciphersuite(&self) -> Option<CipherSuite> {
        self.session().map(|s| s.ciphersuite())
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session().map(|s| s.id())
    }

    /// Peer certificate chain, leaf first. Empty when the peer did not
    /// authenticate.
    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        self.session()
            .map(|s| s.peer_certificates())
            .unwrap_or_default()
    }

    pub fn application_protocol(&self) -> Option<&[u8]> {
        self.active
            .as_ref()
            .and_then(|a| a.application_protocol.as_deref())
    }

    /// Whether the last handshake resumed a session.
    pub fn is_resumed(&self) -> bool {
        self.active.as_ref().map(|a| a.resumed).unwrap_or(false)
    }

    /// Whether the peer supports RFC 5746 secure renegotiation.
    pub fn secure_renegotiation_supported(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.secure_renegotiation)
            .unwrap_or(false)
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    fn start(&mut self, handshake: Handshake) {
        self.handshake = Some(handshake);
        self.handshake_timeout = Timeout::Unarmed;
    }

    /// Run `f`, emit whatever it produced, and close on a fatal error.
    fn run<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        let res = f(self);
        if let Err(e) = &res {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        self.flush();
        res
    }

    fn fail(&mut self, error: &Error) {
        if self.status == Status::Closed {
            return;
        }
        debug!("Closing channel: {}", error);
        if let Some(description) = error.alert() {
            if self.send_alert(Alert::fatal(description)).is_err() {
                trace!("Could not send fatal alert");
            }
        }
        self.flush();
        self.shutdown();
    }

    /// Drop all state, cipher states included.
    fn shutdown(&mut self) {
        self.status = Status::Closed;
        self.handshake = None;
        self.handshake_timeout = Timeout::Disabled;
        self.active = None;
        self.record = RecordLayer::new(self.config.datagram(), self.config.version(), self.config.mtu());
        self.io = HandshakeIo::new(
            self.config.datagram(),
            self.config.max_queue_rx(),
            ExponentialBackoff::new(
                self.config.policy().dtls_initial_timeout(),
                self.config.policy().dtls_maximum_timeout(),
            ),
        );
    }

    fn flush(&mut self) {
        while let Some(out) = self.record.poll_output() {
            self.callbacks.emit(&out);
        }
    }

    fn send_alert(&mut self, alert: Alert) -> Result<(), Error> {
        self.record.send(ContentType::Alert, &alert.serialize())
    }

    fn process_input(&mut self, data: &[u8]) -> Result<(), Error> {
        self.reader.push(data);
        while let Some(raw) = self.reader.next_record()? {
            let Some(record) = self.record.decode(&raw)? else {
                continue;
            };
            self.handle_record(record)?;
            if self.status == Status::Closed {
                let mut dropped = 0;
                while let Ok(Some(_)) = self.reader.next_record() {
                    dropped += 1;
                }
                if dropped > 0 {
                    debug!("Dropped {} records received after close", dropped);
                }
                break;
            }
        }
        Ok(())
    }

    fn handle_record(&mut self, record: Record) -> Result<(), Error> {
        match record.content_type {
            ContentType::Handshake => {
                self.io
                    .push_record(&mut self.record, record.epoch, &record.fragment)?;
                if self.handshake.is_none() {
                    self.peer_starts_handshake()?;
                }
                self.drive()
            }
            ContentType::ChangeCipherSpec => {
                if record.fragment != [1] {
                    return Err(Error::Decode("Malformed ChangeCipherSpec".into()));
                }
                self.change_cipher_spec()?;
                self.drive()
            }
            ContentType::Alert => self.handle_alert(&record.fragment),
            ContentType::ApplicationData => {
                let awaiting_finished = self
                    .handshake
                    .as_ref()
                    .map(|h| h.awaits_finished())
                    .unwrap_or(false);
                if self.active.is_none() || awaiting_finished {
                    return Err(Error::UnexpectedMessage(
                        "Application data outside an established session".into(),
                    ));
                }
                self.callbacks.deliver(record.sequence, &record.fragment);
                Ok(())
            }
            ContentType::Unknown(t) => {
                if self.config.datagram() {
                    trace!("Dropping record of unknown type {}", t);
                    return Ok(());
                }
                Err(Error::UnexpectedMessage(format!("Record of unknown type {}", t)))
            }
        }
    }

    fn change_cipher_spec(&mut self) -> Result<(), Error> {
        let Some(handshake) = self.handshake.as_mut() else {
            if self.config.datagram() {
                trace!("Ignoring ChangeCipherSpec outside a handshake");
                return Ok(());
            }
            return Err(Error::UnexpectedMessage(
                "ChangeCipherSpec outside a handshake".into(),
            ));
        };
        let mut cx = Context {
            config: &self.config,
            record: &mut self.record,
            io: &mut self.io,
            callbacks: &mut self.callbacks,
        };
        handshake.change_cipher_spec(&mut cx)
    }

    fn handle_alert(&mut self, fragment: &[u8]) -> Result<(), Error> {
        let (_, alert) = all_consumed(Alert::parse, fragment)?;
        self.callbacks.on_alert(alert);

        if alert.is_close_notify() {
            debug!("Peer sent close_notify");
            if self.status == Status::Open {
                // Answer in kind, then we are done.
                self.send_alert(Alert::close_notify())?;
                self.flush();
            }
            self.shutdown();
            return Ok(());
        }

        if alert.is_fatal() {
            return Err(Error::PeerAlert(alert.description));
        }

        if alert.description == AlertDescription::NoRenegotiation && self.is_renegotiating() {
            warn!("Peer refused renegotiation");
            self.handshake = None;
            self.handshake_timeout = Timeout::Disabled;
            self.io.handshake_complete();
            return Ok(());
        }

        warn!("Peer sent warning alert {}", alert.description);
        Ok(())
    }

    /// With no handshake running, a ClientHello (server) or HelloRequest
    /// (client) begins a renegotiation, if policy allows it.
    fn peer_starts_handshake(&mut self) -> Result<(), Error> {
        let Some(msg_type) = self.io.peek_type() else {
            return Ok(());
        };
        if !opens_handshake(self.side, msg_type) {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} outside a handshake",
                msg_type
            )));
        }
        let Some(active) = &self.active else {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} before the first handshake",
                msg_type
            )));
        };

        let policy = self.config.policy();
        let allowed_by_side = match self.side {
            Side::Client => policy.allow_server_initiated_renegotiation(),
            Side::Server => policy.allow_client_initiated_renegotiation(),
        };
        let previous = Previous::of(active);
        let allowed = self.status == Status::Open
            && allowed_by_side
            && previous.permits_renegotiation(policy);

        match self.side {
            Side::Client => {
                // HelloRequest is only a prompt, never part of a transcript.
                self.io.next_message()?;
                if !allowed {
                    warn!("Refusing server initiated renegotiation");
                    return self.send_alert(Alert::warning(AlertDescription::NoRenegotiation));
                }
                debug!("Server requested renegotiation");
                self.start(Handshake::Client(ClientHandshake::new(Some(previous), false)));
            }
            Side::Server => {
                if !allowed {
                    self.io.next_message()?;
                    warn!("Refusing client initiated renegotiation");
                    return self.send_alert(Alert::warning(AlertDescription::NoRenegotiation));
                }
                debug!("Client started renegotiation");
                self.start(Handshake::Server(ServerHandshake::new(Some(previous), false, false)));
            }
        }
        Ok(())
    }

    fn drive(&mut self) -> Result<(), Error> {
        let Some(handshake) = self.handshake.as_mut() else {
            return Ok(());
        };
        let mut cx = Context {
            config: &self.config,
            record: &mut self.record,
            io: &mut self.io,
            callbacks: &mut self.callbacks,
        };
        handshake.make_progress(&mut cx)?;
        let established = handshake.take_established();

        if let Some(established) = established {
            self.complete(established);
        }
        Ok(())
    }

    fn complete(&mut self, established: Established) {
        self.handshake = None;
        self.handshake_timeout = Timeout::Disabled;
        self.io.handshake_complete();

        let session = &established.session;
        debug!(
            "Established {} {:?}{}",
            session.version(),
            session.ciphersuite(),
            if established.resumed { " (resumed)" } else { "" }
        );
        if self.callbacks.on_session(session) {
            self.config.session_manager().save(session);
        }
        self.active = Some(established);
    }

    fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        if self.config.datagram() {
            let max = self.record.max_datagram_payload();
            for chunk in data.chunks(max) {
                self.record.send(ContentType::ApplicationData, chunk)?;
                // One record per datagram.
                self.flush();
            }
            return Ok(());
        }

        // 1/n-1 split against chained IVs.
        if self.record.write_uses_implicit_iv() && data.len() > 1 {
            self.record.send(ContentType::ApplicationData, &data[..1])?;
            return self.record.send(ContentType::ApplicationData, &data[1..]);
        }
        self.record.send(ContentType::ApplicationData, data)
    }
}
