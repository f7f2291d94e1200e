use std::fmt;
use std::time::SystemTime;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::{Choice, ConditionallySelectable};
use zeroize::Zeroizing;

use super::io::Message;
use super::{
    check_finished, choose_signing, cipher_states, finished_data, master_secret, parse_message,
    peer_key, psk_premaster, random_bytes, send_message, unexpected, verify_hash, Context,
    Established, Previous, Signing, DEFAULT_GROUPS,
};
use crate::crypto::hash::digest;
use crate::crypto::prf::MASTER_SECRET_LEN;
use crate::crypto::{kx, KeyAgreement, PeerKey, Transcript};
use crate::message::{
    Body, Certificate, CertificateRequest, ClientHello, ClientKeyExchange, DigitallySigned,
    EcdheParams, Extension, ExtensionType, Extensions, Finished, HandshakeType, HelloVerifyRequest,
    NewSessionTicket, ServerHello, ServerKeyExchange, EC_POINT_FORMAT_UNCOMPRESSED,
};
use crate::record::CipherState;
use crate::session::Session;
use crate::types::{
    CipherSuite, CompressionMethod, KeyExchangeAlgorithm, NamedGroup, ProtocolVersion, Random,
    SessionId, Side, SignatureAlgorithm,
};
use crate::Error;

/// Random key for PSK lookups that miss, when hiding unknown identities.
const HIDDEN_PSK_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendHelloRequest,
    AwaitClientHello,
    SendServerFlight,
    SendResumeFlight,
    AwaitCertificate,
    AwaitClientKeyExchange,
    AwaitCertificateVerify,
    AwaitChangeCipherSpec,
    AwaitFinished,
    SendFinalFlight,
    Done,
}

/// What the server settled on for a full handshake.
struct Selection {
    suite: CipherSuite,
    group: Option<NamedGroup>,
    signing: Option<Signing>,
}

pub(crate) struct ServerHandshake {
    state: State,
    previous: Option<Previous>,
    force_full: bool,
    transcript: Transcript,
    /// Keys the stateless DTLS cookie.
    cookie_secret: Zeroizing<[u8; 32]>,

    client_hello: Option<ClientHello>,
    version: ProtocolVersion,
    suite: Option<CipherSuite>,
    server_random: [u8; 32],
    session_id: SessionId,
    resume: Option<Session>,
    resumed: bool,
    group: Option<NamedGroup>,
    signing: Option<Signing>,
    extended_master_secret: bool,
    encrypt_then_mac: bool,
    issue_ticket: bool,
    application_protocol: Option<Vec<u8>>,
    secure_renegotiation: bool,
    certificate_requested: bool,

    kx: Option<Box<dyn KeyAgreement>>,
    client_chain: Vec<Vec<u8>>,
    client_key: Option<PeerKey>,

    master_secret: Option<Zeroizing<[u8; MASTER_SECRET_LEN]>>,
    pending_read: Option<CipherState>,
    pending_write: Option<CipherState>,
    client_verify_data: Vec<u8>,
    server_verify_data: Vec<u8>,
    established: Option<Established>,
}

impl fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("state", &self.state)
            .field("version", &self.version)
            .field("suite", &self.suite)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

impl ServerHandshake {
    /// A handshake that waits for the client's hello.
    ///
    /// With `hello_request` the server asks for it first, which is how a
    /// server starts a renegotiation.
    pub fn new(previous: Option<Previous>, force_full: bool, hello_request: bool) -> Self {
        let mut cookie_secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut cookie_secret[..]);
        ServerHandshake {
            state: if hello_request {
                State::SendHelloRequest
            } else {
                State::AwaitClientHello
            },
            previous,
            force_full,
            transcript: Transcript::new(),
            cookie_secret,
            client_hello: None,
            version: ProtocolVersion::TLS1_2,
            suite: None,
            server_random: [0; 32],
            session_id: SessionId::empty(),
            resume: None,
            resumed: false,
            group: None,
            signing: None,
            extended_master_secret: false,
            encrypt_then_mac: false,
            issue_ticket: false,
            application_protocol: None,
            secure_renegotiation: false,
            certificate_requested: false,
            kx: None,
            client_chain: Vec::new(),
            client_key: None,
            master_secret: None,
            pending_read: None,
            pending_write: None,
            client_verify_data: Vec::new(),
            server_verify_data: Vec::new(),
            established: None,
        }
    }

    pub fn is_renegotiation(&self) -> bool {
        self.previous.is_some()
    }

    pub fn awaits_finished(&self) -> bool {
        self.state == State::AwaitFinished
    }

    pub fn take_established(&mut self) -> Option<Established> {
        self.established.take()
    }

    pub fn make_progress(&mut self, cx: &mut Context) -> Result<(), Error> {
        loop {
            let prev_state = self.state;
            let prev_received = cx.io.received();

            self.state = match self.state {
                State::SendHelloRequest => self.send_hello_request(cx)?,
                State::AwaitClientHello => self.await_client_hello(cx)?,
                State::SendServerFlight => self.send_server_flight(cx)?,
                State::SendResumeFlight => self.send_resume_flight(cx)?,
                State::AwaitCertificate => self.await_certificate(cx)?,
                State::AwaitClientKeyExchange => self.await_client_key_exchange(cx)?,
                State::AwaitCertificateVerify => self.await_certificate_verify(cx)?,
                State::AwaitChangeCipherSpec => self.await_change_cipher_spec(cx)?,
                State::AwaitFinished => self.await_finished(cx)?,
                State::SendFinalFlight => self.send_final_flight(cx)?,
                State::Done => State::Done,
            };

            if self.state != prev_state {
                trace!("{:?} -> {:?}", prev_state, self.state);
            } else if cx.io.received() == prev_received {
                break;
            }
        }
        Ok(())
    }

    pub fn change_cipher_spec(&mut self, cx: &mut Context) -> Result<(), Error> {
        if self.state != State::AwaitChangeCipherSpec {
            if cx.config.datagram() {
                trace!("Ignoring ChangeCipherSpec in {:?}", self.state);
                return Ok(());
            }
            return Err(Error::UnexpectedMessage(format!(
                "ChangeCipherSpec in {:?}",
                self.state
            )));
        }
        if cx.io.has_partial() {
            return Err(Error::UnexpectedMessage(
                "ChangeCipherSpec inside a handshake message".into(),
            ));
        }
        let read = self
            .pending_read
            .take()
            .ok_or_else(|| Error::InternalError("No pending read state".into()))?;
        cx.record.install_read(read)?;
        trace!("{:?} -> {:?}", self.state, State::AwaitFinished);
        self.state = State::AwaitFinished;
        Ok(())
    }

    fn parse(&self, cx: &Context, msg: &Message) -> Result<Body, Error> {
        parse_message(msg, cx.config.datagram(), self.version, self.suite)
    }

    fn next_body(&mut self, cx: &mut Context) -> Result<Option<(Message, Body)>, Error> {
        let Some(msg) = cx.io.next_message()? else {
            return Ok(None);
        };
        let body = self.parse(cx, &msg)?;
        Ok(Some((msg, body)))
    }

    fn suite(&self) -> Result<CipherSuite, Error> {
        self.suite
            .ok_or_else(|| Error::InternalError("No ciphersuite negotiated".into()))
    }

    fn client_random(&self) -> Result<[u8; 32], Error> {
        self.client_hello
            .as_ref()
            .map(|h| *h.random.as_bytes())
            .ok_or_else(|| Error::InternalError("No ClientHello received".into()))
    }

    fn send_hello_request(&mut self, cx: &mut Context) -> Result<State, Error> {
        cx.io.start_handshake(cx.record.read_epoch());
        cx.io.flight_begin();
        // HelloRequest is not part of the transcript.
        cx.io
            .send_message(cx.record, HandshakeType::HelloRequest, &[])?;
        cx.io.flight_end(true);
        debug!("Sent HelloRequest");
        Ok(State::AwaitClientHello)
    }

    /// HMAC over the parts of the hello a client repeats unchanged.
    fn cookie(&self, hello: &ClientHello) -> Result<Vec<u8>, Error> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.cookie_secret[..])
            .map_err(|_| Error::InternalError("Cookie key".into()))?;
        let mut buf = Vec::with_capacity(128);
        hello.version.serialize(&mut buf);
        hello.random.serialize(&mut buf);
        hello.session_id.serialize(&mut buf);
        for s in &hello.cipher_suites {
            buf.extend_from_slice(&s.as_u16().to_be_bytes());
        }
        for c in &hello.compression_methods {
            buf.push(c.as_u8());
        }
        mac.update(&buf);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn await_client_hello(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some(msg) = cx.io.next_message()? else {
            return Ok(self.state);
        };
        let body = parse_message(&msg, cx.config.datagram(), cx.config.version(), None)?;
        let Body::ClientHello(hello) = body else {
            return Err(unexpected(&body, self.state));
        };

        if cx.config.datagram() && self.previous.is_none() {
            let expected = self.cookie(&hello)?;
            if hello.cookie.as_deref() != Some(expected.as_slice()) {
                debug!("Sending HelloVerifyRequest");
                let hvr = HelloVerifyRequest {
                    version: ProtocolVersion::DTLS1_0,
                    cookie: expected,
                };
                let mut buf = Vec::new();
                Body::HelloVerifyRequest(hvr).serialize(&mut buf, ProtocolVersion::DTLS1_0);
                cx.io.flight_begin();
                cx.io
                    .send_message(cx.record, HandshakeType::HelloVerifyRequest, &buf)?;
                cx.io.flight_end(false);
                return Ok(State::AwaitClientHello);
            }
        }

        self.transcript.update(&msg.raw);
        self.handle_client_hello(cx, hello)
    }

    fn negotiate_version(&self, cx: &Context, hello: &ClientHello) -> Result<ProtocolVersion, Error> {
        let policy = cx.config.policy();
        let datagram = cx.config.datagram();
        let offered = hello.version;
        if offered.is_datagram() != datagram {
            return Err(Error::ProtocolVersion(offered));
        }

        if let Some(previous) = &self.previous {
            if previous.version.is_newer_than(offered) {
                return Err(Error::ProtocolVersion(offered));
            }
            return Ok(previous.version);
        }

        let latest = policy
            .latest_supported_version(datagram)
            .ok_or(Error::ProtocolVersion(offered))?;
        let version = if offered.is_newer_than(latest) {
            latest
        } else {
            offered
        };
        if !policy.acceptable_protocol_version(version) {
            return Err(Error::ProtocolVersion(version));
        }
        if hello.offers_fallback_scsv() && latest.is_newer_than(offered) {
            return Err(Error::InappropriateFallback);
        }
        Ok(version)
    }

    fn check_renegotiation_info(&mut self, hello: &ClientHello) -> Result<(), Error> {
        let info = hello.extensions.renegotiation_info();
        match &self.previous {
            None => {
                if info.map(|i| !i.is_empty()).unwrap_or(false) {
                    return Err(Error::HandshakeFailure(
                        "Non-empty renegotiation_info on initial handshake".into(),
                    ));
                }
                self.secure_renegotiation = hello.secure_renegotiation();
            }
            Some(previous) if previous.secure_renegotiation => {
                if hello.offers_renegotiation_scsv() {
                    return Err(Error::HandshakeFailure(
                        "Renegotiation SCSV during renegotiation".into(),
                    ));
                }
                if info != Some(previous.client_verify_data.as_slice()) {
                    return Err(Error::HandshakeFailure(
                        "renegotiation_info does not match".into(),
                    ));
                }
                self.secure_renegotiation = true;
            }
            Some(_) => {
                if hello.secure_renegotiation() {
                    return Err(Error::HandshakeFailure(
                        "Secure renegotiation after insecure handshake".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn handle_client_hello(&mut self, cx: &mut Context, hello: ClientHello) -> Result<State, Error> {
        let config = cx.config;
        let policy = config.policy();

        let version = self.negotiate_version(cx, &hello)?;
        if !hello.offers_null_compression() {
            return Err(Error::IllegalParameter(
                "Client does not offer null compression".into(),
            ));
        }
        self.check_renegotiation_info(&hello)?;

        self.version = version;
        self.extended_master_secret = policy.negotiate_extended_master_secret()
            && hello.extensions.has(ExtensionType::ExtendedMasterSecret);
        self.server_random = *Random::new(policy.include_time_in_hello_random()).as_bytes();
        cx.record.set_write_version(version);
        cx.record.set_read_version(version);

        if let Some(protocols) = hello.extensions.alpn() {
            if let Some(chosen) = cx.callbacks.choose_application_protocol(protocols) {
                if !protocols.contains(&chosen) {
                    return Err(Error::NoApplicationProtocol);
                }
                self.application_protocol = Some(chosen);
            }
        }

        let ticket_key = config.credentials().session_ticket_key();
        self.issue_ticket = ticket_key.is_some() && hello.extensions.session_ticket().is_some();

        let resumed = self.try_resume(cx, &hello, version);
        let next = if let Some(session) = resumed {
            debug!("Resuming session {:?}", session.id());
            self.suite = Some(session.ciphersuite());
            self.encrypt_then_mac = session.encrypt_then_mac();
            let mut ms = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
            ms.copy_from_slice(session.master_secret());
            self.master_secret = Some(ms);
            self.client_chain = session.peer_certificates().to_vec();
            self.session_id = hello.session_id.clone();
            self.resume = Some(session);
            self.resumed = true;
            State::SendResumeFlight
        } else {
            let selection = self.select(cx, &hello, version)?;
            self.suite = Some(selection.suite);
            self.group = selection.group;
            self.signing = selection.signing;
            self.encrypt_then_mac = policy.negotiate_encrypt_then_mac()
                && hello.extensions.has(ExtensionType::EncryptThenMac)
                && selection.suite.is_cbc();
            self.session_id = SessionId::random();
            State::SendServerFlight
        };

        debug!("Negotiated {} with {:?}", version, self.suite);
        self.client_hello = Some(hello);
        Ok(next)
    }

    fn try_resume(&self, cx: &Context, hello: &ClientHello, version: ProtocolVersion) -> Option<Session> {
        let config = cx.config;
        let policy = config.policy();
        if self.force_full
            || (self.previous.is_some() && !policy.allow_resumption_for_renegotiation())
            || hello.session_id.is_empty()
        {
            return None;
        }

        let ticket = hello.extensions.session_ticket().filter(|t| !t.is_empty());
        let session = match (ticket, config.credentials().session_ticket_key()) {
            (Some(ticket), Some(key)) => {
                let s = Session::open(&key, ticket);
                if s.is_none() {
                    debug!("Ignoring ticket that does not open");
                }
                s.filter(|s| !s.is_expired(policy.session_ticket_lifetime()))?
            }
            _ => config.session_manager().load(&hello.session_id)?,
        };

        let sni_matches = session.server_name() == hello.extensions.server_name().filter(|n| !n.is_empty());
        let usable = session.side() == Side::Server
            && session.version() == version
            && hello.offers(session.ciphersuite())
            && policy.ciphersuite_list(version).contains(&session.ciphersuite())
            && session.extended_master_secret() == self.extended_master_secret
            && sni_matches
            && (!session.encrypt_then_mac() || hello.extensions.has(ExtensionType::EncryptThenMac));
        if !usable {
            debug!("Session {:?} not resumable here", session.id());
            return None;
        }
        Some(session)
    }

    fn select(&self, cx: &Context, hello: &ClientHello, version: ProtocolVersion) -> Result<Selection, Error> {
        let policy = cx.config.policy();
        let ours = policy.ciphersuite_list(version);
        let candidates: Vec<CipherSuite> = if policy.server_uses_own_ciphersuite_preferences() {
            ours.iter().copied().filter(|s| hello.offers(*s)).collect()
        } else {
            hello
                .cipher_suites
                .iter()
                .copied()
                .filter(|s| ours.contains(s))
                .collect()
        };

        candidates
            .into_iter()
            .find_map(|suite| self.usable(cx, hello, version, suite))
            .ok_or_else(|| Error::HandshakeFailure("No ciphersuite in common".into()))
    }

    fn usable(
        &self,
        cx: &Context,
        hello: &ClientHello,
        version: ProtocolVersion,
        suite: CipherSuite,
    ) -> Option<Selection> {
        let credentials = cx.config.credentials();
        let kex = suite.key_exchange()?;
        if kex == KeyExchangeAlgorithm::Psk && !credentials.has_psk(Side::Server) {
            return None;
        }

        let mut signing = None;
        if let Some(algorithm) = suite.authentication() {
            let sni = hello.extensions.server_name();
            if credentials.cert_chain(algorithm, Side::Server, sni).is_empty() {
                return None;
            }
            if kex == KeyExchangeAlgorithm::Ecdhe {
                signing = Some(choose_signing(
                    version,
                    algorithm,
                    &credentials.signature_schemes(algorithm, Side::Server),
                    hello.extensions.signature_algorithms(),
                )?);
            }
        }

        let mut group = None;
        if suite.is_ecc() {
            let offered = hello.extensions.supported_groups().unwrap_or(DEFAULT_GROUPS);
            group = Some(
                cx.config
                    .policy()
                    .key_exchange_groups()
                    .into_iter()
                    .find(|g| offered.contains(g) && kx::is_supported(*g))?,
            );
            if let Some(Extension::EcPointFormats(formats)) =
                hello.extensions.get(ExtensionType::EcPointFormats)
            {
                if !formats.contains(&EC_POINT_FORMAT_UNCOMPRESSED) {
                    return None;
                }
            }
        }

        Some(Selection {
            suite,
            group,
            signing,
        })
    }

    fn server_hello(&self) -> Result<ServerHello, Error> {
        let hello = self
            .client_hello
            .as_ref()
            .ok_or_else(|| Error::InternalError("No ClientHello received".into()))?;
        let suite = self.suite()?;

        let mut extensions = Extensions::new();
        if self.secure_renegotiation {
            let binding = match &self.previous {
                Some(p) => p.binding(),
                None => Vec::new(),
            };
            extensions.add(Extension::RenegotiationInfo(binding));
        }
        if !self.resumed && hello.extensions.server_name().is_some() {
            extensions.add(Extension::ServerName(String::new()));
        }
        if suite.is_ecc() && hello.extensions.has(ExtensionType::EcPointFormats) {
            extensions.add(Extension::EcPointFormats(vec![EC_POINT_FORMAT_UNCOMPRESSED]));
        }
        if let Some(p) = &self.application_protocol {
            extensions.add(Extension::Alpn(vec![p.clone()]));
        }
        if self.encrypt_then_mac {
            extensions.add(Extension::EncryptThenMac);
        }
        if self.extended_master_secret {
            extensions.add(Extension::ExtendedMasterSecret);
        }
        if self.issue_ticket {
            extensions.add(Extension::SessionTicket(Vec::new()));
        }

        Ok(ServerHello {
            version: self.version,
            random: Random::from_bytes(self.server_random),
            session_id: self.session_id.clone(),
            cipher_suite: suite,
            compression_method: CompressionMethod::Null,
            extensions,
        })
    }

    fn send_server_flight(&mut self, cx: &mut Context) -> Result<State, Error> {
        let config = cx.config;
        let credentials = config.credentials();
        let suite = self.suite()?;
        let version = self.version;
        let sni = self
            .client_hello
            .as_ref()
            .and_then(|h| h.extensions.server_name())
            .map(|s| s.to_string());

        cx.io.flight_begin();
        let server_hello = self.server_hello()?;
        send_message(cx, &mut self.transcript, version, &Body::ServerHello(server_hello))?;

        if let Some(algorithm) = suite.authentication() {
            let chain = credentials.cert_chain(algorithm, Side::Server, sni.as_deref());
            send_message(
                cx,
                &mut self.transcript,
                version,
                &Body::Certificate(Certificate { chain }),
            )?;
        }

        match suite.key_exchange() {
            Some(KeyExchangeAlgorithm::Ecdhe) => {
                let ske = self.ecdhe_params(cx)?;
                send_message(cx, &mut self.transcript, version, &Body::ServerKeyExchange(ske))?;
            }
            Some(KeyExchangeAlgorithm::Psk) => {
                if let Some(identity_hint) = credentials.psk_identity_hint() {
                    let ske = ServerKeyExchange::Psk { identity_hint };
                    send_message(cx, &mut self.transcript, version, &Body::ServerKeyExchange(ske))?;
                }
            }
            _ => {}
        }

        if config.request_client_certificate() && !suite.is_psk() {
            let request = CertificateRequest {
                certificate_types: vec![
                    SignatureAlgorithm::Ecdsa.certificate_type(),
                    SignatureAlgorithm::Rsa.certificate_type(),
                ],
                signature_schemes: config.policy().signature_schemes(),
                authorities: Vec::new(),
            };
            send_message(
                cx,
                &mut self.transcript,
                version,
                &Body::CertificateRequest(request),
            )?;
            self.certificate_requested = true;
        }

        send_message(cx, &mut self.transcript, version, &Body::ServerHelloDone)?;
        cx.io.flight_end(true);

        Ok(if self.certificate_requested {
            State::AwaitCertificate
        } else {
            State::AwaitClientKeyExchange
        })
    }

    fn ecdhe_params(&mut self, cx: &mut Context) -> Result<ServerKeyExchange, Error> {
        let group = self
            .group
            .ok_or_else(|| Error::InternalError("No group selected".into()))?;
        let signing = self
            .signing
            .ok_or_else(|| Error::InternalError("No signature scheme selected".into()))?;

        let kx = kx::start(group)?;
        let params = EcdheParams {
            group,
            public: kx.public_key().to_vec(),
        };
        self.kx = Some(kx);

        let content = params.signed_content(&self.client_random()?, &self.server_random);
        let signature = cx.config.credentials().sign(
            signing.algorithm,
            Side::Server,
            signing.hash,
            &digest(signing.hash, &content),
        )?;
        Ok(ServerKeyExchange::Ecdhe {
            params,
            signed: DigitallySigned {
                scheme: signing.scheme,
                signature,
            },
        })
    }

    fn send_resume_flight(&mut self, cx: &mut Context) -> Result<State, Error> {
        let version = self.version;
        self.derive_keys()?;

        cx.io.flight_begin();
        let server_hello = self.server_hello()?;
        send_message(cx, &mut self.transcript, version, &Body::ServerHello(server_hello))?;
        if self.issue_ticket {
            self.send_ticket(cx)?;
        }
        self.send_change_cipher_spec_and_finished(cx)?;
        cx.io.flight_end(true);

        Ok(State::AwaitChangeCipherSpec)
    }

    fn await_certificate(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some((msg, body)) = self.next_body(cx)? else {
            return Ok(self.state);
        };
        let Body::Certificate(Certificate { chain }) = body else {
            return Err(unexpected(&body, self.state));
        };
        self.transcript.update(&msg.raw);

        if chain.is_empty() {
            if cx.config.require_client_certificate() {
                return Err(Error::HandshakeFailure("Client sent no certificate".into()));
            }
            debug!("Client declined to authenticate");
            return Ok(State::AwaitClientKeyExchange);
        }

        let key = peer_key(cx, &chain, None)?;
        self.client_chain = chain;
        self.client_key = Some(key);
        Ok(State::AwaitClientKeyExchange)
    }

    fn await_client_key_exchange(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some((msg, body)) = self.next_body(cx)? else {
            return Ok(self.state);
        };
        let Body::ClientKeyExchange(cke) = body else {
            return Err(unexpected(&body, self.state));
        };

        let pre_master_secret = match cke {
            ClientKeyExchange::Ecdhe { public } => {
                let kx = self
                    .kx
                    .take()
                    .ok_or_else(|| Error::InternalError("No key agreement in progress".into()))?;
                kx.agree(&public)?
            }
            ClientKeyExchange::Rsa { encrypted } => self.rsa_premaster(cx, &encrypted)?,
            ClientKeyExchange::Psk { identity } => {
                let psk = match cx.config.credentials().psk(Side::Server, &identity) {
                    Some(psk) => psk,
                    None if cx.config.policy().hide_unknown_users() => {
                        debug!("Unknown PSK identity, continuing with a random key");
                        random_bytes(HIDDEN_PSK_LEN)
                    }
                    None => return Err(Error::UnknownPskIdentity),
                };
                psk_premaster(&psk)
            }
        };
        self.transcript.update(&msg.raw);

        let ms = master_secret(
            self.suite()?,
            self.version,
            &pre_master_secret,
            &self.client_random()?,
            &self.server_random,
            self.extended_master_secret,
            &self.transcript,
        )?;
        self.master_secret = Some(ms);
        self.derive_keys()?;

        Ok(if self.client_key.is_some() {
            State::AwaitCertificateVerify
        } else {
            State::AwaitChangeCipherSpec
        })
    }

    /// Decrypt the RSA premaster secret without revealing whether it was
    /// well formed. A bad one is replaced by random bytes and the handshake
    /// fails later at Finished.
    fn rsa_premaster(&self, cx: &Context, encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let offered = self
            .client_hello
            .as_ref()
            .map(|h| h.version)
            .ok_or_else(|| Error::InternalError("No ClientHello received".into()))?;

        let mut pms = random_bytes(48);
        pms[0] = offered.major();
        pms[1] = offered.minor();

        let decrypted = cx
            .config
            .credentials()
            .rsa_decrypt(encrypted)
            .unwrap_or_else(|_| Zeroizing::new(Vec::new()));
        let good = Choice::from((decrypted.len() == 48) as u8)
            & Choice::from((decrypted.first() == Some(&offered.major())) as u8)
            & Choice::from((decrypted.get(1) == Some(&offered.minor())) as u8);
        if let Some(decrypted) = decrypted.get(..48) {
            for (out, d) in pms.iter_mut().zip(decrypted) {
                out.conditional_assign(d, good);
            }
        }
        Ok(pms)
    }

    fn await_certificate_verify(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some((msg, body)) = self.next_body(cx)? else {
            return Ok(self.state);
        };
        let Body::CertificateVerify(verify) = body else {
            return Err(unexpected(&body, self.state));
        };
        let key = self
            .client_key
            .as_ref()
            .ok_or_else(|| Error::InternalError("No client key".into()))?;
        let hash = verify_hash(
            self.version,
            key,
            verify.signed.scheme,
            &cx.config.policy().signature_schemes(),
        )?;
        key.verify(hash, &self.transcript.hash(hash), &verify.signed.signature)?;
        self.transcript.update(&msg.raw);
        Ok(State::AwaitChangeCipherSpec)
    }

    fn await_change_cipher_spec(&mut self, cx: &mut Context) -> Result<State, Error> {
        if let Some(t) = cx.io.peek_type() {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} before ChangeCipherSpec",
                t
            )));
        }
        Ok(self.state)
    }

    fn await_finished(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some((msg, body)) = self.next_body(cx)? else {
            return Ok(self.state);
        };
        if cx.config.datagram() && msg.epoch != cx.record.read_epoch() {
            return Err(Error::UnexpectedMessage("Finished in old epoch".into()));
        }
        let Body::Finished(finished) = body else {
            return Err(unexpected(&body, self.state));
        };

        let ms = self
            .master_secret
            .as_ref()
            .ok_or_else(|| Error::InternalError("No master secret".into()))?;
        let expected = finished_data(
            self.suite()?,
            self.version,
            &ms[..],
            Side::Client,
            &self.transcript,
        )?;
        check_finished(&expected, &finished.verify_data)?;
        self.transcript.update(&msg.raw);
        self.client_verify_data = expected;

        if self.resumed {
            self.finish()
        } else {
            Ok(State::SendFinalFlight)
        }
    }

    fn send_final_flight(&mut self, cx: &mut Context) -> Result<State, Error> {
        cx.io.flight_begin();
        if self.issue_ticket {
            self.send_ticket(cx)?;
        }
        self.send_change_cipher_spec_and_finished(cx)?;
        cx.io.flight_end(false);
        self.finish()
    }

    fn send_ticket(&mut self, cx: &mut Context) -> Result<(), Error> {
        let Some(key) = cx.config.credentials().session_ticket_key() else {
            return Ok(());
        };
        let lifetime = cx.config.policy().session_ticket_lifetime();
        let session = self.session()?;
        let ticket = session.seal(&key)?;
        let nst = NewSessionTicket {
            lifetime_hint: u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX),
            ticket,
        };
        trace!("Issuing {} byte session ticket", nst.ticket.len());
        send_message(cx, &mut self.transcript, self.version, &Body::NewSessionTicket(nst))
    }

    fn derive_keys(&mut self) -> Result<(), Error> {
        let ms = self
            .master_secret
            .as_ref()
            .ok_or_else(|| Error::InternalError("No master secret".into()))?;
        let (read, write) = cipher_states(
            Side::Server,
            self.suite()?,
            self.version,
            &ms[..],
            &self.client_random()?,
            &self.server_random,
            self.encrypt_then_mac,
        )?;
        self.pending_read = Some(read);
        self.pending_write = Some(write);
        Ok(())
    }

    fn send_change_cipher_spec_and_finished(&mut self, cx: &mut Context) -> Result<(), Error> {
        let write = self
            .pending_write
            .take()
            .ok_or_else(|| Error::InternalError("No pending write state".into()))?;
        cx.io.send_change_cipher_spec(cx.record)?;
        cx.record.install_write(write)?;

        let ms = self
            .master_secret
            .as_ref()
            .ok_or_else(|| Error::InternalError("No master secret".into()))?;
        let verify_data = finished_data(
            self.suite()?,
            self.version,
            &ms[..],
            Side::Server,
            &self.transcript,
        )?;
        self.server_verify_data = verify_data.clone();
        send_message(
            cx,
            &mut self.transcript,
            self.version,
            &Body::Finished(Finished { verify_data }),
        )
    }

    /// The session this handshake establishes.
    fn session(&self) -> Result<Session, Error> {
        let master_secret = self
            .master_secret
            .clone()
            .ok_or_else(|| Error::InternalError("No master secret".into()))?;
        let start_time = match &self.resume {
            Some(s) => s.start_time(),
            None => SystemTime::now(),
        };
        let server_name = self
            .client_hello
            .as_ref()
            .and_then(|h| h.extensions.server_name())
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string());
        Ok(Session {
            id: self.session_id.clone(),
            ticket: Vec::new(),
            master_secret,
            version: self.version,
            suite: self.suite()?,
            compression: CompressionMethod::Null,
            peer_certificates: self.client_chain.clone(),
            start_time,
            server_name,
            extended_master_secret: self.extended_master_secret,
            encrypt_then_mac: self.encrypt_then_mac,
            side: Side::Server,
            lifetime_hint: 0,
        })
    }

    fn finish(&mut self) -> Result<State, Error> {
        let session = self.session()?;
        debug!("Handshake complete: {:?}", session);
        self.master_secret = None;
        self.established = Some(Established {
            session,
            application_protocol: self.application_protocol.take(),
            secure_renegotiation: self.secure_renegotiation,
            client_verify_data: std::mem::take(&mut self.client_verify_data),
            server_verify_data: std::mem::take(&mut self.server_verify_data),
            resumed: self.resumed,
        });
        Ok(State::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertDescription;
    use crate::types::EMPTY_RENEGOTIATION_INFO_SCSV;

    fn hello(cookie: Option<Vec<u8>>) -> ClientHello {
        ClientHello {
            version: ProtocolVersion::DTLS1_2,
            random: Random::from_bytes([9; 32]),
            session_id: SessionId::empty(),
            cookie,
            cipher_suites: vec![CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256],
            compression_methods: vec![CompressionMethod::Null],
            extensions: Extensions::new(),
        }
    }

    #[test]
    fn cookie_ignores_cookie_field() {
        let hs = ServerHandshake::new(None, false, false);
        let a = hs.cookie(&hello(Some(vec![]))).unwrap();
        let b = hs.cookie(&hello(Some(a.clone()))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let mut other = hello(None);
        other.random = Random::from_bytes([1; 32]);
        assert_ne!(hs.cookie(&other).unwrap(), a);

        // Each handshake keys its own cookies.
        let hs2 = ServerHandshake::new(None, false, false);
        assert_ne!(hs2.cookie(&hello(None)).unwrap(), a);
    }

    fn previous(secure: bool) -> Previous {
        Previous {
            version: ProtocolVersion::DTLS1_2,
            secure_renegotiation: secure,
            client_verify_data: vec![4; 12],
            server_verify_data: vec![5; 12],
        }
    }

    fn with_info(info: Option<Vec<u8>>) -> ClientHello {
        let mut h = hello(None);
        if let Some(info) = info {
            h.extensions.add(Extension::RenegotiationInfo(info));
        }
        h
    }

    #[test]
    fn initial_hello_records_secure_renegotiation() {
        let mut hs = ServerHandshake::new(None, false, false);
        hs.check_renegotiation_info(&with_info(Some(vec![]))).unwrap();
        assert!(hs.secure_renegotiation);

        let mut hs = ServerHandshake::new(None, false, false);
        hs.check_renegotiation_info(&with_info(None)).unwrap();
        assert!(!hs.secure_renegotiation);

        let mut hs = ServerHandshake::new(None, false, false);
        let err = hs
            .check_renegotiation_info(&with_info(Some(vec![4; 12])))
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailure(_)), "{:?}", err);
    }

    #[test]
    fn renegotiation_accepts_client_verify_data() {
        let mut hs = ServerHandshake::new(Some(previous(true)), false, false);
        hs.check_renegotiation_info(&with_info(Some(vec![4; 12]))).unwrap();
        assert!(hs.secure_renegotiation);
    }

    #[test]
    fn renegotiation_rejects_wrong_or_missing_binding() {
        let mut wrong = vec![4; 12];
        wrong[0] ^= 1;
        for info in [Some(wrong), Some(vec![]), Some(vec![4; 24]), None] {
            let mut hs = ServerHandshake::new(Some(previous(true)), false, false);
            let err = hs.check_renegotiation_info(&with_info(info)).unwrap_err();
            assert!(matches!(err, Error::HandshakeFailure(_)), "{:?}", err);
            assert_eq!(err.alert(), Some(AlertDescription::HandshakeFailure));
        }
    }

    #[test]
    fn renegotiation_rejects_scsv() {
        let mut h = with_info(Some(vec![4; 12]));
        h.cipher_suites
            .push(CipherSuite::from_u16(EMPTY_RENEGOTIATION_INFO_SCSV));
        let mut hs = ServerHandshake::new(Some(previous(true)), false, false);
        let err = hs.check_renegotiation_info(&h).unwrap_err();
        assert!(matches!(err, Error::HandshakeFailure(_)), "{:?}", err);
    }

    #[test]
    fn insecure_previous_rejects_late_binding() {
        let mut hs = ServerHandshake::new(Some(previous(false)), false, false);
        hs.check_renegotiation_info(&with_info(None)).unwrap();
        assert!(!hs.secure_renegotiation);

        for info in [Some(vec![]), Some(vec![4; 12])] {
            let mut hs = ServerHandshake::new(Some(previous(false)), false, false);
            let err = hs.check_renegotiation_info(&with_info(info)).unwrap_err();
            assert!(matches!(err, Error::HandshakeFailure(_)), "{:?}", err);
        }
    }
}
