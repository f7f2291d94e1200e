use std::fmt;
use std::time::SystemTime;

use zeroize::Zeroizing;

use super::io::Message;
use super::{
    check_finished, choose_signing, cipher_states, finished_data, master_secret, parse_message,
    peer_key, psk_premaster, random_bytes, send_message, unexpected, verify_hash, Context,
    Established, Previous, Signing,
};
use crate::crypto::hash::digest;
use crate::crypto::prf::MASTER_SECRET_LEN;
use crate::crypto::{kx, PeerKey, Transcript};
use crate::message::{
    Body, Certificate, CertificateRequest, CertificateVerify, ClientHello, ClientKeyExchange,
    DigitallySigned, EcdheParams, Extension, ExtensionType, Extensions, Finished, HandshakeType,
    NewSessionTicket, ServerHello, ServerKeyExchange, EC_POINT_FORMAT_UNCOMPRESSED,
};
use crate::record::CipherState;
use crate::session::Session;
use crate::types::{
    CipherSuite, CompressionMethod, KeyExchangeAlgorithm, NamedGroup, ProtocolVersion, Random,
    SessionId, Side, SignatureAlgorithm, FALLBACK_SCSV,
};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendClientHello,
    AwaitServerHello,
    AwaitCertificate,
    AwaitServerKeyExchange,
    AwaitCertificateRequest,
    AwaitServerHelloDone,
    SendClientFlight,
    AwaitNewSessionTicket,
    AwaitChangeCipherSpec,
    AwaitFinished,
    SendFinished,
    Done,
}

pub(crate) struct ClientHandshake {
    state: State,
    previous: Option<Previous>,
    force_full: bool,
    transcript: Transcript,

    /// Kept for a repeat after HelloVerifyRequest.
    hello: Option<ClientHello>,
    resume: Option<Session>,
    resumed: bool,

    version: ProtocolVersion,
    suite: Option<CipherSuite>,
    server_random: [u8; 32],
    session_id: SessionId,
    extended_master_secret: bool,
    encrypt_then_mac: bool,
    expect_ticket: bool,
    new_ticket: Option<NewSessionTicket>,
    application_protocol: Option<Vec<u8>>,
    secure_renegotiation: bool,

    server_chain: Vec<Vec<u8>>,
    server_key: Option<PeerKey>,
    server_params: Option<EcdheParams>,
    psk_hint: Option<Vec<u8>>,
    cert_request: Option<CertificateRequest>,

    master_secret: Option<Zeroizing<[u8; MASTER_SECRET_LEN]>>,
    pending_read: Option<CipherState>,
    pending_write: Option<CipherState>,
    client_verify_data: Vec<u8>,
    server_verify_data: Vec<u8>,
    established: Option<Established>,
}

impl fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("state", &self.state)
            .field("version", &self.version)
            .field("suite", &self.suite)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

impl ClientHandshake {
    /// A handshake that starts by sending a ClientHello.
    ///
    /// `previous` is set when renegotiating, `force_full` skips resumption.
    pub fn new(previous: Option<Previous>, force_full: bool) -> Self {
        ClientHandshake {
            state: State::SendClientHello,
            previous,
            force_full,
            transcript: Transcript::new(),
            hello: None,
            resume: None,
            resumed: false,
            version: ProtocolVersion::TLS1_2,
            suite: None,
            server_random: [0; 32],
            session_id: SessionId::empty(),
            extended_master_secret: false,
            encrypt_then_mac: false,
            expect_ticket: false,
            new_ticket: None,
            application_protocol: None,
            secure_renegotiation: false,
            server_chain: Vec::new(),
            server_key: None,
            server_params: None,
            psk_hint: None,
            cert_request: None,
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
                State::SendClientHello => self.send_client_hello(cx)?,
                State::AwaitServerHello => self.await_server_hello(cx)?,
                State::AwaitCertificate => self.await_certificate(cx)?,
                State::AwaitServerKeyExchange => self.await_server_key_exchange(cx)?,
                State::AwaitCertificateRequest => self.await_certificate_request(cx)?,
                State::AwaitServerHelloDone => self.await_server_hello_done(cx)?,
                State::SendClientFlight => self.send_client_flight(cx)?,
                State::AwaitNewSessionTicket => self.await_new_session_ticket(cx)?,
                State::AwaitChangeCipherSpec => self.await_change_cipher_spec(cx)?,
                State::AwaitFinished => self.await_finished(cx)?,
                State::SendFinished => self.send_finished(cx)?,
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
                // Repeated or reordered, the flight timer sorts it out.
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

    /// The next message from the server, skipping HelloRequest.
    ///
    /// A server may send HelloRequest at any time, a client in the middle
    /// of a handshake ignores it.
    fn next_message(&mut self, cx: &mut Context) -> Result<Option<Message>, Error> {
        loop {
            let Some(msg) = cx.io.next_message()? else {
                return Ok(None);
            };
            if msg.msg_type == HandshakeType::HelloRequest {
                trace!("Ignoring HelloRequest during handshake");
                continue;
            }
            return Ok(Some(msg));
        }
    }

    fn parse(&self, cx: &Context, msg: &Message) -> Result<Body, Error> {
        parse_message(msg, cx.config.datagram(), self.version, self.suite)
    }

    fn suite(&self) -> Result<CipherSuite, Error> {
        self.suite
            .ok_or_else(|| Error::InternalError("No ciphersuite negotiated".into()))
    }

    fn build_hello(&mut self, cx: &mut Context) -> ClientHello {
        let config = cx.config;
        let policy = config.policy();
        let version = match &self.previous {
            Some(p) => p.version,
            None => config.version(),
        };

        let has_psk = config.credentials().has_psk(Side::Client);
        let mut cipher_suites: Vec<CipherSuite> = policy
            .ciphersuite_list(version)
            .into_iter()
            .filter(|s| !s.is_psk() || has_psk)
            .collect();

        let resume = self.find_session(cx, version, &cipher_suites);

        let mut extensions = Extensions::new();
        if let Some(name) = config.server_name() {
            extensions.add(Extension::ServerName(name.to_string()));
        }
        if cipher_suites.iter().any(|s| s.is_ecc()) {
            let groups: Vec<NamedGroup> = policy
                .key_exchange_groups()
                .into_iter()
                .filter(|g| kx::is_supported(*g))
                .collect();
            extensions.add(Extension::SupportedGroups(groups));
            extensions.add(Extension::EcPointFormats(vec![EC_POINT_FORMAT_UNCOMPRESSED]));
        }
        if version.supports_negotiable_signature_algorithms() {
            extensions.add(Extension::SignatureAlgorithms(policy.signature_schemes()));
        }
        if !config.alpn_protocols().is_empty() {
            extensions.add(Extension::Alpn(config.alpn_protocols().to_vec()));
        }
        if policy.negotiate_encrypt_then_mac() && cipher_suites.iter().any(|s| s.is_cbc()) {
            extensions.add(Extension::EncryptThenMac);
        }
        if policy.negotiate_extended_master_secret() {
            extensions.add(Extension::ExtendedMasterSecret);
        }
        let ticket = resume.as_ref().map(|s| s.ticket().to_vec()).unwrap_or_default();
        extensions.add(Extension::SessionTicket(ticket));
        if let Some(binding) = self.renegotiation_binding() {
            extensions.add(Extension::RenegotiationInfo(binding));
        }

        if self.previous.is_none() && policy.send_fallback_scsv(version) {
            cipher_suites.push(CipherSuite::from_u16(FALLBACK_SCSV));
        }

        // A ticket needs some id the server can echo to signal acceptance.
        let session_id = match &resume {
            Some(s) if s.id().is_empty() => SessionId::random(),
            Some(s) => s.id().clone(),
            None => SessionId::empty(),
        };

        self.resume = resume;
        ClientHello {
            version,
            random: Random::new(policy.include_time_in_hello_random()),
            session_id,
            cookie: config.datagram().then(Vec::new),
            cipher_suites,
            compression_methods: vec![CompressionMethod::Null],
            extensions,
        }
    }

    fn find_session(
        &self,
        cx: &Context,
        version: ProtocolVersion,
        suites: &[CipherSuite],
    ) -> Option<Session> {
        let policy = cx.config.policy();
        if self.force_full
            || (self.previous.is_some() && !policy.allow_resumption_for_renegotiation())
        {
            return None;
        }
        let name = cx.config.server_name()?;
        let session = cx.config.session_manager().load_for_server(name)?;
        let usable = session.side() == Side::Client
            && session.version() == version
            && suites.contains(&session.ciphersuite())
            && session.extended_master_secret() == policy.negotiate_extended_master_secret()
            && (!session.encrypt_then_mac() || policy.negotiate_encrypt_then_mac());
        if !usable {
            trace!("Not resuming {:?}", session.id());
            return None;
        }
        debug!("Offering to resume session {:?}", session.id());
        Some(session)
    }

    fn send_client_hello(&mut self, cx: &mut Context) -> Result<State, Error> {
        let hello = match self.hello.take() {
            Some(h) => h,
            None => self.build_hello(cx),
        };
        self.version = hello.version;

        cx.io.flight_begin();
        send_message(
            cx,
            &mut self.transcript,
            hello.version,
            &Body::ClientHello(hello.clone()),
        )?;
        cx.io.flight_end(true);

        self.hello = Some(hello);
        Ok(State::AwaitServerHello)
    }

    fn await_server_hello(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some(msg) = self.next_message(cx)? else {
            return Ok(self.state);
        };
        match self.parse(cx, &msg)? {
            Body::HelloVerifyRequest(hvr) if cx.config.datagram() => {
                let Some(hello) = self.hello.as_mut() else {
                    return Err(Error::InternalError("No ClientHello to repeat".into()));
                };
                debug!("HelloVerifyRequest with {} byte cookie", hvr.cookie.len());
                hello.cookie = Some(hvr.cookie);
                // Neither the first ClientHello nor the request are hashed.
                self.transcript.reset();
                Ok(State::SendClientHello)
            }
            Body::ServerHello(sh) => {
                self.transcript.update(&msg.raw);
                self.handle_server_hello(cx, sh)
            }
            body => Err(unexpected(&body, self.state)),
        }
    }

    /// The renegotiation_info to send, if any.
    ///
    /// Empty on an initial handshake. A renegotiation after a handshake
    /// without secure renegotiation carries none at all.
    fn renegotiation_binding(&self) -> Option<Vec<u8>> {
        match &self.previous {
            None => Some(Vec::new()),
            Some(p) if p.secure_renegotiation => Some(p.client_verify_data.clone()),
            Some(_) => None,
        }
    }

    /// Whether the server hello completes secure renegotiation.
    fn check_renegotiation_info(&self, sh: &ServerHello) -> Result<bool, Error> {
        let renegotiation_info = sh.extensions.renegotiation_info();
        match &self.previous {
            None => {
                if renegotiation_info.map(|ri| !ri.is_empty()).unwrap_or(false) {
                    return Err(Error::HandshakeFailure(
                        "Non-empty renegotiation_info on initial handshake".into(),
                    ));
                }
                Ok(renegotiation_info.is_some())
            }
            Some(previous) if previous.secure_renegotiation => {
                if renegotiation_info != Some(previous.binding().as_slice()) {
                    return Err(Error::HandshakeFailure(
                        "renegotiation_info does not match".into(),
                    ));
                }
                Ok(true)
            }
            Some(_) => {
                if renegotiation_info.is_some() {
                    return Err(Error::HandshakeFailure(
                        "Unexpected renegotiation_info".into(),
                    ));
                }
                Ok(false)
            }
        }
    }

    fn handle_server_hello(&mut self, cx: &mut Context, sh: ServerHello) -> Result<State, Error> {
        let policy = cx.config.policy();
        let hello = self
            .hello
            .as_ref()
            .ok_or_else(|| Error::InternalError("No ClientHello sent".into()))?;

        let version = sh.version;
        let version_ok = version.is_datagram() == cx.config.datagram()
            && !version.is_newer_than(hello.version)
            && policy.acceptable_protocol_version(version)
            && self.previous.as_ref().map(|p| p.version == version).unwrap_or(true);
        if !version_ok {
            return Err(Error::ProtocolVersion(version));
        }

        let suite = sh.cipher_suite;
        if suite.is_scsv() || !hello.offers(suite) || !suite.usable_with(version) {
            return Err(Error::IllegalParameter(format!(
                "Server chose ciphersuite {:?} we did not offer",
                suite
            )));
        }
        if sh.compression_method != CompressionMethod::Null {
            return Err(Error::IllegalParameter("Server chose compression".into()));
        }

        for t in sh.extensions.types() {
            if !hello.extensions.has(t) {
                return Err(Error::UnsupportedExtension(format!("{:?}", t)));
            }
        }

        self.secure_renegotiation = self.check_renegotiation_info(&sh)?;

        if let Some(protocols) = sh.extensions.alpn() {
            let offered = hello.extensions.alpn().unwrap_or_default();
            match protocols {
                [p] if offered.contains(p) => self.application_protocol = Some(p.clone()),
                _ => {
                    return Err(Error::IllegalParameter(
                        "Server chose an ALPN protocol we did not offer".into(),
                    ))
                }
            }
        }

        self.extended_master_secret = sh.extensions.has(ExtensionType::ExtendedMasterSecret);
        self.encrypt_then_mac = sh.extensions.has(ExtensionType::EncryptThenMac) && suite.is_cbc();
        self.expect_ticket = sh.extensions.has(ExtensionType::SessionTicket);
        self.version = version;
        self.suite = Some(suite);
        self.server_random = *sh.random.as_bytes();
        self.session_id = sh.session_id.clone();

        cx.record.set_write_version(version);
        cx.record.set_read_version(version);
        debug!("Negotiated {} with {:?}", version, suite);

        let echoed = !sh.session_id.is_empty() && sh.session_id == hello.session_id;
        if let Some(session) = self.resume.take() {
            if echoed {
                if session.ciphersuite() != suite
                    || session.version() != version
                    || session.extended_master_secret() != self.extended_master_secret
                {
                    return Err(Error::HandshakeFailure(
                        "Resumed session parameters differ".into(),
                    ));
                }
                debug!("Resuming session {:?}", session.id());
                self.encrypt_then_mac = session.encrypt_then_mac();
                let mut ms = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
                ms.copy_from_slice(session.master_secret());
                self.master_secret = Some(ms);
                self.server_chain = session.peer_certificates().to_vec();
                self.resumed = true;
                self.resume = Some(session);
                self.derive_keys()?;
                return Ok(if self.expect_ticket {
                    State::AwaitNewSessionTicket
                } else {
                    State::AwaitChangeCipherSpec
                });
            }
            debug!("Server declined to resume {:?}", session.id());
            cx.config.session_manager().remove(session.id());
        }

        if suite.is_psk() {
            Ok(State::AwaitServerKeyExchange)
        } else {
            Ok(State::AwaitCertificate)
        }
    }

    fn await_certificate(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some(msg) = self.next_message(cx)? else {
            return Ok(self.state);
        };
        let Body::Certificate(Certificate { chain }) = self.parse(cx, &msg)? else {
            return Err(Error::UnexpectedMessage(format!(
                "{:?} in {:?}",
                msg.msg_type, self.state
            )));
        };
        self.transcript.update(&msg.raw);

        let suite = self.suite()?;
        let config = cx.config;
        let key = peer_key(cx, &chain, config.server_name())?;
        let wanted = match suite.key_exchange() {
            Some(KeyExchangeAlgorithm::Rsa) => Some(SignatureAlgorithm::Rsa),
            _ => suite.authentication(),
        };
        if Some(key.algorithm()) != wanted {
            return Err(Error::HandshakeFailure(format!(
                "{:?} certificate for {:?}",
                key.algorithm(),
                suite
            )));
        }
        self.server_chain = chain;
        self.server_key = Some(key);

        Ok(match suite.key_exchange() {
            Some(KeyExchangeAlgorithm::Ecdhe) => State::AwaitServerKeyExchange,
            _ => State::AwaitCertificateRequest,
        })
    }

    fn await_server_key_exchange(&mut self, cx: &mut Context) -> Result<State, Error> {
        let suite = self.suite()?;
        if suite.is_psk() {
            // The identity hint is optional.
            match cx.io.peek_type() {
                None => return Ok(self.state),
                Some(HandshakeType::ServerKeyExchange) => {}
                Some(_) => return Ok(State::AwaitServerHelloDone),
            }
        }

        let Some(msg) = self.next_message(cx)? else {
            return Ok(self.state);
        };
        let body = self.parse(cx, &msg)?;
        let Body::ServerKeyExchange(ske) = body else {
            return Err(unexpected(&body, self.state));
        };

        match ske {
            ServerKeyExchange::Psk { identity_hint } => {
                self.psk_hint = Some(identity_hint);
                self.transcript.update(&msg.raw);
                Ok(State::AwaitServerHelloDone)
            }
            ServerKeyExchange::Ecdhe { params, signed } => {
                self.verify_server_params(cx, &params, &signed)?;
                let offered = self
                    .hello
                    .as_ref()
                    .and_then(|h| h.extensions.supported_groups())
                    .unwrap_or_default();
                if !offered.contains(&params.group) {
                    return Err(Error::IllegalParameter(format!(
                        "Server chose group {:?} we did not offer",
                        params.group
                    )));
                }
                self.transcript.update(&msg.raw);
                self.server_params = Some(params);
                Ok(State::AwaitCertificateRequest)
            }
        }
    }

    fn verify_server_params(
        &self,
        cx: &Context,
        params: &EcdheParams,
        signed: &DigitallySigned,
    ) -> Result<(), Error> {
        let key = self
            .server_key
            .as_ref()
            .ok_or_else(|| Error::InternalError("No server key".into()))?;
        let client_random = self.client_random()?;
        let hash = verify_hash(
            self.version,
            key,
            signed.scheme,
            &cx.config.policy().signature_schemes(),
        )?;
        let content = params.signed_content(&client_random, &self.server_random);
        key.verify(hash, &digest(hash, &content), &signed.signature)
    }

    fn client_random(&self) -> Result<[u8; 32], Error> {
        self.hello
            .as_ref()
            .map(|h| *h.random.as_bytes())
            .ok_or_else(|| Error::InternalError("No ClientHello sent".into()))
    }

    fn await_certificate_request(&mut self, cx: &mut Context) -> Result<State, Error> {
        match cx.io.peek_type() {
            None => return Ok(self.state),
            Some(HandshakeType::CertificateRequest) => {}
            Some(_) => return Ok(State::AwaitServerHelloDone),
        }
        let Some(msg) = self.next_message(cx)? else {
            return Ok(self.state);
        };
        let body = self.parse(cx, &msg)?;
        let Body::CertificateRequest(request) = body else {
            return Err(unexpected(&body, self.state));
        };
        self.transcript.update(&msg.raw);
        self.cert_request = Some(request);
        Ok(State::AwaitServerHelloDone)
    }

    fn await_server_hello_done(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some(msg) = self.next_message(cx)? else {
            return Ok(self.state);
        };
        let body = self.parse(cx, &msg)?;
        if body != Body::ServerHelloDone {
            return Err(unexpected(&body, self.state));
        }
        self.transcript.update(&msg.raw);
        Ok(State::SendClientFlight)
    }

    /// Our certificate for the server's request: the chain and how to sign.
    fn choose_certificate(&self, cx: &Context) -> Option<(Vec<Vec<u8>>, Signing)> {
        let request = self.cert_request.as_ref()?;
        let credentials = cx.config.credentials();
        request
            .certificate_types
            .iter()
            .filter_map(|t| SignatureAlgorithm::from_certificate_type(*t))
            .find_map(|algorithm| {
                let chain = credentials.cert_chain(algorithm, Side::Client, cx.config.server_name());
                if chain.is_empty() {
                    return None;
                }
                let signing = choose_signing(
                    self.version,
                    algorithm,
                    &credentials.signature_schemes(algorithm, Side::Client),
                    Some(&request.signature_schemes),
                )?;
                Some((chain, signing))
            })
    }

    fn send_client_flight(&mut self, cx: &mut Context) -> Result<State, Error> {
        let suite = self.suite()?;
        let version = self.version;
        let client_random = self.client_random()?;

        cx.io.flight_begin();

        let mut signing = None;
        if self.cert_request.is_some() {
            let chain = match self.choose_certificate(cx) {
                Some((chain, s)) => {
                    signing = Some(s);
                    chain
                }
                None => {
                    debug!("No client certificate matches the request");
                    Vec::new()
                }
            };
            send_message(
                cx,
                &mut self.transcript,
                version,
                &Body::Certificate(Certificate { chain }),
            )?;
        }

        let (cke, pre_master_secret) = self.key_exchange(cx)?;
        send_message(
            cx,
            &mut self.transcript,
            version,
            &Body::ClientKeyExchange(cke),
        )?;

        let ms = master_secret(
            suite,
            version,
            &pre_master_secret,
            &client_random,
            &self.server_random,
            self.extended_master_secret,
            &self.transcript,
        )?;
        self.master_secret = Some(ms);

        if let Some(signing) = signing {
            let hash = self.transcript.hash(signing.hash);
            let signature = cx.config.credentials().sign(
                signing.algorithm,
                Side::Client,
                signing.hash,
                &hash,
            )?;
            let verify = CertificateVerify {
                signed: DigitallySigned {
                    scheme: signing.scheme,
                    signature,
                },
            };
            send_message(
                cx,
                &mut self.transcript,
                version,
                &Body::CertificateVerify(verify),
            )?;
        }

        self.derive_keys()?;
        self.send_change_cipher_spec_and_finished(cx)?;
        cx.io.flight_end(true);

        Ok(if self.expect_ticket {
            State::AwaitNewSessionTicket
        } else {
            State::AwaitChangeCipherSpec
        })
    }

    fn key_exchange(
        &mut self,
        cx: &mut Context,
    ) -> Result<(ClientKeyExchange, Zeroizing<Vec<u8>>), Error> {
        let suite = self.suite()?;
        match suite.key_exchange() {
            Some(KeyExchangeAlgorithm::Ecdhe) => {
                let params = self
                    .server_params
                    .take()
                    .ok_or_else(|| Error::InternalError("No server key exchange".into()))?;
                let kx = kx::start(params.group)?;
                let public = kx.public_key().to_vec();
                let pms = kx.agree(&params.public)?;
                Ok((ClientKeyExchange::Ecdhe { public }, pms))
            }
            Some(KeyExchangeAlgorithm::Rsa) => {
                let key = self
                    .server_key
                    .as_ref()
                    .ok_or_else(|| Error::InternalError("No server key".into()))?;
                // The version we offered, not the one negotiated.
                let offered = self.hello.as_ref().map(|h| h.version).unwrap_or(self.version);
                let mut pms = random_bytes(48);
                pms[0] = offered.major();
                pms[1] = offered.minor();
                let encrypted = key.encrypt(&pms)?;
                Ok((ClientKeyExchange::Rsa { encrypted }, pms))
            }
            Some(KeyExchangeAlgorithm::Psk) => {
                let credentials = cx.config.credentials();
                let identity = credentials
                    .psk_identity(self.psk_hint.as_deref())
                    .ok_or_else(|| Error::HandshakeFailure("No PSK identity".into()))?;
                let psk = credentials
                    .psk(Side::Client, &identity)
                    .ok_or_else(|| Error::HandshakeFailure("No PSK for identity".into()))?;
                Ok((ClientKeyExchange::Psk { identity }, psk_premaster(&psk)))
            }
            None => Err(Error::InternalError(format!("Unusable suite {:?}", suite))),
        }
    }

    fn derive_keys(&mut self) -> Result<(), Error> {
        let ms = self
            .master_secret
            .as_ref()
            .ok_or_else(|| Error::InternalError("No master secret".into()))?;
        let (read, write) = cipher_states(
            Side::Client,
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
            Side::Client,
            &self.transcript,
        )?;
        self.client_verify_data = verify_data.clone();
        send_message(
            cx,
            &mut self.transcript,
            self.version,
            &Body::Finished(Finished { verify_data }),
        )
    }

    fn await_new_session_ticket(&mut self, cx: &mut Context) -> Result<State, Error> {
        let Some(msg) = self.next_message(cx)? else {
            return Ok(self.state);
        };
        let body = self.parse(cx, &msg)?;
        let Body::NewSessionTicket(ticket) = body else {
            return Err(unexpected(&body, self.state));
        };
        self.transcript.update(&msg.raw);
        trace!("Got {} byte session ticket", ticket.ticket.len());
        self.new_ticket = Some(ticket);
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
        let Some(msg) = self.next_message(cx)? else {
            return Ok(self.state);
        };
        if cx.config.datagram() && msg.epoch != cx.record.read_epoch() {
            return Err(Error::UnexpectedMessage("Finished in old epoch".into()));
        }
        let body = self.parse(cx, &msg)?;
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
            Side::Server,
            &self.transcript,
        )?;
        check_finished(&expected, &finished.verify_data)?;
        self.transcript.update(&msg.raw);
        self.server_verify_data = expected;

        if self.resumed {
            Ok(State::SendFinished)
        } else {
            self.finish(cx)
        }
    }

    fn send_finished(&mut self, cx: &mut Context) -> Result<State, Error> {
        cx.io.flight_begin();
        self.send_change_cipher_spec_and_finished(cx)?;
        cx.io.flight_end(false);
        self.finish(cx)
    }

    fn finish(&mut self, cx: &mut Context) -> Result<State, Error> {
        let master_secret = self
            .master_secret
            .take()
            .ok_or_else(|| Error::InternalError("No master secret".into()))?;
        let (ticket, lifetime_hint) = match (self.new_ticket.take(), &self.resume) {
            (Some(t), _) => (t.ticket, t.lifetime_hint),
            (None, Some(s)) => (s.ticket().to_vec(), s.lifetime_hint),
            (None, None) => (Vec::new(), 0),
        };
        let start_time = match (&self.resume, self.resumed) {
            (Some(s), true) => s.start_time(),
            _ => SystemTime::now(),
        };

        let session = Session {
            id: self.session_id.clone(),
            ticket,
            master_secret,
            version: self.version,
            suite: self.suite()?,
            compression: CompressionMethod::Null,
            peer_certificates: std::mem::take(&mut self.server_chain),
            start_time,
            server_name: cx.config.server_name().map(|s| s.to_string()),
            extended_master_secret: self.extended_master_secret,
            encrypt_then_mac: self.encrypt_then_mac,
            side: Side::Client,
            lifetime_hint,
        };
        debug!("Handshake complete: {:?}", session);

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
