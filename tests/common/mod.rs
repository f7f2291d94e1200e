//! Shared helpers for the TLS and DTLS integration suites.

#![allow(unused)]

use std::mem;
use std::sync::{Arc, Once};
use std::time::Duration;

use tlswire::{
    Alert, Callbacks, Channel, Config, ConfigBuilder, Credentials, Error, Policy,
    StaticCredentials,
};

pub fn init_log() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Records everything a channel hands to the application.
#[derive(Debug, Default)]
pub struct Recorder {
    pub out: Vec<Vec<u8>>,
    pub data: Vec<u8>,
    pub sequences: Vec<u64>,
    pub alerts: Vec<Alert>,
    pub sessions: usize,
    /// Protocol the server picks from the client's ALPN offer.
    pub alpn_choice: Option<Vec<u8>>,
    pub reject_chain: bool,
    pub chains_seen: usize,
    pub refuse_sessions: bool,
}

impl Recorder {
    pub fn take_out(&mut self) -> Vec<Vec<u8>> {
        mem::take(&mut self.out)
    }

    pub fn take_data(&mut self) -> Vec<u8> {
        mem::take(&mut self.data)
    }
}

impl Callbacks for Recorder {
    fn emit(&mut self, data: &[u8]) {
        self.out.push(data.to_vec());
    }

    fn deliver(&mut self, sequence: u64, data: &[u8]) {
        self.sequences.push(sequence);
        self.data.extend_from_slice(data);
    }

    fn on_alert(&mut self, alert: Alert) {
        self.alerts.push(alert);
    }

    fn on_session(&mut self, _session: &tlswire::Session) -> bool {
        self.sessions += 1;
        !self.refuse_sessions
    }

    fn verify_certificate_chain(
        &mut self,
        chain: &[Vec<u8>],
        _server_name: Option<&str>,
    ) -> Result<(), Error> {
        self.chains_seen += 1;
        assert!(!chain.is_empty());
        if self.reject_chain {
            return Err(Error::BadCertificate("untrusted".into()));
        }
        Ok(())
    }

    fn choose_application_protocol(&mut self, offered: &[Vec<u8>]) -> Option<Vec<u8>> {
        self.alpn_choice
            .clone()
            .filter(|c| offered.contains(c))
    }
}

pub type TestChannel = Channel<Recorder>;

/// Self-signed ECDSA P-256 certificate and PKCS#8 key.
pub fn ecdsa_cert() -> (Vec<u8>, Vec<u8>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate certificate");
    let der = cert.serialize_der().expect("serialize certificate");
    let key = cert.serialize_private_key_der();
    (der, key)
}

/// 2048 bit RSA certificate and PKCS#8 key.
pub fn rsa_cert() -> (Vec<u8>, Vec<u8>) {
    (
        include_bytes!("../data/rsa2048.crt.der").to_vec(),
        include_bytes!("../data/rsa2048.key.der").to_vec(),
    )
}

pub fn ecdsa_credentials() -> StaticCredentials {
    let (cert, key) = ecdsa_cert();
    StaticCredentials::new()
        .with_certificate(vec![cert], &key)
        .expect("ecdsa credentials")
}

pub fn rsa_credentials() -> StaticCredentials {
    let (cert, key) = rsa_cert();
    StaticCredentials::new()
        .with_certificate(vec![cert], &key)
        .expect("rsa credentials")
}

pub fn server_config(datagram: bool, credentials: impl Credentials + 'static) -> ConfigBuilder {
    Config::builder()
        .datagram(datagram)
        .credentials(Arc::new(credentials))
}

pub fn client_config(datagram: bool) -> ConfigBuilder {
    Config::builder().datagram(datagram).server_name("localhost")
}

pub fn client(config: &Config) -> TestChannel {
    init_log();
    Channel::client(config.clone(), Recorder::default()).expect("client")
}

pub fn server(config: &Config) -> TestChannel {
    init_log();
    Channel::server(config.clone(), Recorder::default()).expect("server")
}

/// Move output between the two channels until both are quiet.
///
/// Stops at the first error either side returns.
pub fn pump(client: &mut TestChannel, server: &mut TestChannel) -> Result<(), Error> {
    for _ in 0..100 {
        let to_server = client.callbacks_mut().take_out();
        let to_client = server.callbacks_mut().take_out();
        if to_server.is_empty() && to_client.is_empty() {
            return Ok(());
        }
        for data in &to_server {
            if server.is_closed() {
                break;
            }
            server.received(data)?;
        }
        for data in &to_client {
            if client.is_closed() {
                break;
            }
            client.received(data)?;
        }
    }
    panic!("channels never went quiet");
}

/// Connect and assert both sides are active.
pub fn connect(client_config: &Config, server_config: &Config) -> (TestChannel, TestChannel) {
    let mut c = client(client_config);
    let mut s = server(server_config);
    pump(&mut c, &mut s).expect("handshake");
    assert!(c.is_active(), "client not active");
    assert!(s.is_active(), "server not active");
    (c, s)
}

/// Send `data` from one side and return what the other side delivered.
pub fn transfer(from: &mut TestChannel, to: &mut TestChannel, data: &[u8]) -> Vec<u8> {
    from.send(data).expect("send");
    for out in from.callbacks_mut().take_out() {
        to.received(&out).expect("receive");
    }
    to.callbacks_mut().take_data()
}

/// Policy knobs the suites need to turn.
#[derive(Debug, Clone, Default)]
pub struct TestPolicy {
    pub only: Option<tlswire::ProtocolVersion>,
    pub suites: Option<Vec<tlswire::CipherSuite>>,
    pub renegotiation: bool,
    pub hide_unknown_users: bool,
    pub initial_timeout: Option<Duration>,
}

impl Policy for TestPolicy {
    fn acceptable_protocol_version(&self, version: tlswire::ProtocolVersion) -> bool {
        use tlswire::ProtocolVersion as V;
        if let Some(only) = self.only {
            return version == only;
        }
        matches!(
            version,
            V::TLS1_0 | V::TLS1_1 | V::TLS1_2 | V::DTLS1_0 | V::DTLS1_2
        )
    }

    fn ciphersuites(&self) -> Vec<tlswire::CipherSuite> {
        self.suites
            .clone()
            .unwrap_or_else(|| tlswire::CipherSuite::all().to_vec())
    }

    fn allow_client_initiated_renegotiation(&self) -> bool {
        self.renegotiation
    }

    fn allow_server_initiated_renegotiation(&self) -> bool {
        self.renegotiation
    }

    fn hide_unknown_users(&self) -> bool {
        self.hide_unknown_users
    }

    fn dtls_initial_timeout(&self) -> Duration {
        self.initial_timeout.unwrap_or(Duration::from_secs(1))
    }
}

pub fn policy(p: TestPolicy) -> Arc<dyn Policy> {
    Arc::new(p)
}
