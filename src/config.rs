use std::sync::Arc;
use std::time::Duration;

use crate::credentials::{Credentials, StaticCredentials};
use crate::policy::{DefaultPolicy, Policy};
use crate::session::{InMemorySessionManager, SessionManager};
use crate::types::ProtocolVersion;
use crate::Error;

/// Smallest datagram size we are able to fit a handshake fragment into.
const MIN_MTU: usize = 256;

/// Channel configuration
#[derive(Clone)]
pub struct Config {
    datagram: bool,
    version: ProtocolVersion,
    server_name: Option<String>,
    alpn_protocols: Vec<Vec<u8>>,
    request_client_certificate: bool,
    require_client_certificate: bool,
    handshake_timeout: Duration,
    mtu: usize,
    max_queue_rx: usize,
    policy: Arc<dyn Policy>,
    credentials: Arc<dyn Credentials>,
    session_manager: Arc<dyn SessionManager>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            datagram: false,
            version: None,
            server_name: None,
            alpn_protocols: Vec::new(),
            request_client_certificate: false,
            require_client_certificate: false,
            handshake_timeout: Duration::from_secs(40),
            mtu: None,
            max_queue_rx: 30,
            policy: None,
            credentials: None,
            session_manager: None,
        }
    }

    /// Whether the transport is datagram based (DTLS) rather than a stream (TLS).
    #[inline(always)]
    pub fn datagram(&self) -> bool {
        self.datagram
    }

    /// The highest version a client offers.
    ///
    /// A server negotiates anything the policy accepts.
    #[inline(always)]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Name of the server a client connects to.
    ///
    /// Sent as server_name and used to look up a session to resume.
    #[inline(always)]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// ALPN protocols a client offers, in preference order.
    #[inline(always)]
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    /// For a server, send a CertificateRequest.
    #[inline(always)]
    pub fn request_client_certificate(&self) -> bool {
        self.request_client_certificate
    }

    /// For a server, fail the handshake if the client sends no certificate.
    ///
    /// Implies [`Config::request_client_certificate`].
    #[inline(always)]
    pub fn require_client_certificate(&self) -> bool {
        self.require_client_certificate
    }

    /// Timeout for the entire handshake, regardless of flights.
    #[inline(always)]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Max transmission unit.
    ///
    /// The largest datagram we will produce. Not used for stream transport.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Max amount of out of order handshake fragments to buffer.
    #[inline(always)]
    pub fn max_queue_rx(&self) -> usize {
        self.max_queue_rx
    }

    #[inline(always)]
    pub fn policy(&self) -> &dyn Policy {
        &*self.policy
    }

    #[inline(always)]
    pub fn credentials(&self) -> &dyn Credentials {
        &*self.credentials
    }

    #[inline(always)]
    pub fn session_manager(&self) -> &dyn SessionManager {
        &*self.session_manager
    }
}

/// Builder for channel configuration.
pub struct ConfigBuilder {
    datagram: bool,
    version: Option<ProtocolVersion>,
    server_name: Option<String>,
    alpn_protocols: Vec<Vec<u8>>,
    request_client_certificate: bool,
    require_client_certificate: bool,
    handshake_timeout: Duration,
    mtu: Option<usize>,
    max_queue_rx: usize,
    policy: Option<Arc<dyn Policy>>,
    credentials: Option<Arc<dyn Credentials>>,
    session_manager: Option<Arc<dyn SessionManager>>,
}

impl ConfigBuilder {
    /// Use datagram transport (DTLS).
    ///
    /// Defaults to false.
    pub fn datagram(mut self, datagram: bool) -> Self {
        self.datagram = datagram;
        self
    }

    /// Set the highest version a client offers.
    ///
    /// Defaults to the newest version the policy allows for the transport.
    /// Offering less than that makes the client signal TLS_FALLBACK_SCSV.
    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Set the server name for a client.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set ALPN protocols a client offers.
    pub fn alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.alpn_protocols = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    /// Set whether a server requests a client certificate.
    ///
    /// Defaults to false.
    pub fn request_client_certificate(mut self, request: bool) -> Self {
        self.request_client_certificate = request;
        self
    }

    /// Set whether a server requires a client certificate.
    ///
    /// Defaults to false.
    pub fn require_client_certificate(mut self, require: bool) -> Self {
        self.require_client_certificate = require;
        self
    }

    /// Set the timeout for the entire handshake, regardless of flights.
    ///
    /// Defaults to 40 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the max transmission unit (MTU).
    ///
    /// Defaults to the policy's `dtls_default_mtu`.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Set the max amount of out of order handshake fragments to buffer.
    ///
    /// Defaults to 30.
    pub fn max_queue_rx(mut self, max_queue_rx: usize) -> Self {
        self.max_queue_rx = max_queue_rx;
        self
    }

    /// Defaults to [`DefaultPolicy`].
    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Defaults to empty [`StaticCredentials`].
    pub fn credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Defaults to an [`InMemorySessionManager`] private to this config.
    pub fn session_manager(mut self, manager: Arc<dyn SessionManager>) -> Self {
        self.session_manager = Some(manager);
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::Config` if the version does not suit the transport or
    /// the policy, or the MTU is too small.
    pub fn build(self) -> Result<Config, Error> {
        let policy = self.policy.unwrap_or_else(|| Arc::new(DefaultPolicy));

        let version = match self.version {
            Some(v) => v,
            None => policy
                .latest_supported_version(self.datagram)
                .ok_or_else(|| Error::Config("Policy allows no protocol version".into()))?,
        };
        if version.is_datagram() != self.datagram {
            return Err(Error::Config(format!(
                "{} does not match the transport",
                version
            )));
        }
        if !policy.acceptable_protocol_version(version) {
            return Err(Error::Config(format!("{} not allowed by policy", version)));
        }

        let mtu = self.mtu.unwrap_or_else(|| policy.dtls_default_mtu());
        if self.datagram && mtu < MIN_MTU {
            return Err(Error::Config(format!("MTU {} below {}", mtu, MIN_MTU)));
        }

        if self.alpn_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(Error::Config("ALPN protocol must be 1-255 bytes".into()));
        }

        Ok(Config {
            datagram: self.datagram,
            version,
            server_name: self.server_name,
            alpn_protocols: self.alpn_protocols,
            request_client_certificate: self.request_client_certificate
                || self.require_client_certificate,
            require_client_certificate: self.require_client_certificate,
            handshake_timeout: self.handshake_timeout,
            mtu,
            max_queue_rx: self.max_queue_rx,
            policy,
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(StaticCredentials::new())),
            session_manager: self
                .session_manager
                .unwrap_or_else(|| Arc::new(InMemorySessionManager::default())),
        })
    }
}
