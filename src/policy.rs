//! Negotiation policy.
//!
//! Every knob has a default so an application only overrides what it
//! needs. [`DefaultPolicy`] takes all defaults.

use std::fmt;
use std::time::Duration;

use crate::types::{CipherSuite, NamedGroup, ProtocolVersion, SignatureScheme};

/// What a channel is willing to negotiate.
pub trait Policy: fmt::Debug + Send + Sync {
    fn allow_tls10(&self) -> bool {
        true
    }

    fn allow_tls11(&self) -> bool {
        true
    }

    fn allow_tls12(&self) -> bool {
        true
    }

    fn allow_dtls10(&self) -> bool {
        true
    }

    fn allow_dtls12(&self) -> bool {
        true
    }

    /// Whether `version` may be negotiated at all.
    fn acceptable_protocol_version(&self, version: ProtocolVersion) -> bool {
        match version {
            ProtocolVersion::TLS1_0 => self.allow_tls10(),
            ProtocolVersion::TLS1_1 => self.allow_tls11(),
            ProtocolVersion::TLS1_2 => self.allow_tls12(),
            ProtocolVersion::DTLS1_0 => self.allow_dtls10(),
            ProtocolVersion::DTLS1_2 => self.allow_dtls12(),
            _ => false,
        }
    }

    /// The newest acceptable version for the transport.
    fn latest_supported_version(&self, datagram: bool) -> Option<ProtocolVersion> {
        let candidates: &[ProtocolVersion] = if datagram {
            &[ProtocolVersion::DTLS1_2, ProtocolVersion::DTLS1_0]
        } else {
            &[
                ProtocolVersion::TLS1_2,
                ProtocolVersion::TLS1_1,
                ProtocolVersion::TLS1_0,
            ]
        };
        candidates
            .iter()
            .copied()
            .find(|v| self.acceptable_protocol_version(*v))
    }

    /// Ciphersuites in preference order.
    fn ciphersuites(&self) -> Vec<CipherSuite> {
        CipherSuite::all().to_vec()
    }

    /// Ciphersuites usable with `version`, in preference order.
    fn ciphersuite_list(&self, version: ProtocolVersion) -> Vec<CipherSuite> {
        self.ciphersuites()
            .into_iter()
            .filter(|s| s.usable_with(version))
            .collect()
    }

    /// ECDHE groups in preference order.
    fn key_exchange_groups(&self) -> Vec<NamedGroup> {
        vec![
            NamedGroup::X25519,
            NamedGroup::Secp256r1,
            NamedGroup::Secp384r1,
        ]
    }

    /// Signature schemes accepted from the peer, in preference order.
    fn signature_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_SECP256R1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_SECP384R1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_SHA1,
            SignatureScheme::RSA_PKCS1_SHA1,
        ]
    }

    /// Server picks by its own order rather than the client's.
    fn server_uses_own_ciphersuite_preferences(&self) -> bool {
        true
    }

    fn negotiate_encrypt_then_mac(&self) -> bool {
        true
    }

    fn negotiate_extended_master_secret(&self) -> bool {
        true
    }

    /// Renegotiate with peers lacking RFC 5746 support.
    fn allow_insecure_renegotiation(&self) -> bool {
        false
    }

    /// For a server, honour renegotiation started by the client.
    fn allow_client_initiated_renegotiation(&self) -> bool {
        false
    }

    /// For a client, honour a HelloRequest from the server.
    fn allow_server_initiated_renegotiation(&self) -> bool {
        false
    }

    /// Whether a renegotiation may resume a session rather than run a
    /// full handshake.
    fn allow_resumption_for_renegotiation(&self) -> bool {
        true
    }

    /// How long issued tickets, and cached sessions, stay valid.
    fn session_ticket_lifetime(&self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    /// Whether a client offering `version` signals TLS_FALLBACK_SCSV.
    fn send_fallback_scsv(&self, version: ProtocolVersion) -> bool {
        self.latest_supported_version(version.is_datagram()) != Some(version)
    }

    fn dtls_initial_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn dtls_maximum_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Largest datagram the engine produces.
    fn dtls_default_mtu(&self) -> usize {
        1232
    }

    fn minimum_rsa_bits(&self) -> usize {
        2048
    }

    /// Answer an unknown PSK identity with a random key instead of
    /// `unknown_psk_identity`, so unknown identities are indistinguishable.
    fn hide_unknown_users(&self) -> bool {
        false
    }

    fn include_time_in_hello_random(&self) -> bool {
        true
    }
}

/// Policy with every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl Policy for DefaultPolicy {}
