//! The TLS 1.0-1.2 handshake, as client and as server.
//!
//! Both sides are state machines driven by [`Handshake::make_progress`].
//! Every state either waits for the next peer message, or sends a flight
//! and moves on. Messages travel through [`HandshakeIo`], which hides the
//! difference between stream and datagram transport.

mod client;
mod io;
mod server;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub(crate) use client::ClientHandshake;
pub(crate) use io::HandshakeIo;
pub(crate) use server::ServerHandshake;

use crate::channel::Callbacks;
use crate::config::Config;
use crate::crypto::{prf, PeerKey, Transcript};
use crate::message::{Body, HandshakeType, ParseContext};
use crate::policy::Policy;
use crate::record::{CipherState, KeyMaterial, RecordLayer};
use crate::session::Session;
use crate::types::{
    CipherSuite, HashAlgorithm, NamedGroup, ProtocolVersion, Side, SignatureAlgorithm,
    SignatureScheme,
};
use crate::Error;

use io::Message;

/// Groups assumed when a client sends no supported_groups (RFC 4492).
const DEFAULT_GROUPS: &[NamedGroup] = &[NamedGroup::Secp256r1, NamedGroup::Secp384r1];

/// Schemes assumed when a TLS 1.2 peer sends no signature_algorithms (RFC 5246).
const DEFAULT_SCHEMES: &[SignatureScheme] =
    &[SignatureScheme::RSA_PKCS1_SHA1, SignatureScheme::ECDSA_SHA1];

/// Everything a handshake step may touch besides its own state.
pub(crate) struct Context<'a> {
    pub config: &'a Config,
    pub record: &'a mut RecordLayer,
    pub io: &'a mut HandshakeIo,
    pub callbacks: &'a mut dyn Callbacks,
}

/// The outcome of a completed handshake.
#[derive(Debug)]
pub(crate) struct Established {
    pub session: Session,
    pub application_protocol: Option<Vec<u8>>,
    pub secure_renegotiation: bool,
    pub client_verify_data: Vec<u8>,
    pub server_verify_data: Vec<u8>,
    pub resumed: bool,
}

/// What a renegotiation needs to know about the handshake it replaces.
#[derive(Debug, Clone)]
pub(crate) struct Previous {
    pub version: ProtocolVersion,
    pub secure_renegotiation: bool,
    pub client_verify_data: Vec<u8>,
    pub server_verify_data: Vec<u8>,
}

impl Previous {
    pub fn of(established: &Established) -> Self {
        Previous {
            version: established.session.version(),
            secure_renegotiation: established.secure_renegotiation,
            client_verify_data: established.client_verify_data.clone(),
            server_verify_data: established.server_verify_data.clone(),
        }
    }

    /// Whether a new handshake may follow this one at all.
    pub fn permits_renegotiation(&self, policy: &dyn Policy) -> bool {
        self.secure_renegotiation || policy.allow_insecure_renegotiation()
    }

    /// The renegotiation_info a server echoes.
    fn binding(&self) -> Vec<u8> {
        let mut out = self.client_verify_data.clone();
        out.extend_from_slice(&self.server_verify_data);
        out
    }
}

#[derive(Debug)]
pub(crate) enum Handshake {
    Client(ClientHandshake),
    Server(ServerHandshake),
}

impl Handshake {
    pub fn make_progress(&mut self, cx: &mut Context) -> Result<(), Error> {
        match self {
            Handshake::Client(c) => c.make_progress(cx),
            Handshake::Server(s) => s.make_progress(cx),
        }
    }

    /// Handle the peer's ChangeCipherSpec.
    pub fn change_cipher_spec(&mut self, cx: &mut Context) -> Result<(), Error> {
        match self {
            Handshake::Client(c) => c.change_cipher_spec(cx),
            Handshake::Server(s) => s.change_cipher_spec(cx),
        }
    }

    /// Between the peer's ChangeCipherSpec and its Finished, where no
    /// application data may arrive.
    pub fn awaits_finished(&self) -> bool {
        match self {
            Handshake::Client(c) => c.awaits_finished(),
            Handshake::Server(s) => s.awaits_finished(),
        }
    }

    pub fn is_renegotiation(&self) -> bool {
        match self {
            Handshake::Client(c) => c.is_renegotiation(),
            Handshake::Server(s) => s.is_renegotiation(),
        }
    }

    /// The result, once the handshake is done.
    pub fn take_established(&mut self) -> Option<Established> {
        match self {
            Handshake::Client(c) => c.take_established(),
            Handshake::Server(s) => s.take_established(),
        }
    }
}

/// Serialize and send one message, adding it to the transcript.
fn send_message(
    cx: &mut Context,
    transcript: &mut Transcript,
    version: ProtocolVersion,
    body: &Body,
) -> Result<(), Error> {
    let mut buf = Vec::new();
    body.serialize(&mut buf, version);
    let raw = cx.io.send_message(cx.record, body.handshake_type(), &buf)?;
    transcript.update(&raw);
    Ok(())
}

fn parse_message(
    msg: &Message,
    datagram: bool,
    version: ProtocolVersion,
    suite: Option<CipherSuite>,
) -> Result<Body, Error> {
    let ctx = ParseContext {
        datagram,
        version,
        key_exchange: suite.and_then(|s| s.key_exchange()),
    };
    Body::parse(msg.msg_type, msg.body(), &ctx)
}

fn unexpected(body: &Body, state: impl std::fmt::Debug) -> Error {
    Error::UnexpectedMessage(format!("{:?} in {:?}", body.handshake_type(), state))
}

/// Read and write record protection for the new epoch.
fn cipher_states(
    side: Side,
    suite: CipherSuite,
    version: ProtocolVersion,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    encrypt_then_mac: bool,
) -> Result<(CipherState, CipherState), Error> {
    let keys = KeyMaterial::derive(suite, version, master_secret, client_random, server_random)?;
    let (read, write) = keys.into_directions(side);
    Ok((
        CipherState::new(suite, version, read, encrypt_then_mac)?,
        CipherState::new(suite, version, write, encrypt_then_mac)?,
    ))
}

/// With extended master secret the transcript up to and including the
/// ClientKeyExchange replaces the hello randoms.
fn master_secret(
    suite: CipherSuite,
    version: ProtocolVersion,
    pre_master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    extended: bool,
    transcript: &Transcript,
) -> Result<Zeroizing<[u8; prf::MASTER_SECRET_LEN]>, Error> {
    let hash = suite.handshake_hash(version);
    if extended {
        prf::extended_master_secret(hash, pre_master_secret, &transcript.hash(hash))
    } else {
        prf::master_secret(hash, pre_master_secret, client_random, server_random)
    }
}

fn finished_data(
    suite: CipherSuite,
    version: ProtocolVersion,
    master_secret: &[u8],
    side: Side,
    transcript: &Transcript,
) -> Result<Vec<u8>, Error> {
    let hash = suite.handshake_hash(version);
    let data = prf::verify_data(hash, master_secret, side, &transcript.hash(hash))?;
    Ok(data.to_vec())
}

fn check_finished(expected: &[u8], received: &[u8]) -> Result<(), Error> {
    if expected.len() == received.len() && bool::from(expected.ct_eq(received)) {
        Ok(())
    } else {
        Err(Error::DecryptError("Finished verify_data mismatch"))
    }
}

/// premaster = len(psk) zeroes, then the psk, each with a 16 bit length.
fn psk_premaster(psk: &[u8]) -> Zeroizing<Vec<u8>> {
    let len = (psk.len() as u16).to_be_bytes();
    let mut pms = Zeroizing::new(Vec::with_capacity(4 + 2 * psk.len()));
    pms.extend_from_slice(&len);
    pms.resize(2 + psk.len(), 0);
    pms.extend_from_slice(&len);
    pms.extend_from_slice(psk);
    pms
}

fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut out);
    out
}

/// How we sign: the key type, the scheme put on the wire and the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signing {
    algorithm: SignatureAlgorithm,
    scheme: Option<SignatureScheme>,
    hash: HashAlgorithm,
}

/// Pick a scheme our key supports and the peer accepts.
///
/// Before TLS 1.2 the hash is fixed by the key type.
fn choose_signing(
    version: ProtocolVersion,
    algorithm: SignatureAlgorithm,
    ours: &[SignatureScheme],
    peer: Option<&[SignatureScheme]>,
) -> Option<Signing> {
    if !version.supports_negotiable_signature_algorithms() {
        return Some(Signing {
            algorithm,
            scheme: None,
            hash: algorithm.legacy_hash(),
        });
    }
    let peer = peer.unwrap_or(DEFAULT_SCHEMES);
    ours.iter()
        .filter(|s| peer.contains(s))
        .find_map(|s| match s.components() {
            Some((alg, hash)) if alg == algorithm => Some(Signing {
                algorithm,
                scheme: Some(*s),
                hash,
            }),
            _ => None,
        })
}

/// The hash a received signature was made with, if we accept it.
fn verify_hash(
    version: ProtocolVersion,
    key: &PeerKey,
    scheme: Option<SignatureScheme>,
    accepted: &[SignatureScheme],
) -> Result<HashAlgorithm, Error> {
    let algorithm = key.algorithm();
    if !version.supports_negotiable_signature_algorithms() {
        return Ok(algorithm.legacy_hash());
    }
    let scheme = scheme.ok_or_else(|| Error::Decode("Missing signature scheme".into()))?;
    match scheme.components() {
        Some((alg, hash)) if alg == algorithm && accepted.contains(&scheme) => Ok(hash),
        _ => Err(Error::IllegalParameter(format!(
            "Signature scheme {:?} not acceptable",
            scheme
        ))),
    }
}

/// Let the application judge the chain, then take the leaf's key.
fn peer_key(
    cx: &mut Context,
    chain: &[Vec<u8>],
    server_name: Option<&str>,
) -> Result<PeerKey, Error> {
    let leaf = chain
        .first()
        .ok_or_else(|| Error::HandshakeFailure("Empty certificate chain".into()))?;
    cx.callbacks.verify_certificate_chain(chain, server_name)?;
    let key = PeerKey::from_certificate(leaf)?;
    let min_bits = cx.config.policy().minimum_rsa_bits();
    if key.algorithm() == SignatureAlgorithm::Rsa && key.bits() < min_bits {
        return Err(Error::InsufficientSecurity(format!(
            "RSA key of {} bits, need {}",
            key.bits(),
            min_bits
        )));
    }
    Ok(key)
}

/// Whether `msg_type` may open a handshake initiated by the peer.
pub(crate) fn opens_handshake(side: Side, msg_type: HandshakeType) -> bool {
    match side {
        Side::Client => msg_type == HandshakeType::HelloRequest,
        Side::Server => msg_type == HandshakeType::ClientHello,
    }
}
