//! Certificates, private keys and pre-shared keys.

use std::collections::HashMap;
use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::PrivateKey;
use crate::types::{HashAlgorithm, SignatureAlgorithm, SignatureScheme, Side};
use crate::Error;

/// Supplies key material to the handshake on demand.
///
/// Implementations are shared between channels and must synchronize any
/// interior mutability themselves.
pub trait Credentials: Send + Sync {
    /// Certificate chain (leaf first, DER) for `algorithm` when acting as `side`.
    ///
    /// Empty when there is none.
    fn cert_chain(
        &self,
        algorithm: SignatureAlgorithm,
        side: Side,
        server_name: Option<&str>,
    ) -> Vec<Vec<u8>> {
        let _ = (algorithm, side, server_name);
        Vec::new()
    }

    /// Signature schemes the key for `algorithm` can produce, preferred first.
    fn signature_schemes(&self, algorithm: SignatureAlgorithm, side: Side) -> Vec<SignatureScheme> {
        let _ = (algorithm, side);
        Vec::new()
    }

    /// Sign `digest`, computed with `hash`, with the key for `algorithm`.
    fn sign(
        &self,
        algorithm: SignatureAlgorithm,
        side: Side,
        hash: HashAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let _ = (side, hash, digest);
        Err(Error::InternalError(format!("No {:?} signing key", algorithm)))
    }

    /// Decrypt an RSA key transport premaster secret.
    fn rsa_decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let _ = ciphertext;
        Err(Error::InternalError("No RSA decryption key".into()))
    }

    /// Whether PSK ciphersuites should be offered or accepted as `side`.
    fn has_psk(&self, side: Side) -> bool {
        let _ = side;
        false
    }

    /// The pre-shared key for `identity`.
    fn psk(&self, side: Side, identity: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        let _ = (side, identity);
        None
    }

    /// Identity a client presents, given the server's hint if any.
    fn psk_identity(&self, hint: Option<&[u8]>) -> Option<Vec<u8>> {
        let _ = hint;
        None
    }

    /// Identity hint a server sends in its ServerKeyExchange.
    fn psk_identity_hint(&self) -> Option<Vec<u8>> {
        None
    }

    /// Key sealing session tickets. No tickets are issued or accepted without one.
    fn session_ticket_key(&self) -> Option<Zeroizing<[u8; 32]>> {
        None
    }
}

struct CertifiedKey {
    chain: Vec<Vec<u8>>,
    key: PrivateKey,
}

/// Credentials held in memory, used for both sides.
#[derive(Default)]
pub struct StaticCredentials {
    keys: Vec<CertifiedKey>,
    psks: HashMap<Vec<u8>, Zeroizing<Vec<u8>>>,
    client_identity: Option<Vec<u8>>,
    identity_hint: Option<Vec<u8>>,
    ticket_key: Option<Zeroizing<[u8; 32]>>,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("keys", &self.keys.len())
            .field("psks", &self.psks.len())
            .field("ticket_key", &self.ticket_key.is_some())
            .finish()
    }
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a certificate chain (leaf first, DER) with its private key.
    ///
    /// The key may be PKCS#8, PKCS#1 or SEC1 DER, or PEM.
    pub fn with_certificate(mut self, chain: Vec<Vec<u8>>, key_der: &[u8]) -> Result<Self, Error> {
        if chain.is_empty() {
            return Err(Error::Config("Empty certificate chain".into()));
        }
        let key = PrivateKey::from_der(key_der)?;
        // One key per algorithm, newest wins.
        let algorithm = key.algorithm();
        self.keys.retain(|k| k.key.algorithm() != algorithm);
        self.keys.push(CertifiedKey { chain, key });
        Ok(self)
    }

    /// Add a pre-shared key.
    ///
    /// The first added identity is the one presented when acting as client.
    pub fn with_psk(mut self, identity: &[u8], key: &[u8]) -> Self {
        if self.client_identity.is_none() {
            self.client_identity = Some(identity.to_vec());
        }
        self.psks
            .insert(identity.to_vec(), Zeroizing::new(key.to_vec()));
        self
    }

    pub fn with_psk_identity_hint(mut self, hint: &[u8]) -> Self {
        self.identity_hint = Some(hint.to_vec());
        self
    }

    pub fn with_session_ticket_key(mut self, key: [u8; 32]) -> Self {
        self.ticket_key = Some(Zeroizing::new(key));
        self
    }

    /// Enable session tickets with a freshly generated key.
    pub fn with_random_session_ticket_key(self) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        self.with_session_ticket_key(key)
    }

    fn find(&self, algorithm: SignatureAlgorithm) -> Option<&CertifiedKey> {
        self.keys.iter().find(|k| k.key.algorithm() == algorithm)
    }
}

impl Credentials for StaticCredentials {
    fn cert_chain(
        &self,
        algorithm: SignatureAlgorithm,
        _side: Side,
        _server_name: Option<&str>,
    ) -> Vec<Vec<u8>> {
        self.find(algorithm)
            .map(|k| k.chain.clone())
            .unwrap_or_default()
    }

    fn signature_schemes(&self, algorithm: SignatureAlgorithm, _side: Side) -> Vec<SignatureScheme> {
        self.find(algorithm)
            .map(|k| k.key.schemes().to_vec())
            .unwrap_or_default()
    }

    fn sign(
        &self,
        algorithm: SignatureAlgorithm,
        _side: Side,
        hash: HashAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let k = self
            .find(algorithm)
            .ok_or_else(|| Error::InternalError(format!("No {:?} signing key", algorithm)))?;
        k.key.sign(hash, digest)
    }

    fn rsa_decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let k = self
            .find(SignatureAlgorithm::Rsa)
            .ok_or_else(|| Error::InternalError("No RSA decryption key".into()))?;
        k.key.decrypt(ciphertext).map(Zeroizing::new)
    }

    fn has_psk(&self, _side: Side) -> bool {
        !self.psks.is_empty()
    }

    fn psk(&self, _side: Side, identity: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        self.psks.get(identity).cloned()
    }

    fn psk_identity(&self, _hint: Option<&[u8]>) -> Option<Vec<u8>> {
        self.client_identity.clone()
    }

    fn psk_identity_hint(&self) -> Option<Vec<u8>> {
        self.identity_hint.clone()
    }

    fn session_ticket_key(&self) -> Option<Zeroizing<[u8; 32]>> {
        self.ticket_key.clone()
    }
}
