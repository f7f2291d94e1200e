//! Digests and the running handshake transcript.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};

use crate::types::HashAlgorithm;

/// One-shot digest of `data`.
pub fn digest(alg: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match alg {
        HashAlgorithm::Md5Sha1 => {
            let mut out = Vec::with_capacity(36);
            out.extend_from_slice(&Md5::digest(data));
            out.extend_from_slice(&Sha1::digest(data));
            out
        }
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
    }
}

/// Running digest over every handshake message of one handshake.
///
/// All candidate hashes run in parallel since the PRF hash is not known
/// until the ServerHello, and CertificateVerify may use yet another hash.
#[derive(Clone)]
pub struct Transcript {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha384: Sha384,
    len: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Transcript {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha384: Sha384::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
        self.sha384.update(data);
        self.len += data.len();
    }

    /// Current hash value without consuming the running state.
    pub fn hash(&self, alg: HashAlgorithm) -> Vec<u8> {
        match alg {
            HashAlgorithm::Md5Sha1 => {
                let mut out = Vec::with_capacity(36);
                out.extend_from_slice(&self.md5.clone().finalize());
                out.extend_from_slice(&self.sha1.clone().finalize());
                out
            }
            HashAlgorithm::Sha1 => self.sha1.clone().finalize().to_vec(),
            HashAlgorithm::Sha256 => self.sha256.clone().finalize().to_vec(),
            HashAlgorithm::Sha384 => self.sha384.clone().finalize().to_vec(),
        }
    }

    /// Drop everything hashed so far.
    pub fn reset(&mut self) {
        *self = Transcript::new();
    }

    /// Number of bytes hashed.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript").field("len", &self.len).finish()
    }
}
