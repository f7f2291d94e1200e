//! Record protection for one direction of one epoch.
//!
//! Two constructions are supported: AES-GCM with a 4 byte implicit salt and
//! an 8 byte explicit nonce, and AES-CBC with HMAC, either MAC-then-encrypt
//! or encrypt-then-MAC (RFC 7366).

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit as BlockKeyInit};
use aes::{Aes128, Aes256};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Key};
use arrayvec::ArrayVec;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha256, Sha384};
use subtle::{ConditionallySelectable, ConstantTimeEq, ConstantTimeGreater, ConstantTimeLess};
use zeroize::Zeroizing;

use crate::crypto::prf;
use crate::types::{BulkCipher, CipherSuite, ContentType, MacAlgorithm, ProtocolVersion, Side};
use crate::Error;

use super::MAX_PLAINTEXT_LEN;

const BLOCK_LEN: usize = 16;
const GCM_FIXED_IV_LEN: usize = 4;
const GCM_EXPLICIT_NONCE_LEN: usize = 8;
const GCM_TAG_LEN: usize = 16;

/// Keys for one direction, sliced out of the key block.
pub struct DirectionKeys {
    pub mac_key: Zeroizing<Vec<u8>>,
    pub enc_key: Zeroizing<Vec<u8>>,
    pub iv: Zeroizing<Vec<u8>>,
}

/// Both directions' keys derived from a master secret.
pub struct KeyMaterial {
    pub client: DirectionKeys,
    pub server: DirectionKeys,
}

impl KeyMaterial {
    /// Expand the master secret into write keys for both sides.
    ///
    /// The key block is laid out as client MAC key, server MAC key, client
    /// key, server key, client IV, server IV. CBC suites only carry IVs in
    /// the key block under TLS 1.0.
    pub fn derive(
        suite: CipherSuite,
        version: ProtocolVersion,
        master_secret: &[u8],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
    ) -> Result<Self, Error> {
        let (cipher, mac) = suite_parts(suite)?;
        let mac_len = mac.len();
        let key_len = cipher.key_len();
        let iv_len = if cipher.is_aead() {
            GCM_FIXED_IV_LEN
        } else if version.supports_explicit_cbc_ivs() {
            0
        } else {
            BLOCK_LEN
        };

        let total = 2 * (mac_len + key_len + iv_len);
        let block = prf::key_block(
            suite.handshake_hash(version),
            master_secret,
            client_random,
            server_random,
            total,
        )?;

        let mut rest: &[u8] = &block;
        let mut take = |n: usize| {
            let (a, b) = rest.split_at(n);
            rest = b;
            Zeroizing::new(a.to_vec())
        };

        let client_mac = take(mac_len);
        let server_mac = take(mac_len);
        let client_key = take(key_len);
        let server_key = take(key_len);
        let client_iv = take(iv_len);
        let server_iv = take(iv_len);

        Ok(KeyMaterial {
            client: DirectionKeys {
                mac_key: client_mac,
                enc_key: client_key,
                iv: client_iv,
            },
            server: DirectionKeys {
                mac_key: server_mac,
                enc_key: server_key,
                iv: server_iv,
            },
        })
    }

    /// Split into (read, write) keys as seen from `side`.
    pub fn into_directions(self, side: Side) -> (DirectionKeys, DirectionKeys) {
        match side {
            Side::Client => (self.server, self.client),
            Side::Server => (self.client, self.server),
        }
    }
}

fn suite_parts(suite: CipherSuite) -> Result<(BulkCipher, MacAlgorithm), Error> {
    match (suite.cipher(), suite.mac()) {
        (Some(c), Some(m)) => Ok((c, m)),
        _ => Err(Error::InternalError(format!(
            "No record protection for {:?}",
            suite
        ))),
    }
}

/// Record protection state for one direction of one epoch.
///
/// Epoch 0 uses the null state, which passes fragments through unchanged.
pub struct CipherState {
    inner: Inner,
}

enum Inner {
    Null,
    Gcm(GcmState),
    Cbc(CbcState),
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Null => write!(f, "CipherState::Null"),
            Inner::Gcm(_) => write!(f, "CipherState::Gcm"),
            Inner::Cbc(s) => f
                .debug_struct("CipherState::Cbc")
                .field("mac", &s.mac)
                .field("encrypt_then_mac", &s.encrypt_then_mac)
                .field("explicit_iv", &s.implicit_iv.is_none())
                .finish(),
        }
    }
}

impl CipherState {
    pub fn null() -> Self {
        CipherState { inner: Inner::Null }
    }

    pub fn new(
        suite: CipherSuite,
        version: ProtocolVersion,
        keys: DirectionKeys,
        encrypt_then_mac: bool,
    ) -> Result<Self, Error> {
        let (cipher, mac) = suite_parts(suite)?;
        let inner = match cipher {
            BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm => {
                let aead = Gcm::new(&keys.enc_key)?;
                let mut fixed_iv = [0u8; GCM_FIXED_IV_LEN];
                if keys.iv.len() != GCM_FIXED_IV_LEN {
                    return Err(Error::InternalError("Bad GCM salt length".into()));
                }
                fixed_iv.copy_from_slice(&keys.iv);
                Inner::Gcm(GcmState { aead, fixed_iv })
            }
            BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc => {
                let block = Block::new(&keys.enc_key)?;
                let implicit_iv = if version.supports_explicit_cbc_ivs() {
                    None
                } else {
                    let mut iv = [0u8; BLOCK_LEN];
                    if keys.iv.len() != BLOCK_LEN {
                        return Err(Error::InternalError("Bad CBC IV length".into()));
                    }
                    iv.copy_from_slice(&keys.iv);
                    Some(iv)
                };
                Inner::Cbc(CbcState {
                    block,
                    mac,
                    mac_key: keys.mac_key,
                    implicit_iv,
                    encrypt_then_mac,
                })
            }
        };
        Ok(CipherState { inner })
    }

    pub fn is_null(&self) -> bool {
        matches!(self.inner, Inner::Null)
    }

    /// Whether this state chains CBC IVs across records (TLS 1.0).
    pub fn uses_implicit_iv(&self) -> bool {
        matches!(&self.inner, Inner::Cbc(s) if s.implicit_iv.is_some())
    }

    /// Upper bound on bytes added to a plaintext by protection.
    pub fn max_overhead(&self) -> usize {
        match &self.inner {
            Inner::Null => 0,
            Inner::Gcm(_) => GCM_EXPLICIT_NONCE_LEN + GCM_TAG_LEN,
            Inner::Cbc(s) => BLOCK_LEN + s.mac.len() + BLOCK_LEN,
        }
    }

    /// Protect `plaintext`, returning the record fragment.
    ///
    /// `seq` is the 64 bit value bound into the MAC or AAD. For datagram
    /// transport that is the epoch in the top 16 bits followed by the
    /// 48 bit record sequence number.
    pub fn encrypt(
        &mut self,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(Error::InternalError("Plaintext exceeds record limit".into()));
        }
        match &mut self.inner {
            Inner::Null => Ok(plaintext.to_vec()),
            Inner::Gcm(s) => s.encrypt(seq, content_type, version, plaintext),
            Inner::Cbc(s) => s.encrypt(seq, content_type, version, plaintext),
        }
    }

    /// Remove protection from a record fragment.
    ///
    /// Every authentication or padding failure is reported as
    /// [`Error::BadRecordMac`] without distinguishing the cause.
    pub fn decrypt(
        &mut self,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        fragment: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let plaintext = match &mut self.inner {
            Inner::Null => fragment.to_vec(),
            Inner::Gcm(s) => s.decrypt(seq, content_type, version, fragment)?,
            Inner::Cbc(s) => s.decrypt(seq, content_type, version, fragment)?,
        };
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(Error::RecordOverflow(plaintext.len()));
        }
        Ok(plaintext)
    }
}

/// seq(8) || type(1) || version(2) || length(2)
fn pseudo_header(
    seq: u64,
    content_type: ContentType,
    version: ProtocolVersion,
    len: usize,
) -> ArrayVec<u8, 13> {
    let mut h = ArrayVec::new();
    h.extend(seq.to_be_bytes());
    h.push(content_type.as_u8());
    h.push(version.major());
    h.push(version.minor());
    h.extend((len as u16).to_be_bytes());
    h
}

enum Gcm {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Gcm {
    fn new(key: &[u8]) -> Result<Self, Error> {
        match key.len() {
            16 => {
                let key = Key::<Aes128Gcm>::from_slice(key);
                Ok(Gcm::Aes128(Box::new(Aes128Gcm::new(key))))
            }
            32 => {
                let key = Key::<Aes256Gcm>::from_slice(key);
                Ok(Gcm::Aes256(Box::new(Aes256Gcm::new(key))))
            }
            n => Err(Error::CryptoError(format!(
                "Invalid key size for AES-GCM: {}",
                n
            ))),
        }
    }
}

struct GcmState {
    aead: Gcm,
    fixed_iv: [u8; GCM_FIXED_IV_LEN],
}

impl GcmState {
    fn nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..GCM_FIXED_IV_LEN].copy_from_slice(&self.fixed_iv);
        nonce[GCM_FIXED_IV_LEN..].copy_from_slice(explicit);
        nonce
    }

    fn encrypt(
        &mut self,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        // The record sequence number doubles as explicit nonce.
        let explicit = seq.to_be_bytes();
        let nonce = self.nonce(&explicit);
        let nonce = GenericArray::from_slice(&nonce);
        let aad = pseudo_header(seq, content_type, version, plaintext.len());

        let mut buf = Vec::with_capacity(plaintext.len() + GCM_TAG_LEN);
        buf.extend_from_slice(plaintext);
        let res = match &self.aead {
            Gcm::Aes128(c) => c.encrypt_in_place(nonce, &aad, &mut buf),
            Gcm::Aes256(c) => c.encrypt_in_place(nonce, &aad, &mut buf),
        };
        res.map_err(|_| Error::CryptoError("AES-GCM encryption failed".into()))?;

        let mut out = Vec::with_capacity(GCM_EXPLICIT_NONCE_LEN + buf.len());
        out.extend_from_slice(&explicit);
        out.extend_from_slice(&buf);
        Ok(out)
    }

    fn decrypt(
        &mut self,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        fragment: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if fragment.len() < GCM_EXPLICIT_NONCE_LEN + GCM_TAG_LEN {
            return Err(Error::BadRecordMac);
        }
        let (explicit, sealed) = fragment.split_at(GCM_EXPLICIT_NONCE_LEN);
        let nonce = self.nonce(explicit);
        let nonce = GenericArray::from_slice(&nonce);
        let aad = pseudo_header(seq, content_type, version, sealed.len() - GCM_TAG_LEN);

        let mut buf = sealed.to_vec();
        let res = match &self.aead {
            Gcm::Aes128(c) => c.decrypt_in_place(nonce, &aad, &mut buf),
            Gcm::Aes256(c) => c.decrypt_in_place(nonce, &aad, &mut buf),
        };
        res.map_err(|_| Error::BadRecordMac)?;
        Ok(buf)
    }
}

enum Block {
    Aes128(Box<Aes128>),
    Aes256(Box<Aes256>),
}

impl Block {
    fn new(key: &[u8]) -> Result<Self, Error> {
        let err = |_| Error::CryptoError(format!("Invalid key size for AES-CBC: {}", key.len()));
        match key.len() {
            16 => Ok(Block::Aes128(Box::new(
                <Aes128 as BlockKeyInit>::new_from_slice(key).map_err(err)?,
            ))),
            32 => Ok(Block::Aes256(Box::new(
                <Aes256 as BlockKeyInit>::new_from_slice(key).map_err(err)?,
            ))),
            n => Err(Error::CryptoError(format!(
                "Invalid key size for AES-CBC: {}",
                n
            ))),
        }
    }

    /// CBC encrypt `data` in place. Returns the last ciphertext block.
    fn cbc_encrypt(&self, iv: &[u8; BLOCK_LEN], data: &mut [u8]) -> [u8; BLOCK_LEN] {
        let mut prev = *iv;
        for chunk in data.chunks_exact_mut(BLOCK_LEN) {
            for (b, p) in chunk.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                Block::Aes128(c) => c.encrypt_block(block),
                Block::Aes256(c) => c.encrypt_block(block),
            }
            prev.copy_from_slice(chunk);
        }
        prev
    }

    /// CBC decrypt `data` in place. Returns the last ciphertext block.
    fn cbc_decrypt(&self, iv: &[u8; BLOCK_LEN], data: &mut [u8]) -> [u8; BLOCK_LEN] {
        let mut prev = *iv;
        let mut saved = [0u8; BLOCK_LEN];
        for chunk in data.chunks_exact_mut(BLOCK_LEN) {
            saved.copy_from_slice(chunk);
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                Block::Aes128(c) => c.decrypt_block(block),
                Block::Aes256(c) => c.decrypt_block(block),
            }
            for (b, p) in chunk.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            prev = saved;
        }
        prev
    }
}

struct CbcState {
    block: Block,
    mac: MacAlgorithm,
    mac_key: Zeroizing<Vec<u8>>,
    /// Chained IV under TLS 1.0, `None` when every record carries its own IV.
    implicit_iv: Option<[u8; BLOCK_LEN]>,
    encrypt_then_mac: bool,
}

impl CbcState {
    fn hmac(&self, parts: &[&[u8]]) -> Result<Vec<u8>, Error> {
        match self.mac {
            MacAlgorithm::HmacSha1 => hmac_parts::<Hmac<Sha1>>(&self.mac_key, parts),
            MacAlgorithm::HmacSha256 => hmac_parts::<Hmac<Sha256>>(&self.mac_key, parts),
            MacAlgorithm::HmacSha384 => hmac_parts::<Hmac<Sha384>>(&self.mac_key, parts),
            MacAlgorithm::Aead => Err(Error::InternalError("AEAD suite in CBC state".into())),
        }
    }

    fn next_iv(&self) -> [u8; BLOCK_LEN] {
        match self.implicit_iv {
            Some(iv) => iv,
            None => {
                let mut iv = [0u8; BLOCK_LEN];
                OsRng.fill_bytes(&mut iv);
                iv
            }
        }
    }

    fn pad(data: &mut Vec<u8>) {
        let pad_len = BLOCK_LEN - 1 - (data.len() % BLOCK_LEN);
        data.extend(std::iter::repeat(pad_len as u8).take(pad_len + 1));
    }

    fn encrypt(
        &mut self,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let iv = self.next_iv();
        let explicit = self.implicit_iv.is_none();

        let mut out = Vec::with_capacity(plaintext.len() + 3 * BLOCK_LEN + self.mac.len());
        if explicit {
            out.extend_from_slice(&iv);
        }
        let body_start = out.len();

        if self.encrypt_then_mac {
            out.extend_from_slice(plaintext);
            Self::pad(&mut out);
            let last = self.block.cbc_encrypt(&iv, &mut out[body_start..]);
            self.chain(last);
            let header = pseudo_header(seq, content_type, version, out.len());
            let tag = self.hmac(&[&header, &out])?;
            out.extend_from_slice(&tag);
        } else {
            let header = pseudo_header(seq, content_type, version, plaintext.len());
            let tag = self.hmac(&[&header, plaintext])?;
            out.extend_from_slice(plaintext);
            out.extend_from_slice(&tag);
            Self::pad(&mut out);
            let last = self.block.cbc_encrypt(&iv, &mut out[body_start..]);
            self.chain(last);
        }

        Ok(out)
    }

    fn chain(&mut self, last: [u8; BLOCK_LEN]) {
        if let Some(iv) = &mut self.implicit_iv {
            *iv = last;
        }
    }

    fn split_iv<'a>(&self, fragment: &'a [u8]) -> ([u8; BLOCK_LEN], &'a [u8]) {
        match self.implicit_iv {
            Some(iv) => (iv, fragment),
            None => {
                let mut iv = [0u8; BLOCK_LEN];
                iv.copy_from_slice(&fragment[..BLOCK_LEN]);
                (iv, &fragment[BLOCK_LEN..])
            }
        }
    }

    fn decrypt(
        &mut self,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        fragment: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if self.encrypt_then_mac {
            self.decrypt_etm(seq, content_type, version, fragment)
        } else {
            self.decrypt_mte(seq, content_type, version, fragment)
        }
    }

    fn decrypt_etm(
        &mut self,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        fragment: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mac_len = self.mac.len();
        let iv_len = if self.implicit_iv.is_some() { 0 } else { BLOCK_LEN };
        if fragment.len() < iv_len + BLOCK_LEN + mac_len {
            return Err(Error::BadRecordMac);
        }

        let (protected, tag) = fragment.split_at(fragment.len() - mac_len);
        if (protected.len() - iv_len) % BLOCK_LEN != 0 {
            return Err(Error::BadRecordMac);
        }
        let header = pseudo_header(seq, content_type, version, protected.len());
        let expected = self.hmac(&[&header, protected])?;
        if !bool::from(expected.ct_eq(tag)) {
            return Err(Error::BadRecordMac);
        }

        let (iv, body) = self.split_iv(protected);
        let mut plaintext = body.to_vec();
        let last = self.block.cbc_decrypt(&iv, &mut plaintext);
        self.chain(last);

        // Authenticated already, padding checks need not be constant time.
        let pad_byte = *plaintext.last().ok_or(Error::BadRecordMac)? as usize;
        if pad_byte + 1 > plaintext.len() {
            return Err(Error::BadRecordMac);
        }
        let body_len = plaintext.len() - pad_byte - 1;
        if plaintext[body_len..].iter().any(|b| *b as usize != pad_byte) {
            return Err(Error::BadRecordMac);
        }
        plaintext.truncate(body_len);
        Ok(plaintext)
    }

    fn decrypt_mte(
        &mut self,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        fragment: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mac_len = self.mac.len();
        let iv_len = if self.implicit_iv.is_some() { 0 } else { BLOCK_LEN };
        let min_body = (mac_len + 1).div_ceil(BLOCK_LEN) * BLOCK_LEN;
        if fragment.len() < iv_len + min_body || (fragment.len() - iv_len) % BLOCK_LEN != 0 {
            return Err(Error::BadRecordMac);
        }

        let (iv, body) = self.split_iv(fragment);
        let mut record = body.to_vec();
        let last = self.block.cbc_decrypt(&iv, &mut record);
        self.chain(last);

        let record_len = record.len() as u16;
        let tag_len = mac_len as u16;

        // From here on, timing must not depend on the padding or MAC outcome.
        let pad_size = check_padding(&record);
        let size_ok = !(tag_len + pad_size).ct_gt(&record_len);
        let pad_size = u16::conditional_select(&0, &pad_size, size_ok);
        let plen = (record_len - tag_len - pad_size) as usize;

        let header = pseudo_header(seq, content_type, version, plen);
        let computed = self.hmac(&[&header, &record[..plen]])?;
        let mac_ok = computed.ct_eq(&record[plen..plen + mac_len]);

        let ok = size_ok & mac_ok & !pad_size.ct_eq(&0);
        if bool::from(ok) {
            record.truncate(plen);
            Ok(record)
        } else {
            self.additional_compressions(record.len(), pad_size as usize)?;
            Err(Error::BadRecordMac)
        }
    }

    /// Run the MAC over dummy data so a padding failure costs the same
    /// number of hash compressions as a MAC failure (Lucky Thirteen).
    fn additional_compressions(&self, record_len: usize, pad_size: usize) -> Result<(), Error> {
        let (block_size, max_in_first) = match self.mac {
            MacAlgorithm::HmacSha384 => (128usize, 111usize),
            _ => (64, 55),
        };
        let tag_len = self.mac.len();
        let l1 = 13 + record_len - tag_len;
        let l2 = 13 + record_len - pad_size - tag_len;
        let max_compressions = (l1 + block_size - 1 - max_in_first) / block_size;
        let current_compressions = (l2 + block_size - 1 - max_in_first) / block_size;
        let add = max_compressions - current_compressions;
        let equal = u16::conditional_select(
            &0,
            &1,
            (max_compressions as u64).ct_eq(&(current_compressions as u64)),
        ) as usize;
        let data = vec![0u8; block_size * add + equal * max_in_first];
        self.hmac(&[&data])?;
        Ok(())
    }
}

/// Constant time TLS CBC padding check.
///
/// Returns the number of padding bytes including the length byte, or 0 if
/// the padding is invalid.
fn check_padding(record: &[u8]) -> u16 {
    let len = record.len();
    if len == 0 || len > 0xFFFF {
        return 0;
    }
    let rec = len as u16;
    let to_check = rec.min(256);
    let pad_byte = record[len - 1];
    let pad_bytes = pad_byte as u16 + 1;

    let mut invalid = rec.ct_lt(&pad_bytes);
    for i in (rec - to_check)..rec {
        let offset = rec - i;
        let in_range = !offset.ct_gt(&pad_bytes);
        let correct = record[i as usize].ct_eq(&pad_byte);
        invalid |= in_range & !correct;
    }
    u16::conditional_select(&pad_bytes, &0, invalid)
}

fn hmac_parts<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, Error> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|_| Error::CryptoError("Invalid HMAC key".into()))?;
    for p in parts {
        mac.update(p);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}
