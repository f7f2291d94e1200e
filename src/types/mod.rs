//! Wire-level enums and small value types shared by the record and handshake layers.

use std::fmt;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;
use rand::RngCore;

mod cipher_suite;
pub use cipher_suite::{BulkCipher, CipherSuite, KeyExchangeAlgorithm, MacAlgorithm};
pub use cipher_suite::{EMPTY_RENEGOTIATION_INFO_SCSV, FALLBACK_SCSV};

mod version;
pub use version::ProtocolVersion;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn peer(&self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            _ => ContentType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ContentType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Null,
    Deflate,
    Unknown(u8),
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => CompressionMethod::Null,
            0x01 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CompressionMethod::Null => 0x00,
            CompressionMethod::Deflate => 0x01,
            CompressionMethod::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], CompressionMethod> {
        let (input, value) = be_u8(input)?;
        Ok((input, CompressionMethod::from_u8(value)))
    }
}

/// Hash functions used for the PRF, the transcript and signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// MD5 and SHA-1 concatenated, the pre-TLS 1.2 construction.
    Md5Sha1,
    Sha1,
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5Sha1 => 36,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    Rsa,
    Ecdsa,
}

impl SignatureAlgorithm {
    /// TLS ClientCertificateType code for CertificateRequest.
    pub fn certificate_type(&self) -> u8 {
        match self {
            SignatureAlgorithm::Rsa => 1,
            SignatureAlgorithm::Ecdsa => 64,
        }
    }

    pub fn from_certificate_type(value: u8) -> Option<Self> {
        match value {
            1 => Some(SignatureAlgorithm::Rsa),
            64 => Some(SignatureAlgorithm::Ecdsa),
            _ => None,
        }
    }

    /// The signature/hash pair implied before TLS 1.2, where no scheme is sent.
    pub fn legacy_hash(&self) -> HashAlgorithm {
        match self {
            SignatureAlgorithm::Rsa => HashAlgorithm::Md5Sha1,
            SignatureAlgorithm::Ecdsa => HashAlgorithm::Sha1,
        }
    }
}

/// TLS 1.2 SignatureAndHashAlgorithm pair, as a combined code point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum SignatureScheme {
    RSA_PKCS1_SHA1,
    ECDSA_SHA1,
    RSA_PKCS1_SHA256,
    ECDSA_SECP256R1_SHA256,
    RSA_PKCS1_SHA384,
    ECDSA_SECP384R1_SHA384,
    Unknown(u16),
}

impl SignatureScheme {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0201 => SignatureScheme::RSA_PKCS1_SHA1,
            0x0203 => SignatureScheme::ECDSA_SHA1,
            0x0401 => SignatureScheme::RSA_PKCS1_SHA256,
            0x0403 => SignatureScheme::ECDSA_SECP256R1_SHA256,
            0x0501 => SignatureScheme::RSA_PKCS1_SHA384,
            0x0503 => SignatureScheme::ECDSA_SECP384R1_SHA384,
            _ => SignatureScheme::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            SignatureScheme::RSA_PKCS1_SHA1 => 0x0201,
            SignatureScheme::ECDSA_SHA1 => 0x0203,
            SignatureScheme::RSA_PKCS1_SHA256 => 0x0401,
            SignatureScheme::ECDSA_SECP256R1_SHA256 => 0x0403,
            SignatureScheme::RSA_PKCS1_SHA384 => 0x0501,
            SignatureScheme::ECDSA_SECP384R1_SHA384 => 0x0503,
            SignatureScheme::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], SignatureScheme> {
        let (input, value) = be_u16(input)?;
        Ok((input, SignatureScheme::from_u16(value)))
    }

    /// Split into signature algorithm and hash, if known.
    pub fn components(&self) -> Option<(SignatureAlgorithm, HashAlgorithm)> {
        use SignatureAlgorithm::*;
        match self {
            SignatureScheme::RSA_PKCS1_SHA1 => Some((Rsa, HashAlgorithm::Sha1)),
            SignatureScheme::ECDSA_SHA1 => Some((Ecdsa, HashAlgorithm::Sha1)),
            SignatureScheme::RSA_PKCS1_SHA256 => Some((Rsa, HashAlgorithm::Sha256)),
            SignatureScheme::ECDSA_SECP256R1_SHA256 => Some((Ecdsa, HashAlgorithm::Sha256)),
            SignatureScheme::RSA_PKCS1_SHA384 => Some((Rsa, HashAlgorithm::Sha384)),
            SignatureScheme::ECDSA_SECP384R1_SHA384 => Some((Ecdsa, HashAlgorithm::Sha384)),
            SignatureScheme::Unknown(_) => None,
        }
    }

    pub fn algorithm(&self) -> Option<SignatureAlgorithm> {
        self.components().map(|(a, _)| a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedGroup {
    Secp256r1,
    Secp384r1,
    X25519,
    Unknown(u16),
}

impl NamedGroup {
    pub fn from_u16(value: u16) -> Self {
        match value {
            23 => NamedGroup::Secp256r1,
            24 => NamedGroup::Secp384r1,
            29 => NamedGroup::X25519,
            _ => NamedGroup::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            NamedGroup::Secp256r1 => 23,
            NamedGroup::Secp384r1 => 24,
            NamedGroup::X25519 => 29,
            NamedGroup::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], NamedGroup> {
        let (input, value) = be_u16(input)?;
        Ok((input, NamedGroup::from_u16(value)))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, NamedGroup::Unknown(_))
    }
}

/// The 32 byte hello random.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Random([u8; 32]);

impl Random {
    /// Fresh random, optionally with the current time in the first four bytes.
    pub fn new(include_time: bool) -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        if include_time {
            let secs = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            bytes[..4].copy_from_slice(&secs.to_be_bytes());
        }
        Random(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Random(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Random> {
        let (input, bytes) = take(32usize)(input)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok((input, Random(out)))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.0);
    }
}

impl fmt::Debug for Random {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Random(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Session identifier, 0 to 32 bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    pub const MAX_LEN: usize = 32;

    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > Self::MAX_LEN {
            return None;
        }
        Some(SessionId(bytes.to_vec()))
    }

    pub fn random() -> Self {
        let mut bytes = vec![0u8; Self::MAX_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        SessionId(bytes)
    }

    pub fn empty() -> Self {
        SessionId(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], SessionId> {
        let (input, len) = be_u8(input)?;
        if len as usize > Self::MAX_LEN {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::LengthValue,
            )));
        }
        let (input, bytes) = take(len)(input)?;
        Ok((input, SessionId(bytes.to_vec())))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.0.len() as u8);
        output.extend_from_slice(&self.0);
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId(")?;
        for b in self.0.iter().take(6) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}
