//! Ciphersuite definitions and their algorithm properties.

use nom::number::complete::be_u16;
use nom::IResult;

use super::{HashAlgorithm, ProtocolVersion, SignatureAlgorithm};

/// Signalling value announcing RFC 5746 support in the initial ClientHello.
pub const EMPTY_RENEGOTIATION_INFO_SCSV: u16 = 0x00FF;

/// Signalling value marking a version fallback retry (RFC 7507).
pub const FALLBACK_SCSV: u16 = 0x5600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
/// TLS 1.0-1.2 ciphersuites known to this implementation.
pub enum CipherSuite {
    /// ECDHE with ECDSA authentication, AES-128-GCM, SHA-256
    ECDHE_ECDSA_AES128_GCM_SHA256, // 0xC02B
    /// ECDHE with ECDSA authentication, AES-256-GCM, SHA-384
    ECDHE_ECDSA_AES256_GCM_SHA384, // 0xC02C
    /// ECDHE with RSA authentication, AES-128-GCM, SHA-256
    ECDHE_RSA_AES128_GCM_SHA256, // 0xC02F
    /// ECDHE with RSA authentication, AES-256-GCM, SHA-384
    ECDHE_RSA_AES256_GCM_SHA384, // 0xC030

    ECDHE_ECDSA_AES128_CBC_SHA,    // 0xC009
    ECDHE_ECDSA_AES256_CBC_SHA,    // 0xC00A
    ECDHE_ECDSA_AES128_CBC_SHA256, // 0xC023
    ECDHE_ECDSA_AES256_CBC_SHA384, // 0xC024
    ECDHE_RSA_AES128_CBC_SHA,      // 0xC013
    ECDHE_RSA_AES256_CBC_SHA,      // 0xC014
    ECDHE_RSA_AES128_CBC_SHA256,   // 0xC027
    ECDHE_RSA_AES256_CBC_SHA384,   // 0xC028

    /// RSA key transport
    RSA_AES128_GCM_SHA256, // 0x009C
    RSA_AES256_GCM_SHA384, // 0x009D
    RSA_AES128_CBC_SHA,    // 0x002F
    RSA_AES256_CBC_SHA,    // 0x0035
    RSA_AES128_CBC_SHA256, // 0x003C
    RSA_AES256_CBC_SHA256, // 0x003D

    /// Plain pre-shared key
    PSK_AES128_GCM_SHA256, // 0x00A8
    PSK_AES256_GCM_SHA384, // 0x00A9
    PSK_AES128_CBC_SHA,    // 0x008C
    PSK_AES256_CBC_SHA,    // 0x008D

    /// Unknown or unsupported ciphersuite by its IANA value
    Unknown(u16),
}

/// How the premaster secret is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeAlgorithm {
    /// Ephemeral elliptic curve Diffie-Hellman, signed by the server.
    Ecdhe,
    /// Premaster secret encrypted to the server's RSA key.
    Rsa,
    /// Pre-shared key.
    Psk,
}

/// Bulk record protection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCipher {
    Aes128Gcm,
    Aes256Gcm,
    Aes128Cbc,
    Aes256Cbc,
}

/// Record MAC algorithm. AEAD suites carry no separate MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    Aead,
    HmacSha1,
    HmacSha256,
    HmacSha384,
}

impl BulkCipher {
    pub fn key_len(&self) -> usize {
        match self {
            BulkCipher::Aes128Gcm | BulkCipher::Aes128Cbc => 16,
            BulkCipher::Aes256Gcm | BulkCipher::Aes256Cbc => 32,
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(self, BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm)
    }
}

impl MacAlgorithm {
    /// MAC key and output length.
    pub fn len(&self) -> usize {
        match self {
            MacAlgorithm::Aead => 0,
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha384 => 48,
        }
    }
}

impl CipherSuite {
    /// Convert the 16-bit IANA value to a `CipherSuite`.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0xC02B => CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256,
            0xC02C => CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384,
            0xC02F => CipherSuite::ECDHE_RSA_AES128_GCM_SHA256,
            0xC030 => CipherSuite::ECDHE_RSA_AES256_GCM_SHA384,
            0xC009 => CipherSuite::ECDHE_ECDSA_AES128_CBC_SHA,
            0xC00A => CipherSuite::ECDHE_ECDSA_AES256_CBC_SHA,
            0xC023 => CipherSuite::ECDHE_ECDSA_AES128_CBC_SHA256,
            0xC024 => CipherSuite::ECDHE_ECDSA_AES256_CBC_SHA384,
            0xC013 => CipherSuite::ECDHE_RSA_AES128_CBC_SHA,
            0xC014 => CipherSuite::ECDHE_RSA_AES256_CBC_SHA,
            0xC027 => CipherSuite::ECDHE_RSA_AES128_CBC_SHA256,
            0xC028 => CipherSuite::ECDHE_RSA_AES256_CBC_SHA384,
            0x009C => CipherSuite::RSA_AES128_GCM_SHA256,
            0x009D => CipherSuite::RSA_AES256_GCM_SHA384,
            0x002F => CipherSuite::RSA_AES128_CBC_SHA,
            0x0035 => CipherSuite::RSA_AES256_CBC_SHA,
            0x003C => CipherSuite::RSA_AES128_CBC_SHA256,
            0x003D => CipherSuite::RSA_AES256_CBC_SHA256,
            0x00A8 => CipherSuite::PSK_AES128_GCM_SHA256,
            0x00A9 => CipherSuite::PSK_AES256_GCM_SHA384,
            0x008C => CipherSuite::PSK_AES128_CBC_SHA,
            0x008D => CipherSuite::PSK_AES256_CBC_SHA,
            _ => CipherSuite::Unknown(value),
        }
    }

    /// Return the 16-bit IANA value for this ciphersuite.
    pub fn as_u16(&self) -> u16 {
        match self {
            CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256 => 0xC02B,
            CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384 => 0xC02C,
            CipherSuite::ECDHE_RSA_AES128_GCM_SHA256 => 0xC02F,
            CipherSuite::ECDHE_RSA_AES256_GCM_SHA384 => 0xC030,
            CipherSuite::ECDHE_ECDSA_AES128_CBC_SHA => 0xC009,
            CipherSuite::ECDHE_ECDSA_AES256_CBC_SHA => 0xC00A,
            CipherSuite::ECDHE_ECDSA_AES128_CBC_SHA256 => 0xC023,
            CipherSuite::ECDHE_ECDSA_AES256_CBC_SHA384 => 0xC024,
            CipherSuite::ECDHE_RSA_AES128_CBC_SHA => 0xC013,
            CipherSuite::ECDHE_RSA_AES256_CBC_SHA => 0xC014,
            CipherSuite::ECDHE_RSA_AES128_CBC_SHA256 => 0xC027,
            CipherSuite::ECDHE_RSA_AES256_CBC_SHA384 => 0xC028,
            CipherSuite::RSA_AES128_GCM_SHA256 => 0x009C,
            CipherSuite::RSA_AES256_GCM_SHA384 => 0x009D,
            CipherSuite::RSA_AES128_CBC_SHA => 0x002F,
            CipherSuite::RSA_AES256_CBC_SHA => 0x0035,
            CipherSuite::RSA_AES128_CBC_SHA256 => 0x003C,
            CipherSuite::RSA_AES256_CBC_SHA256 => 0x003D,
            CipherSuite::PSK_AES128_GCM_SHA256 => 0x00A8,
            CipherSuite::PSK_AES256_GCM_SHA384 => 0x00A9,
            CipherSuite::PSK_AES128_CBC_SHA => 0x008C,
            CipherSuite::PSK_AES256_CBC_SHA => 0x008D,
            CipherSuite::Unknown(value) => *value,
        }
    }

    /// Parse a `CipherSuite` from network byte order.
    pub fn parse(input: &[u8]) -> IResult<&[u8], CipherSuite> {
        let (input, value) = be_u16(input)?;
        Ok((input, CipherSuite::from_u16(value)))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, CipherSuite::Unknown(_))
    }

    /// Whether this is a signalling value rather than a real suite.
    pub fn is_scsv(&self) -> bool {
        matches!(
            self.as_u16(),
            EMPTY_RENEGOTIATION_INFO_SCSV | FALLBACK_SCSV
        )
    }

    /// The key exchange algorithm family for this ciphersuite.
    pub fn key_exchange(&self) -> Option<KeyExchangeAlgorithm> {
        use CipherSuite::*;
        match self {
            ECDHE_ECDSA_AES128_GCM_SHA256
            | ECDHE_ECDSA_AES256_GCM_SHA384
            | ECDHE_RSA_AES128_GCM_SHA256
            | ECDHE_RSA_AES256_GCM_SHA384
            | ECDHE_ECDSA_AES128_CBC_SHA
            | ECDHE_ECDSA_AES256_CBC_SHA
            | ECDHE_ECDSA_AES128_CBC_SHA256
            | ECDHE_ECDSA_AES256_CBC_SHA384
            | ECDHE_RSA_AES128_CBC_SHA
            | ECDHE_RSA_AES256_CBC_SHA
            | ECDHE_RSA_AES128_CBC_SHA256
            | ECDHE_RSA_AES256_CBC_SHA384 => Some(KeyExchangeAlgorithm::Ecdhe),

            RSA_AES128_GCM_SHA256
            | RSA_AES256_GCM_SHA384
            | RSA_AES128_CBC_SHA
            | RSA_AES256_CBC_SHA
            | RSA_AES128_CBC_SHA256
            | RSA_AES256_CBC_SHA256 => Some(KeyExchangeAlgorithm::Rsa),

            PSK_AES128_GCM_SHA256 | PSK_AES256_GCM_SHA384 | PSK_AES128_CBC_SHA
            | PSK_AES256_CBC_SHA => Some(KeyExchangeAlgorithm::Psk),

            Unknown(_) => None,
        }
    }

    /// The certificate key type that authenticates the server, if any.
    pub fn authentication(&self) -> Option<SignatureAlgorithm> {
        use CipherSuite::*;
        match self {
            ECDHE_ECDSA_AES128_GCM_SHA256
            | ECDHE_ECDSA_AES256_GCM_SHA384
            | ECDHE_ECDSA_AES128_CBC_SHA
            | ECDHE_ECDSA_AES256_CBC_SHA
            | ECDHE_ECDSA_AES128_CBC_SHA256
            | ECDHE_ECDSA_AES256_CBC_SHA384 => Some(SignatureAlgorithm::Ecdsa),
            PSK_AES128_GCM_SHA256 | PSK_AES256_GCM_SHA384 | PSK_AES128_CBC_SHA
            | PSK_AES256_CBC_SHA | Unknown(_) => None,
            _ => Some(SignatureAlgorithm::Rsa),
        }
    }

    pub fn cipher(&self) -> Option<BulkCipher> {
        use CipherSuite::*;
        match self {
            ECDHE_ECDSA_AES128_GCM_SHA256
            | ECDHE_RSA_AES128_GCM_SHA256
            | RSA_AES128_GCM_SHA256
            | PSK_AES128_GCM_SHA256 => Some(BulkCipher::Aes128Gcm),
            ECDHE_ECDSA_AES256_GCM_SHA384
            | ECDHE_RSA_AES256_GCM_SHA384
            | RSA_AES256_GCM_SHA384
            | PSK_AES256_GCM_SHA384 => Some(BulkCipher::Aes256Gcm),
            ECDHE_ECDSA_AES128_CBC_SHA
            | ECDHE_ECDSA_AES128_CBC_SHA256
            | ECDHE_RSA_AES128_CBC_SHA
            | ECDHE_RSA_AES128_CBC_SHA256
            | RSA_AES128_CBC_SHA
            | RSA_AES128_CBC_SHA256
            | PSK_AES128_CBC_SHA => Some(BulkCipher::Aes128Cbc),
            ECDHE_ECDSA_AES256_CBC_SHA
            | ECDHE_ECDSA_AES256_CBC_SHA384
            | ECDHE_RSA_AES256_CBC_SHA
            | ECDHE_RSA_AES256_CBC_SHA384
            | RSA_AES256_CBC_SHA
            | RSA_AES256_CBC_SHA256
            | PSK_AES256_CBC_SHA => Some(BulkCipher::Aes256Cbc),
            Unknown(_) => None,
        }
    }

    pub fn mac(&self) -> Option<MacAlgorithm> {
        use CipherSuite::*;
        match self {
            Unknown(_) => None,
            s if s.cipher().map(|c| c.is_aead()).unwrap_or(false) => Some(MacAlgorithm::Aead),
            ECDHE_ECDSA_AES128_CBC_SHA256
            | ECDHE_RSA_AES128_CBC_SHA256
            | RSA_AES128_CBC_SHA256
            | RSA_AES256_CBC_SHA256 => Some(MacAlgorithm::HmacSha256),
            ECDHE_ECDSA_AES256_CBC_SHA384 | ECDHE_RSA_AES256_CBC_SHA384 => {
                Some(MacAlgorithm::HmacSha384)
            }
            _ => Some(MacAlgorithm::HmacSha1),
        }
    }

    /// The PRF hash under TLS 1.2 / DTLS 1.2.
    pub fn prf_hash(&self) -> HashAlgorithm {
        use CipherSuite::*;
        match self {
            ECDHE_ECDSA_AES256_GCM_SHA384
            | ECDHE_RSA_AES256_GCM_SHA384
            | ECDHE_ECDSA_AES256_CBC_SHA384
            | ECDHE_RSA_AES256_CBC_SHA384
            | RSA_AES256_GCM_SHA384
            | PSK_AES256_GCM_SHA384 => HashAlgorithm::Sha384,
            _ => HashAlgorithm::Sha256,
        }
    }

    /// The PRF and transcript hash used under `version`.
    pub fn handshake_hash(&self, version: ProtocolVersion) -> HashAlgorithm {
        if version.supports_ciphersuite_specific_prf() {
            self.prf_hash()
        } else {
            HashAlgorithm::Md5Sha1
        }
    }

    /// Whether the suite can be used with `version`.
    ///
    /// AEAD and SHA-2 MAC suites are TLS 1.2 / DTLS 1.2 only.
    pub fn usable_with(&self, version: ProtocolVersion) -> bool {
        let Some(mac) = self.mac() else {
            return false;
        };
        match mac {
            MacAlgorithm::HmacSha1 => true,
            _ => version.supports_aead_modes(),
        }
    }

    /// Whether the suite needs an ECDHE group.
    pub fn is_ecc(&self) -> bool {
        self.key_exchange() == Some(KeyExchangeAlgorithm::Ecdhe)
    }

    pub fn is_psk(&self) -> bool {
        self.key_exchange() == Some(KeyExchangeAlgorithm::Psk)
    }

    pub fn is_cbc(&self) -> bool {
        matches!(
            self.cipher(),
            Some(BulkCipher::Aes128Cbc) | Some(BulkCipher::Aes256Cbc)
        )
    }

    /// All known ciphersuites in default preference order.
    pub const fn all() -> &'static [CipherSuite; 22] {
        use CipherSuite::*;
        &[
            ECDHE_ECDSA_AES256_GCM_SHA384,
            ECDHE_ECDSA_AES128_GCM_SHA256,
            ECDHE_RSA_AES256_GCM_SHA384,
            ECDHE_RSA_AES128_GCM_SHA256,
            ECDHE_ECDSA_AES256_CBC_SHA384,
            ECDHE_ECDSA_AES128_CBC_SHA256,
            ECDHE_RSA_AES256_CBC_SHA384,
            ECDHE_RSA_AES128_CBC_SHA256,
            ECDHE_ECDSA_AES256_CBC_SHA,
            ECDHE_ECDSA_AES128_CBC_SHA,
            ECDHE_RSA_AES256_CBC_SHA,
            ECDHE_RSA_AES128_CBC_SHA,
            RSA_AES256_GCM_SHA384,
            RSA_AES128_GCM_SHA256,
            RSA_AES256_CBC_SHA256,
            RSA_AES128_CBC_SHA256,
            RSA_AES256_CBC_SHA,
            RSA_AES128_CBC_SHA,
            PSK_AES256_GCM_SHA384,
            PSK_AES128_GCM_SHA256,
            PSK_AES256_CBC_SHA,
            PSK_AES128_CBC_SHA,
        ]
    }
}
