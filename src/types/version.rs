use std::cmp::Ordering;
use std::fmt;

use nom::number::complete::be_u8;
use nom::IResult;

/// A TLS or DTLS protocol version as the `{major, minor}` pair seen on the wire.
///
/// DTLS uses the one's complement of the corresponding TLS numbers, which
/// inverts the byte ordering. Comparisons are therefore only defined between
/// versions of the same family and follow the logical ordering, so
/// `DTLS1_0 < DTLS1_2` even though `0xFEFF > 0xFEFD`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    major: u8,
    minor: u8,
}

impl ProtocolVersion {
    pub const TLS1_0: ProtocolVersion = ProtocolVersion::new(3, 1);
    pub const TLS1_1: ProtocolVersion = ProtocolVersion::new(3, 2);
    pub const TLS1_2: ProtocolVersion = ProtocolVersion::new(3, 3);
    pub const DTLS1_0: ProtocolVersion = ProtocolVersion::new(254, 255);
    pub const DTLS1_2: ProtocolVersion = ProtocolVersion::new(254, 253);

    pub const fn new(major: u8, minor: u8) -> Self {
        ProtocolVersion { major, minor }
    }

    pub fn from_u16(value: u16) -> Self {
        ProtocolVersion::new((value >> 8) as u8, value as u8)
    }

    pub fn as_u16(&self) -> u16 {
        (self.major as u16) << 8 | self.minor as u16
    }

    #[inline(always)]
    pub fn major(&self) -> u8 {
        self.major
    }

    #[inline(always)]
    pub fn minor(&self) -> u8 {
        self.minor
    }

    /// Whether this is a datagram (DTLS) version.
    pub fn is_datagram(&self) -> bool {
        self.major == 254
    }

    /// Whether this is one of the versions this crate implements.
    pub fn is_known(&self) -> bool {
        matches!(
            *self,
            Self::TLS1_0 | Self::TLS1_1 | Self::TLS1_2 | Self::DTLS1_0 | Self::DTLS1_2
        )
    }

    /// Whether records under this version carry an explicit CBC IV.
    ///
    /// TLS 1.0 chains the IV from the previous record instead.
    pub fn supports_explicit_cbc_ivs(&self) -> bool {
        *self != Self::TLS1_0
    }

    /// Whether the PRF hash is chosen by the ciphersuite (TLS 1.2 / DTLS 1.2).
    ///
    /// Older versions use the combined MD5/SHA-1 PRF.
    pub fn supports_ciphersuite_specific_prf(&self) -> bool {
        *self == Self::TLS1_2 || *self == Self::DTLS1_2
    }

    /// Whether the signature_algorithms extension and explicit scheme
    /// identifiers in signed messages are used.
    pub fn supports_negotiable_signature_algorithms(&self) -> bool {
        self.supports_ciphersuite_specific_prf()
    }

    /// Whether AEAD and SHA-2 MAC suites may be negotiated.
    pub fn supports_aead_modes(&self) -> bool {
        self.supports_ciphersuite_specific_prf()
    }

    /// Position in the logical version order of the family.
    fn rank(&self) -> u8 {
        if self.is_datagram() {
            // DTLS 1.0 = 0xFF, DTLS 1.2 = 0xFD
            !self.minor
        } else {
            self.minor
        }
    }

    /// True if `self` is a strictly newer version of the same family as `other`.
    pub fn is_newer_than(&self, other: ProtocolVersion) -> bool {
        self.partial_cmp(&other) == Some(Ordering::Greater)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ProtocolVersion> {
        let (input, major) = be_u8(input)?;
        let (input, minor) = be_u8(input)?;
        Ok((input, ProtocolVersion::new(major, minor)))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.major);
        output.push(self.minor);
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.is_datagram() != other.is_datagram() {
            return None;
        }
        Some(self.rank().cmp(&other.rank()))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TLS1_0 => write!(f, "TLS v1.0"),
            Self::TLS1_1 => write!(f, "TLS v1.1"),
            Self::TLS1_2 => write!(f, "TLS v1.2"),
            Self::DTLS1_0 => write!(f, "DTLS v1.0"),
            Self::DTLS1_2 => write!(f, "DTLS v1.2"),
            _ => write!(f, "Unknown {}.{}", self.major, self.minor),
        }
    }
}

impl fmt::Debug for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtls_ordering_is_logical() {
        assert!(ProtocolVersion::DTLS1_2 > ProtocolVersion::DTLS1_0);
        assert!(ProtocolVersion::DTLS1_2.is_newer_than(ProtocolVersion::DTLS1_0));
        assert!(ProtocolVersion::DTLS1_0.as_u16() > ProtocolVersion::DTLS1_2.as_u16());
    }

    #[test]
    fn tls_ordering() {
        assert!(ProtocolVersion::TLS1_0 < ProtocolVersion::TLS1_1);
        assert!(ProtocolVersion::TLS1_1 < ProtocolVersion::TLS1_2);
        assert!(!ProtocolVersion::TLS1_2.is_newer_than(ProtocolVersion::TLS1_2));
    }

    #[test]
    fn families_do_not_compare() {
        assert_eq!(
            ProtocolVersion::TLS1_2.partial_cmp(&ProtocolVersion::DTLS1_2),
            None
        );
        assert!(!ProtocolVersion::TLS1_2.is_newer_than(ProtocolVersion::DTLS1_0));
    }

    #[test]
    fn feature_predicates() {
        assert!(!ProtocolVersion::TLS1_0.supports_explicit_cbc_ivs());
        assert!(ProtocolVersion::TLS1_1.supports_explicit_cbc_ivs());
        assert!(ProtocolVersion::DTLS1_0.supports_explicit_cbc_ivs());
        assert!(ProtocolVersion::DTLS1_2.supports_aead_modes());
        assert!(!ProtocolVersion::TLS1_1.supports_aead_modes());
    }

    #[test]
    fn parse_and_serialize() {
        let (rest, v) = ProtocolVersion::parse(&[0xFE, 0xFD, 0x01]).unwrap();
        assert_eq!(v, ProtocolVersion::DTLS1_2);
        assert_eq!(rest, &[0x01]);
        let mut out = Vec::new();
        v.serialize(&mut out);
        assert_eq!(out, vec![0xFE, 0xFD]);
    }
}
