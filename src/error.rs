use thiserror::Error;

use crate::alert::AlertDescription;
use crate::types::ProtocolVersion;

/// Errors produced by the channel.
///
/// Errors that originate from the peer's input carry the alert that is sent
/// before the channel closes, see [`Error::alert`].
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Record overflow: {0} bytes")]
    RecordOverflow(usize),

    /// MAC, padding or AEAD tag failure. Deliberately carries no detail.
    #[error("Bad record MAC")]
    BadRecordMac,

    #[error("Decrypt error: {0}")]
    DecryptError(&'static str),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Handshake failure: {0}")]
    HandshakeFailure(String),

    #[error("Unsupported protocol version {0}")]
    ProtocolVersion(ProtocolVersion),

    #[error("Inappropriate version fallback")]
    InappropriateFallback,

    #[error("Illegal parameter: {0}")]
    IllegalParameter(String),

    #[error("Bad certificate: {0}")]
    BadCertificate(String),

    #[error("Insufficient security: {0}")]
    InsufficientSecurity(String),

    #[error("Unsupported extension: {0}")]
    UnsupportedExtension(String),

    #[error("Unknown PSK identity")]
    UnknownPskIdentity,

    #[error("No application protocol in common")]
    NoApplicationProtocol,

    #[error("Sequence number overflow")]
    SequenceOverflow,

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Peer sent fatal alert: {0}")]
    PeerAlert(AlertDescription),

    #[error("Channel is closed")]
    Closed,

    #[error("Channel has no established session")]
    NotEstablished,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(&'static str),
}

impl Error {
    /// The alert to send to the peer for this error, if any.
    pub fn alert(&self) -> Option<AlertDescription> {
        use AlertDescription as A;
        let a = match self {
            Error::Decode(_) => A::DecodeError,
            Error::RecordOverflow(_) => A::RecordOverflow,
            Error::BadRecordMac => A::BadRecordMac,
            Error::DecryptError(_) => A::DecryptError,
            Error::UnexpectedMessage(_) => A::UnexpectedMessage,
            Error::HandshakeFailure(_) => A::HandshakeFailure,
            Error::ProtocolVersion(_) => A::ProtocolVersion,
            Error::InappropriateFallback => A::InappropriateFallback,
            Error::IllegalParameter(_) => A::IllegalParameter,
            Error::BadCertificate(_) => A::BadCertificate,
            Error::InsufficientSecurity(_) => A::InsufficientSecurity,
            Error::UnsupportedExtension(_) => A::UnsupportedExtension,
            Error::UnknownPskIdentity => A::UnknownPskIdentity,
            Error::NoApplicationProtocol => A::NoApplicationProtocol,
            Error::SequenceOverflow | Error::CryptoError(_) | Error::InternalError(_) => {
                A::InternalError
            }
            // Handshake timeouts close the channel without telling a peer
            // that is not answering anyway.
            Error::PeerAlert(_)
            | Error::Closed
            | Error::NotEstablished
            | Error::Config(_)
            | Error::Timeout(_) => return None,
        };
        Some(a)
    }

    /// Whether this error terminates the channel.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::NotEstablished | Error::Config(_))
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::Decode("truncated message".to_string()),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                Error::Decode(format!("{:?} with {} bytes left", e.code, e.input.len()))
            }
        }
    }
}
