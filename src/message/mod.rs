//! Handshake message bodies.
//!
//! Every message kind is one variant of [`Body`]. The handshake header
//! (type, length and the datagram fragment fields) is handled by the
//! handshake IO layer, so everything here starts at the body.

use nom::number::complete::{be_u32, be_u8};
use nom::IResult;

use crate::types::{KeyExchangeAlgorithm, ProtocolVersion};
use crate::util::{all_consumed, put_vec16, vec16};
use crate::Error;

mod certificate;
mod extension;
mod hello;
mod key_exchange;

pub use certificate::{Certificate, CertificateRequest, CertificateVerify, DigitallySigned};
pub use extension::{Extension, ExtensionType, Extensions, EC_POINT_FORMAT_UNCOMPRESSED};
pub use hello::{ClientHello, HelloVerifyRequest, ServerHello, MAX_COOKIE_LEN};
pub use key_exchange::{ClientKeyExchange, EcdheParams, ServerKeyExchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeType {
    HelloRequest,
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    NewSessionTicket,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    Unknown(u8),
}

impl HandshakeType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => HandshakeType::HelloRequest,
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            3 => HandshakeType::HelloVerifyRequest,
            4 => HandshakeType::NewSessionTicket,
            11 => HandshakeType::Certificate,
            12 => HandshakeType::ServerKeyExchange,
            13 => HandshakeType::CertificateRequest,
            14 => HandshakeType::ServerHelloDone,
            15 => HandshakeType::CertificateVerify,
            16 => HandshakeType::ClientKeyExchange,
            20 => HandshakeType::Finished,
            _ => HandshakeType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            HandshakeType::HelloRequest => 0,
            HandshakeType::ClientHello => 1,
            HandshakeType::ServerHello => 2,
            HandshakeType::HelloVerifyRequest => 3,
            HandshakeType::NewSessionTicket => 4,
            HandshakeType::Certificate => 11,
            HandshakeType::ServerKeyExchange => 12,
            HandshakeType::CertificateRequest => 13,
            HandshakeType::ServerHelloDone => 14,
            HandshakeType::CertificateVerify => 15,
            HandshakeType::ClientKeyExchange => 16,
            HandshakeType::Finished => 20,
            HandshakeType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], HandshakeType> {
        let (input, value) = be_u8(input)?;
        Ok((input, HandshakeType::from_u8(value)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket {
    /// Seconds, 0 when unspecified.
    pub lifetime_hint: u32,
    pub ticket: Vec<u8>,
}

impl NewSessionTicket {
    fn parse(input: &[u8]) -> IResult<&[u8], NewSessionTicket> {
        let (input, lifetime_hint) = be_u32(input)?;
        let (input, ticket) = vec16(input)?;
        Ok((
            input,
            NewSessionTicket {
                lifetime_hint,
                ticket: ticket.to_vec(),
            },
        ))
    }
}

/// What the parser needs to know beyond the message bytes.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext {
    pub datagram: bool,
    pub version: ProtocolVersion,
    /// Set once a ciphersuite has been negotiated.
    pub key_exchange: Option<KeyExchangeAlgorithm>,
}

/// A handshake message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    HelloRequest,
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    HelloVerifyRequest(HelloVerifyRequest),
    NewSessionTicket(NewSessionTicket),
    Certificate(Certificate),
    ServerKeyExchange(ServerKeyExchange),
    CertificateRequest(CertificateRequest),
    ServerHelloDone,
    CertificateVerify(CertificateVerify),
    ClientKeyExchange(ClientKeyExchange),
    Finished(Finished),
}

impl Body {
    pub fn handshake_type(&self) -> HandshakeType {
        match self {
            Body::HelloRequest => HandshakeType::HelloRequest,
            Body::ClientHello(_) => HandshakeType::ClientHello,
            Body::ServerHello(_) => HandshakeType::ServerHello,
            Body::HelloVerifyRequest(_) => HandshakeType::HelloVerifyRequest,
            Body::NewSessionTicket(_) => HandshakeType::NewSessionTicket,
            Body::Certificate(_) => HandshakeType::Certificate,
            Body::ServerKeyExchange(_) => HandshakeType::ServerKeyExchange,
            Body::CertificateRequest(_) => HandshakeType::CertificateRequest,
            Body::ServerHelloDone => HandshakeType::ServerHelloDone,
            Body::CertificateVerify(_) => HandshakeType::CertificateVerify,
            Body::ClientKeyExchange(_) => HandshakeType::ClientKeyExchange,
            Body::Finished(_) => HandshakeType::Finished,
        }
    }

    pub fn parse(msg_type: HandshakeType, input: &[u8], ctx: &ParseContext) -> Result<Body, Error> {
        let need_kex = || {
            ctx.key_exchange
                .ok_or_else(|| Error::UnexpectedMessage(format!("{:?} before ServerHello", msg_type)))
        };
        let body = match msg_type {
            HandshakeType::HelloRequest => {
                expect_empty(input, msg_type)?;
                Body::HelloRequest
            }
            HandshakeType::ClientHello => Body::ClientHello(ClientHello::parse(input, ctx.datagram)?),
            HandshakeType::ServerHello => Body::ServerHello(ServerHello::parse(input)?),
            HandshakeType::HelloVerifyRequest => {
                let (_, hvr) = all_consumed(HelloVerifyRequest::parse, input)?;
                Body::HelloVerifyRequest(hvr)
            }
            HandshakeType::NewSessionTicket => {
                let (_, nst) = all_consumed(NewSessionTicket::parse, input)?;
                Body::NewSessionTicket(nst)
            }
            HandshakeType::Certificate => Body::Certificate(Certificate::parse(input)?),
            HandshakeType::ServerKeyExchange => Body::ServerKeyExchange(ServerKeyExchange::parse(
                input,
                need_kex()?,
                ctx.version,
            )?),
            HandshakeType::CertificateRequest => {
                Body::CertificateRequest(CertificateRequest::parse(input, ctx.version)?)
            }
            HandshakeType::ServerHelloDone => {
                expect_empty(input, msg_type)?;
                Body::ServerHelloDone
            }
            HandshakeType::CertificateVerify => {
                Body::CertificateVerify(CertificateVerify::parse(input, ctx.version)?)
            }
            HandshakeType::ClientKeyExchange => {
                Body::ClientKeyExchange(ClientKeyExchange::parse(input, need_kex()?)?)
            }
            HandshakeType::Finished => Body::Finished(Finished {
                verify_data: input.to_vec(),
            }),
            HandshakeType::Unknown(t) => {
                return Err(Error::UnexpectedMessage(format!(
                    "Unknown handshake type {}",
                    t
                )))
            }
        };
        Ok(body)
    }

    pub fn serialize(&self, output: &mut Vec<u8>, version: ProtocolVersion) {
        match self {
            Body::HelloRequest | Body::ServerHelloDone => {}
            Body::ClientHello(m) => m.serialize(output),
            Body::ServerHello(m) => m.serialize(output),
            Body::HelloVerifyRequest(m) => m.serialize(output),
            Body::NewSessionTicket(m) => {
                output.extend_from_slice(&m.lifetime_hint.to_be_bytes());
                put_vec16(output, &m.ticket);
            }
            Body::Certificate(m) => m.serialize(output),
            Body::ServerKeyExchange(m) => m.serialize(output),
            Body::CertificateRequest(m) => m.serialize(output, version),
            Body::CertificateVerify(m) => m.serialize(output),
            Body::ClientKeyExchange(m) => m.serialize(output),
            Body::Finished(m) => output.extend_from_slice(&m.verify_data),
        }
    }
}

fn expect_empty(input: &[u8], msg_type: HandshakeType) -> Result<(), Error> {
    if input.is_empty() {
        Ok(())
    } else {
        Err(Error::Decode(format!("{:?} must be empty", msg_type)))
    }
}
