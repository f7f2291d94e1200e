use nom::bytes::complete::take;
use nom::multi::many0;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::types::{NamedGroup, SignatureScheme};
use crate::util::{all_consumed, put_vec16, put_vec8, vec16, vec8, with_len16};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionType {
    ServerName,
    SupportedGroups,
    EcPointFormats,
    SignatureAlgorithms,
    ApplicationLayerProtocolNegotiation,
    EncryptThenMac,
    ExtendedMasterSecret,
    SessionTicket,
    RenegotiationInfo,
    Unknown(u16),
}

impl ExtensionType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => ExtensionType::ServerName,
            10 => ExtensionType::SupportedGroups,
            11 => ExtensionType::EcPointFormats,
            13 => ExtensionType::SignatureAlgorithms,
            16 => ExtensionType::ApplicationLayerProtocolNegotiation,
            22 => ExtensionType::EncryptThenMac,
            23 => ExtensionType::ExtendedMasterSecret,
            35 => ExtensionType::SessionTicket,
            65281 => ExtensionType::RenegotiationInfo,
            _ => ExtensionType::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ExtensionType::ServerName => 0,
            ExtensionType::SupportedGroups => 10,
            ExtensionType::EcPointFormats => 11,
            ExtensionType::SignatureAlgorithms => 13,
            ExtensionType::ApplicationLayerProtocolNegotiation => 16,
            ExtensionType::EncryptThenMac => 22,
            ExtensionType::ExtendedMasterSecret => 23,
            ExtensionType::SessionTicket => 35,
            ExtensionType::RenegotiationInfo => 65281,
            ExtensionType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ExtensionType> {
        let (input, value) = be_u16(input)?;
        Ok((input, ExtensionType::from_u16(value)))
    }
}

/// The uncompressed point format, the only one we speak.
pub const EC_POINT_FORMAT_UNCOMPRESSED: u8 = 0;

const SNI_HOST_NAME: u8 = 0;

/// A hello extension, decoded according to its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// A host name. Empty when echoed by a server as acknowledgement.
    ServerName(String),
    SupportedGroups(Vec<NamedGroup>),
    EcPointFormats(Vec<u8>),
    SignatureAlgorithms(Vec<SignatureScheme>),
    Alpn(Vec<Vec<u8>>),
    EncryptThenMac,
    ExtendedMasterSecret,
    /// Empty to request a ticket, otherwise a ticket to resume.
    SessionTicket(Vec<u8>),
    /// The previous handshake's verify_data, empty on an initial handshake.
    RenegotiationInfo(Vec<u8>),
    /// Anything we do not interpret, kept verbatim.
    Unknown { extension_type: u16, data: Vec<u8> },
}

impl Extension {
    pub fn extension_type(&self) -> ExtensionType {
        match self {
            Extension::ServerName(_) => ExtensionType::ServerName,
            Extension::SupportedGroups(_) => ExtensionType::SupportedGroups,
            Extension::EcPointFormats(_) => ExtensionType::EcPointFormats,
            Extension::SignatureAlgorithms(_) => ExtensionType::SignatureAlgorithms,
            Extension::Alpn(_) => ExtensionType::ApplicationLayerProtocolNegotiation,
            Extension::EncryptThenMac => ExtensionType::EncryptThenMac,
            Extension::ExtendedMasterSecret => ExtensionType::ExtendedMasterSecret,
            Extension::SessionTicket(_) => ExtensionType::SessionTicket,
            Extension::RenegotiationInfo(_) => ExtensionType::RenegotiationInfo,
            Extension::Unknown { extension_type, .. } => ExtensionType::Unknown(*extension_type),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Extension> {
        let (input, extension_type) = ExtensionType::parse(input)?;
        let (input, data) = vec16(input)?;
        let (_, ext) = Self::parse_data(extension_type, data)?;
        Ok((input, ext))
    }

    fn parse_data(extension_type: ExtensionType, data: &[u8]) -> IResult<&[u8], Extension> {
        let ext = match extension_type {
            ExtensionType::ServerName => {
                if data.is_empty() {
                    Extension::ServerName(String::new())
                } else {
                    let (_, list) = all_consumed(vec16, data)?;
                    let (_, names) = all_consumed(many0(server_name_entry), list)?;
                    let host = names
                        .into_iter()
                        .find_map(|(kind, name)| (kind == SNI_HOST_NAME).then_some(name))
                        .unwrap_or_default();
                    Extension::ServerName(host)
                }
            }
            ExtensionType::SupportedGroups => {
                let (_, list) = all_consumed(vec16, data)?;
                let (_, groups) = all_consumed(many0(NamedGroup::parse), list)?;
                Extension::SupportedGroups(groups)
            }
            ExtensionType::EcPointFormats => {
                let (_, list) = all_consumed(vec8, data)?;
                Extension::EcPointFormats(list.to_vec())
            }
            ExtensionType::SignatureAlgorithms => {
                let (_, list) = all_consumed(vec16, data)?;
                let (_, schemes) = all_consumed(many0(SignatureScheme::parse), list)?;
                Extension::SignatureAlgorithms(schemes)
            }
            ExtensionType::ApplicationLayerProtocolNegotiation => {
                let (_, list) = all_consumed(vec16, data)?;
                let (_, protocols) = all_consumed(many0(non_empty_vec8), list)?;
                Extension::Alpn(protocols.into_iter().map(|p| p.to_vec()).collect())
            }
            ExtensionType::EncryptThenMac => {
                all_consumed(take(0usize), data)?;
                Extension::EncryptThenMac
            }
            ExtensionType::ExtendedMasterSecret => {
                all_consumed(take(0usize), data)?;
                Extension::ExtendedMasterSecret
            }
            ExtensionType::SessionTicket => Extension::SessionTicket(data.to_vec()),
            ExtensionType::RenegotiationInfo => {
                let (_, info) = all_consumed(vec8, data)?;
                Extension::RenegotiationInfo(info.to_vec())
            }
            ExtensionType::Unknown(extension_type) => Extension::Unknown {
                extension_type,
                data: data.to_vec(),
            },
        };
        Ok((&[], ext))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.extension_type().as_u16().to_be_bytes());
        with_len16(output, |out| match self {
            Extension::ServerName(host) => {
                if !host.is_empty() {
                    with_len16(out, |out| {
                        out.push(SNI_HOST_NAME);
                        put_vec16(out, host.as_bytes());
                    });
                }
            }
            Extension::SupportedGroups(groups) => with_len16(out, |out| {
                for g in groups {
                    out.extend_from_slice(&g.as_u16().to_be_bytes());
                }
            }),
            Extension::EcPointFormats(formats) => put_vec8(out, formats),
            Extension::SignatureAlgorithms(schemes) => with_len16(out, |out| {
                for s in schemes {
                    out.extend_from_slice(&s.as_u16().to_be_bytes());
                }
            }),
            Extension::Alpn(protocols) => with_len16(out, |out| {
                for p in protocols {
                    put_vec8(out, p);
                }
            }),
            Extension::EncryptThenMac | Extension::ExtendedMasterSecret => {}
            Extension::SessionTicket(ticket) => out.extend_from_slice(ticket),
            Extension::RenegotiationInfo(info) => put_vec8(out, info),
            Extension::Unknown { data, .. } => out.extend_from_slice(data),
        });
    }
}

fn server_name_entry(input: &[u8]) -> IResult<&[u8], (u8, String)> {
    let (input, kind) = be_u8(input)?;
    let (input, name) = vec16(input)?;
    Ok((input, (kind, String::from_utf8_lossy(name).into_owned())))
}

fn non_empty_vec8(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rest, data) = vec8(input)?;
    if data.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    Ok((rest, data))
}

/// The extensions of one hello message, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    list: Vec<Extension>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.list.iter()
    }

    /// Add an extension, replacing any of the same type.
    pub fn add(&mut self, ext: Extension) {
        let t = ext.extension_type();
        if let Some(slot) = self.list.iter_mut().find(|e| e.extension_type() == t) {
            *slot = ext;
        } else {
            self.list.push(ext);
        }
    }

    pub fn get(&self, t: ExtensionType) -> Option<&Extension> {
        self.list.iter().find(|e| e.extension_type() == t)
    }

    pub fn has(&self, t: ExtensionType) -> bool {
        self.get(t).is_some()
    }

    pub fn types(&self) -> impl Iterator<Item = ExtensionType> + '_ {
        self.list.iter().map(|e| e.extension_type())
    }

    pub fn server_name(&self) -> Option<&str> {
        match self.get(ExtensionType::ServerName)? {
            Extension::ServerName(n) => Some(n),
            _ => None,
        }
    }

    pub fn supported_groups(&self) -> Option<&[NamedGroup]> {
        match self.get(ExtensionType::SupportedGroups)? {
            Extension::SupportedGroups(g) => Some(g),
            _ => None,
        }
    }

    pub fn signature_algorithms(&self) -> Option<&[SignatureScheme]> {
        match self.get(ExtensionType::SignatureAlgorithms)? {
            Extension::SignatureAlgorithms(s) => Some(s),
            _ => None,
        }
    }

    pub fn alpn(&self) -> Option<&[Vec<u8>]> {
        match self.get(ExtensionType::ApplicationLayerProtocolNegotiation)? {
            Extension::Alpn(p) => Some(p),
            _ => None,
        }
    }

    pub fn session_ticket(&self) -> Option<&[u8]> {
        match self.get(ExtensionType::SessionTicket)? {
            Extension::SessionTicket(t) => Some(t),
            _ => None,
        }
    }

    pub fn renegotiation_info(&self) -> Option<&[u8]> {
        match self.get(ExtensionType::RenegotiationInfo)? {
            Extension::RenegotiationInfo(r) => Some(r),
            _ => None,
        }
    }

    /// Parse an optional extensions block. A hello may end without one.
    pub fn parse(input: &[u8]) -> Result<(&[u8], Extensions), Error> {
        if input.is_empty() {
            return Ok((input, Extensions::default()));
        }
        let (rest, block) = vec16(input)?;
        let (_, list) = all_consumed(many0(Extension::parse), block)?;

        let mut seen = Vec::with_capacity(list.len());
        for ext in &list {
            let t = ext.extension_type();
            if seen.contains(&t) {
                return Err(Error::Decode(format!("Duplicate extension {:?}", t)));
            }
            seen.push(t);
        }
        Ok((rest, Extensions { list }))
    }

    /// Serialize, omitting the block entirely when there are no extensions.
    pub fn serialize(&self, output: &mut Vec<u8>) {
        if self.list.is_empty() {
            return;
        }
        with_len16(output, |out| {
            for ext in &self.list {
                ext.serialize(out);
            }
        });
    }
}

impl FromIterator<Extension> for Extensions {
    fn from_iter<T: IntoIterator<Item = Extension>>(iter: T) -> Self {
        let mut e = Extensions::new();
        for ext in iter {
            e.add(ext);
        }
        e
    }
}
