use nom::bytes::complete::take;
use nom::multi::many1;
use nom::number::complete::be_u8;
use nom::IResult;

use super::Extensions;
use crate::types::{
    CipherSuite, CompressionMethod, ProtocolVersion, Random, SessionId,
    EMPTY_RENEGOTIATION_INFO_SCSV, FALLBACK_SCSV,
};
use crate::util::{all_consumed, put_vec8, vec16, vec8, with_len16};
use crate::Error;

/// Largest HelloVerifyRequest cookie (RFC 6347).
pub const MAX_COOKIE_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    /// Present only on datagram transport.
    pub cookie: Option<Vec<u8>>,
    pub cipher_suites: Vec<CipherSuite>,
    pub compression_methods: Vec<CompressionMethod>,
    pub extensions: Extensions,
}

impl ClientHello {
    pub fn parse(input: &[u8], datagram: bool) -> Result<ClientHello, Error> {
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cookie) = if datagram {
            let (input, cookie) = vec8(input)?;
            (input, Some(cookie.to_vec()))
        } else {
            (input, None)
        };
        let (input, suites) = vec16(input)?;
        if suites.is_empty() || suites.len() % 2 != 0 {
            return Err(Error::Decode("Bad ciphersuite list".into()));
        }
        let (_, cipher_suites) = all_consumed(many1(CipherSuite::parse), suites)?;
        let (input, methods) = vec8(input)?;
        let (_, compression_methods) =
            all_consumed(many1(CompressionMethod::parse), methods)?;
        let (rest, extensions) = Extensions::parse(input)?;
        if !rest.is_empty() {
            return Err(Error::Decode("Trailing bytes after ClientHello".into()));
        }

        Ok(ClientHello {
            version,
            random,
            session_id,
            cookie,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        if let Some(cookie) = &self.cookie {
            put_vec8(output, cookie);
        }
        with_len16(output, |out| {
            for s in &self.cipher_suites {
                out.extend_from_slice(&s.as_u16().to_be_bytes());
            }
        });
        output.push(self.compression_methods.len() as u8);
        for m in &self.compression_methods {
            output.push(m.as_u8());
        }
        self.extensions.serialize(output);
    }

    pub fn offers(&self, suite: CipherSuite) -> bool {
        self.cipher_suites.contains(&suite)
    }

    pub fn offers_renegotiation_scsv(&self) -> bool {
        self.cipher_suites
            .iter()
            .any(|s| s.as_u16() == EMPTY_RENEGOTIATION_INFO_SCSV)
    }

    pub fn offers_fallback_scsv(&self) -> bool {
        self.cipher_suites.iter().any(|s| s.as_u16() == FALLBACK_SCSV)
    }

    pub fn offers_null_compression(&self) -> bool {
        self.compression_methods.contains(&CompressionMethod::Null)
    }

    /// Whether the client signals RFC 5746 support, either way.
    pub fn secure_renegotiation(&self) -> bool {
        self.offers_renegotiation_scsv() || self.extensions.renegotiation_info().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cipher_suite: CipherSuite,
    pub compression_method: CompressionMethod,
    pub extensions: Extensions,
}

impl ServerHello {
    pub fn parse(input: &[u8]) -> Result<ServerHello, Error> {
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cipher_suite) = CipherSuite::parse(input)?;
        let (input, compression_method) = CompressionMethod::parse(input)?;
        let (rest, extensions) = Extensions::parse(input)?;
        if !rest.is_empty() {
            return Err(Error::Decode("Trailing bytes after ServerHello".into()));
        }
        Ok(ServerHello {
            version,
            random,
            session_id,
            cipher_suite,
            compression_method,
            extensions,
        })
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        output.extend_from_slice(&self.cipher_suite.as_u16().to_be_bytes());
        output.push(self.compression_method.as_u8());
        self.extensions.serialize(output);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub version: ProtocolVersion,
    pub cookie: Vec<u8>,
}

impl HelloVerifyRequest {
    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, len) = be_u8(input)?;
        let (input, cookie) = take(len)(input)?;
        Ok((
            input,
            HelloVerifyRequest {
                version,
                cookie: cookie.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.version.serialize(output);
        put_vec8(output, &self.cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Extension;

    fn client_hello(datagram: bool) -> ClientHello {
        ClientHello {
            version: ProtocolVersion::TLS1_2,
            random: Random::from_bytes([5; 32]),
            session_id: SessionId::new(&[1, 2, 3]).unwrap(),
            cookie: datagram.then(|| vec![9; 20]),
            cipher_suites: vec![
                CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256,
                CipherSuite::from_u16(EMPTY_RENEGOTIATION_INFO_SCSV),
            ],
            compression_methods: vec![CompressionMethod::Null],
            extensions: [Extension::ExtendedMasterSecret].into_iter().collect(),
        }
    }

    #[test]
    fn client_hello_stream_and_datagram() {
        for datagram in [false, true] {
            let ch = client_hello(datagram);
            let mut out = Vec::new();
            ch.serialize(&mut out);
            let parsed = ClientHello::parse(&out, datagram).unwrap();
            assert_eq!(parsed, ch);
            assert!(parsed.offers_renegotiation_scsv());
            assert!(parsed.secure_renegotiation());
            assert!(!parsed.offers_fallback_scsv());
        }
    }

    #[test]
    fn client_hello_without_extensions() {
        let mut ch = client_hello(false);
        ch.extensions = Extensions::new();
        let mut out = Vec::new();
        ch.serialize(&mut out);
        assert_eq!(ClientHello::parse(&out, false).unwrap(), ch);
    }

    #[test]
    fn client_hello_rejects_empty_suites() {
        let mut ch = client_hello(false);
        ch.cipher_suites.clear();
        let mut out = Vec::new();
        ch.serialize(&mut out);
        assert!(matches!(ClientHello::parse(&out, false), Err(Error::Decode(_))));
    }

    #[test]
    fn client_hello_rejects_trailing_garbage() {
        let mut out = Vec::new();
        client_hello(false).serialize(&mut out);
        out.push(0);
        assert!(ClientHello::parse(&out, false).is_err());
    }

    #[test]
    fn server_hello() {
        let sh = ServerHello {
            version: ProtocolVersion::DTLS1_2,
            random: Random::from_bytes([1; 32]),
            session_id: SessionId::empty(),
            cipher_suite: CipherSuite::PSK_AES128_GCM_SHA256,
            compression_method: CompressionMethod::Null,
            extensions: [Extension::RenegotiationInfo(vec![])].into_iter().collect(),
        };
        let mut out = Vec::new();
        sh.serialize(&mut out);
        assert_eq!(ServerHello::parse(&out).unwrap(), sh);
    }

    #[test]
    fn hello_verify_request() {
        let hvr = HelloVerifyRequest {
            version: ProtocolVersion::DTLS1_0,
            cookie: vec![0xAB; 32],
        };
        let mut out = Vec::new();
        hvr.serialize(&mut out);
        assert_eq!(out.len(), 2 + 1 + 32);
        let (_, parsed) = HelloVerifyRequest::parse(&out).unwrap();
        assert_eq!(parsed, hvr);
    }
}
