use nom::multi::many0;
use nom::number::complete::be_u16;

use crate::types::{ProtocolVersion, SignatureScheme};
use crate::util::{all_consumed, put_vec16, put_vec24, put_vec8, vec16, vec24, vec8, with_len16};
use crate::Error;

/// A certificate chain, leaf first, each entry DER encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Certificate {
    pub chain: Vec<Vec<u8>>,
}

impl Certificate {
    pub fn parse(input: &[u8]) -> Result<Certificate, Error> {
        let (_, list) = all_consumed(vec24, input)?;
        let (_, certs) = all_consumed(many0(vec24), list)?;
        if certs.iter().any(|c| c.is_empty()) {
            return Err(Error::Decode("Empty certificate in chain".into()));
        }
        Ok(Certificate {
            chain: certs.into_iter().map(|c| c.to_vec()).collect(),
        })
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        let mut list = Vec::new();
        for cert in &self.chain {
            put_vec24(&mut list, cert);
        }
        put_vec24(output, &list);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    /// ClientCertificateType codes, 1 = rsa_sign, 64 = ecdsa_sign.
    pub certificate_types: Vec<u8>,
    /// Only on the wire from TLS 1.2 / DTLS 1.2.
    pub signature_schemes: Vec<SignatureScheme>,
    /// DER encoded distinguished names.
    pub authorities: Vec<Vec<u8>>,
}

impl CertificateRequest {
    pub fn parse(input: &[u8], version: ProtocolVersion) -> Result<CertificateRequest, Error> {
        let (input, types) = vec8(input)?;
        if types.is_empty() {
            return Err(Error::Decode("No certificate types requested".into()));
        }
        let (input, signature_schemes) = if version.supports_negotiable_signature_algorithms() {
            let (input, list) = vec16(input)?;
            let (_, schemes) = all_consumed(many0(SignatureScheme::parse), list)?;
            (input, schemes)
        } else {
            (input, Vec::new())
        };
        let (_, names) = all_consumed(vec16, input)?;
        let (_, authorities) = all_consumed(many0(vec16), names)?;
        Ok(CertificateRequest {
            certificate_types: types.to_vec(),
            signature_schemes,
            authorities: authorities.into_iter().map(|a| a.to_vec()).collect(),
        })
    }

    pub fn serialize(&self, output: &mut Vec<u8>, version: ProtocolVersion) {
        put_vec8(output, &self.certificate_types);
        if version.supports_negotiable_signature_algorithms() {
            with_len16(output, |out| {
                for s in &self.signature_schemes {
                    out.extend_from_slice(&s.as_u16().to_be_bytes());
                }
            });
        }
        with_len16(output, |out| {
            for a in &self.authorities {
                put_vec16(out, a);
            }
        });
    }
}

/// A signature, tagged with its scheme from TLS 1.2 on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitallySigned {
    pub scheme: Option<SignatureScheme>,
    pub signature: Vec<u8>,
}

impl DigitallySigned {
    pub fn parse(input: &[u8], version: ProtocolVersion) -> Result<(&[u8], DigitallySigned), Error> {
        let (input, scheme) = if version.supports_negotiable_signature_algorithms() {
            let (input, v) = be_u16(input)?;
            (input, Some(SignatureScheme::from_u16(v)))
        } else {
            (input, None)
        };
        let (input, signature) = vec16(input)?;
        Ok((
            input,
            DigitallySigned {
                scheme,
                signature: signature.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        if let Some(s) = self.scheme {
            output.extend_from_slice(&s.as_u16().to_be_bytes());
        }
        put_vec16(output, &self.signature);
    }
}

/// Proof of possession of the client certificate's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub signed: DigitallySigned,
}

impl CertificateVerify {
    pub fn parse(input: &[u8], version: ProtocolVersion) -> Result<CertificateVerify, Error> {
        let (rest, signed) = DigitallySigned::parse(input, version)?;
        if !rest.is_empty() {
            return Err(Error::Decode("Trailing bytes after CertificateVerify".into()));
        }
        Ok(CertificateVerify { signed })
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.signed.serialize(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_chain() {
        let c = Certificate {
            chain: vec![vec![1; 10], vec![2; 300]],
        };
        let mut out = Vec::new();
        c.serialize(&mut out);
        assert_eq!(out.len(), 3 + 3 + 10 + 3 + 300);
        assert_eq!(Certificate::parse(&out).unwrap(), c);
    }

    #[test]
    fn empty_certificate_message() {
        let mut out = Vec::new();
        Certificate::default().serialize(&mut out);
        assert_eq!(out, vec![0, 0, 0]);
        assert!(Certificate::parse(&out).unwrap().chain.is_empty());
    }

    #[test]
    fn certificate_request_by_version() {
        let req = CertificateRequest {
            certificate_types: vec![1, 64],
            signature_schemes: vec![SignatureScheme::RSA_PKCS1_SHA256],
            authorities: vec![vec![0x30, 0x00]],
        };

        let mut out = Vec::new();
        req.serialize(&mut out, ProtocolVersion::TLS1_2);
        assert_eq!(
            CertificateRequest::parse(&out, ProtocolVersion::TLS1_2).unwrap(),
            req
        );

        let mut out = Vec::new();
        req.serialize(&mut out, ProtocolVersion::TLS1_0);
        let parsed = CertificateRequest::parse(&out, ProtocolVersion::TLS1_0).unwrap();
        assert!(parsed.signature_schemes.is_empty());
        assert_eq!(parsed.authorities, req.authorities);
    }

    #[test]
    fn certificate_verify_legacy_has_no_scheme() {
        let cv = CertificateVerify {
            signed: DigitallySigned {
                scheme: None,
                signature: vec![7; 64],
            },
        };
        let mut out = Vec::new();
        cv.serialize(&mut out);
        assert_eq!(out.len(), 66);
        assert_eq!(
            CertificateVerify::parse(&out, ProtocolVersion::TLS1_1).unwrap(),
            cv
        );
    }
}
