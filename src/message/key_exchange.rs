use nom::number::complete::{be_u16, be_u8};

use super::DigitallySigned;
use crate::types::{KeyExchangeAlgorithm, NamedGroup, ProtocolVersion};
use crate::util::{all_consumed, put_vec16, put_vec8, vec16, vec8};
use crate::Error;

/// ECCurveType named_curve.
const NAMED_CURVE: u8 = 3;

/// The server's ephemeral ECDH share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdheParams {
    pub group: NamedGroup,
    pub public: Vec<u8>,
}

impl EcdheParams {
    fn parse(input: &[u8]) -> Result<(&[u8], EcdheParams), Error> {
        let (input, curve_type) = be_u8(input)?;
        if curve_type != NAMED_CURVE {
            return Err(Error::IllegalParameter(format!(
                "Unsupported curve type {}",
                curve_type
            )));
        }
        let (input, group) = be_u16(input)?;
        let (input, public) = vec8(input)?;
        if public.is_empty() {
            return Err(Error::Decode("Empty ECDH public key".into()));
        }
        Ok((
            input,
            EcdheParams {
                group: NamedGroup::from_u16(group),
                public: public.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(NAMED_CURVE);
        output.extend_from_slice(&self.group.as_u16().to_be_bytes());
        put_vec8(output, &self.public);
    }

    /// The bytes covered by the server's signature.
    pub fn signed_content(&self, client_random: &[u8; 32], server_random: &[u8; 32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + 4 + self.public.len());
        out.extend_from_slice(client_random);
        out.extend_from_slice(server_random);
        self.serialize(&mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerKeyExchange {
    Ecdhe {
        params: EcdheParams,
        signed: DigitallySigned,
    },
    Psk {
        identity_hint: Vec<u8>,
    },
}

impl ServerKeyExchange {
    pub fn parse(
        input: &[u8],
        kex: KeyExchangeAlgorithm,
        version: ProtocolVersion,
    ) -> Result<ServerKeyExchange, Error> {
        let (rest, ske) = match kex {
            KeyExchangeAlgorithm::Ecdhe => {
                let (input, params) = EcdheParams::parse(input)?;
                let (input, signed) = DigitallySigned::parse(input, version)?;
                (input, ServerKeyExchange::Ecdhe { params, signed })
            }
            KeyExchangeAlgorithm::Psk => {
                let (input, hint) = vec16(input)?;
                (
                    input,
                    ServerKeyExchange::Psk {
                        identity_hint: hint.to_vec(),
                    },
                )
            }
            KeyExchangeAlgorithm::Rsa => {
                return Err(Error::UnexpectedMessage(
                    "ServerKeyExchange with RSA key transport".into(),
                ))
            }
        };
        if !rest.is_empty() {
            return Err(Error::Decode("Trailing bytes after ServerKeyExchange".into()));
        }
        Ok(ske)
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        match self {
            ServerKeyExchange::Ecdhe { params, signed } => {
                params.serialize(output);
                signed.serialize(output);
            }
            ServerKeyExchange::Psk { identity_hint } => put_vec16(output, identity_hint),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKeyExchange {
    Ecdhe { public: Vec<u8> },
    /// RSA-encrypted premaster secret.
    Rsa { encrypted: Vec<u8> },
    Psk { identity: Vec<u8> },
}

impl ClientKeyExchange {
    pub fn parse(input: &[u8], kex: KeyExchangeAlgorithm) -> Result<ClientKeyExchange, Error> {
        let cke = match kex {
            KeyExchangeAlgorithm::Ecdhe => {
                let (_, public) = all_consumed(vec8, input)?;
                if public.is_empty() {
                    return Err(Error::Decode("Empty ECDH public key".into()));
                }
                ClientKeyExchange::Ecdhe {
                    public: public.to_vec(),
                }
            }
            KeyExchangeAlgorithm::Rsa => {
                let (_, encrypted) = all_consumed(vec16, input)?;
                ClientKeyExchange::Rsa {
                    encrypted: encrypted.to_vec(),
                }
            }
            KeyExchangeAlgorithm::Psk => {
                let (_, identity) = all_consumed(vec16, input)?;
                ClientKeyExchange::Psk {
                    identity: identity.to_vec(),
                }
            }
        };
        Ok(cke)
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        match self {
            ClientKeyExchange::Ecdhe { public } => put_vec8(output, public),
            ClientKeyExchange::Rsa { encrypted } => put_vec16(output, encrypted),
            ClientKeyExchange::Psk { identity } => put_vec16(output, identity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignatureScheme;

    #[test]
    fn ecdhe_server_key_exchange() {
        let ske = ServerKeyExchange::Ecdhe {
            params: EcdheParams {
                group: NamedGroup::X25519,
                public: vec![4; 32],
            },
            signed: DigitallySigned {
                scheme: Some(SignatureScheme::ECDSA_SECP256R1_SHA256),
                signature: vec![1; 70],
            },
        };
        let mut out = Vec::new();
        ske.serialize(&mut out);
        let parsed =
            ServerKeyExchange::parse(&out, KeyExchangeAlgorithm::Ecdhe, ProtocolVersion::TLS1_2)
                .unwrap();
        assert_eq!(parsed, ske);
    }

    #[test]
    fn signed_content_layout() {
        let params = EcdheParams {
            group: NamedGroup::Secp256r1,
            public: vec![4; 65],
        };
        let content = params.signed_content(&[1; 32], &[2; 32]);
        assert_eq!(&content[..32], &[1; 32]);
        assert_eq!(&content[32..64], &[2; 32]);
        assert_eq!(&content[64..68], &[3, 0, 23, 65]);
        assert_eq!(content.len(), 64 + 4 + 65);
    }

    #[test]
    fn explicit_curves_rejected() {
        let input = [1u8, 0, 23, 1, 4];
        assert!(matches!(
            ServerKeyExchange::parse(&input, KeyExchangeAlgorithm::Ecdhe, ProtocolVersion::TLS1_2),
            Err(Error::IllegalParameter(_))
        ));
    }

    #[test]
    fn psk_hint_and_identity() {
        let ske = ServerKeyExchange::Psk {
            identity_hint: b"hint".to_vec(),
        };
        let mut out = Vec::new();
        ske.serialize(&mut out);
        assert_eq!(
            ServerKeyExchange::parse(&out, KeyExchangeAlgorithm::Psk, ProtocolVersion::TLS1_0)
                .unwrap(),
            ske
        );

        let cke = ClientKeyExchange::Psk {
            identity: b"client".to_vec(),
        };
        let mut out = Vec::new();
        cke.serialize(&mut out);
        assert_eq!(
            ClientKeyExchange::parse(&out, KeyExchangeAlgorithm::Psk).unwrap(),
            cke
        );
    }

    #[test]
    fn rsa_client_key_exchange_length_checked() {
        let mut out = Vec::new();
        ClientKeyExchange::Rsa {
            encrypted: vec![0; 256],
        }
        .serialize(&mut out);
        out.pop();
        assert!(ClientKeyExchange::parse(&out, KeyExchangeAlgorithm::Rsa).is_err());
    }
}
