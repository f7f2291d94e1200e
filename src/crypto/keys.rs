//! Private key loading, signing, and peer public keys taken from certificates.

use der::{Decode, Encode};
use p256::ecdsa::{
    Signature as P256Signature, SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey,
};
use p384::ecdsa::{
    Signature as P384Signature, SigningKey as P384SigningKey, VerifyingKey as P384VerifyingKey,
};
use pkcs8::DecodePrivateKey;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use spki::ObjectIdentifier;
use x509_cert::Certificate as X509Certificate;

use crate::types::{HashAlgorithm, NamedGroup, SignatureAlgorithm, SignatureScheme};
use crate::Error;

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_P256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_P384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// A private key able to sign handshake messages, and for RSA to decrypt
/// the premaster secret.
pub enum PrivateKey {
    EcdsaP256(P256SigningKey),
    EcdsaP384(P384SigningKey),
    Rsa(RsaPrivateKey),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivateKey::EcdsaP256(_) => f.debug_tuple("PrivateKey::EcdsaP256").finish(),
            PrivateKey::EcdsaP384(_) => f.debug_tuple("PrivateKey::EcdsaP384").finish(),
            PrivateKey::Rsa(k) => f
                .debug_tuple("PrivateKey::Rsa")
                .field(&(k.size() * 8))
                .finish(),
        }
    }
}

impl PrivateKey {
    /// Load a private key from PKCS#8 DER, SEC1 DER, PKCS#1 DER or a PEM
    /// encoding of any of these.
    pub fn from_der(key_der: &[u8]) -> Result<Self, Error> {
        if let Ok(key) = P256SigningKey::from_pkcs8_der(key_der) {
            return Ok(PrivateKey::EcdsaP256(key));
        }
        if let Ok(key) = P384SigningKey::from_pkcs8_der(key_der) {
            return Ok(PrivateKey::EcdsaP384(key));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(key_der) {
            return Ok(PrivateKey::Rsa(key));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_der(key_der) {
            return Ok(PrivateKey::Rsa(key));
        }

        // SEC1 (OpenSSL "EC PRIVATE KEY") carries the curve as an optional
        // parameter, otherwise the scalar length tells the curve apart.
        if let Ok(ec_key) = sec1::EcPrivateKey::try_from(key_der) {
            let curve = match &ec_key.parameters {
                Some(sec1::EcParameters::NamedCurve(oid)) => Some(*oid),
                None if ec_key.private_key.len() == 32 => Some(OID_P256),
                None if ec_key.private_key.len() == 48 => Some(OID_P384),
                None => None,
            };
            match curve {
                Some(OID_P256) => {
                    let key = P256SigningKey::from_slice(ec_key.private_key)
                        .map_err(|_| Error::Config("Invalid P-256 private key".into()))?;
                    return Ok(PrivateKey::EcdsaP256(key));
                }
                Some(OID_P384) => {
                    let key = P384SigningKey::from_slice(ec_key.private_key)
                        .map_err(|_| Error::Config("Invalid P-384 private key".into()))?;
                    return Ok(PrivateKey::EcdsaP384(key));
                }
                _ => {}
            }
        }

        if let Ok(pem_str) = std::str::from_utf8(key_der) {
            if pem_str.contains("-----BEGIN") {
                if let Ok((_label, doc)) = pkcs8::Document::from_pem(pem_str) {
                    return Self::from_der(doc.as_bytes());
                }
            }
        }

        Err(Error::Config(
            "Failed to parse private key in any supported format".into(),
        ))
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            PrivateKey::EcdsaP256(_) | PrivateKey::EcdsaP384(_) => SignatureAlgorithm::Ecdsa,
            PrivateKey::Rsa(_) => SignatureAlgorithm::Rsa,
        }
    }

    /// Schemes this key can sign with, in preference order.
    pub fn schemes(&self) -> &'static [SignatureScheme] {
        match self {
            PrivateKey::EcdsaP256(_) => &[
                SignatureScheme::ECDSA_SECP256R1_SHA256,
                SignatureScheme::ECDSA_SECP384R1_SHA384,
                SignatureScheme::ECDSA_SHA1,
            ],
            PrivateKey::EcdsaP384(_) => &[
                SignatureScheme::ECDSA_SECP384R1_SHA384,
                SignatureScheme::ECDSA_SECP256R1_SHA256,
                SignatureScheme::ECDSA_SHA1,
            ],
            PrivateKey::Rsa(_) => &[
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA1,
            ],
        }
    }

    /// Sign an already computed digest of `hash`.
    ///
    /// ECDSA signatures are DER encoded. RSA uses PKCS#1 v1.5, where the
    /// legacy MD5+SHA-1 digest is signed without an algorithm identifier.
    pub fn sign(&self, hash: HashAlgorithm, digest: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            PrivateKey::EcdsaP256(key) => {
                let sig: P256Signature = key
                    .sign_prehash(digest)
                    .map_err(|_| Error::CryptoError("ECDSA signing failed".into()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            PrivateKey::EcdsaP384(key) => {
                let sig: P384Signature = key
                    .sign_prehash(digest)
                    .map_err(|_| Error::CryptoError("ECDSA signing failed".into()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            PrivateKey::Rsa(key) => key
                .sign_with_rng(&mut OsRng, rsa_padding(hash), digest)
                .map_err(|e| Error::CryptoError(format!("RSA signing failed: {}", e))),
        }
    }

    /// Decrypt an RSA-encrypted premaster secret.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            PrivateKey::Rsa(key) => key
                .decrypt_blinded(&mut OsRng, Pkcs1v15Encrypt, ciphertext)
                .map_err(|_| Error::DecryptError("RSA decryption failed")),
            _ => Err(Error::InternalError("Key cannot decrypt".into())),
        }
    }

    /// Key strength in bits, for policy checks.
    pub fn bits(&self) -> usize {
        match self {
            PrivateKey::EcdsaP256(_) => 256,
            PrivateKey::EcdsaP384(_) => 384,
            PrivateKey::Rsa(k) => k.size() * 8,
        }
    }
}

fn rsa_padding(hash: HashAlgorithm) -> Pkcs1v15Sign {
    match hash {
        HashAlgorithm::Md5Sha1 => Pkcs1v15Sign::new_unprefixed(),
        HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
    }
}

/// The peer's public key, taken from its end-entity certificate.
#[derive(Debug, Clone)]
pub enum PeerKey {
    EcdsaP256(P256VerifyingKey),
    EcdsaP384(P384VerifyingKey),
    Rsa(RsaPublicKey),
}

impl PeerKey {
    pub fn from_certificate(cert_der: &[u8]) -> Result<Self, Error> {
        let cert = X509Certificate::from_der(cert_der)
            .map_err(|e| Error::BadCertificate(format!("Failed to parse certificate: {e}")))?;
        let spki = &cert.tbs_certificate.subject_public_key_info;

        if spki.algorithm.oid == OID_RSA_ENCRYPTION {
            let spki_der = spki
                .to_der()
                .map_err(|_| Error::BadCertificate("Invalid RSA public key".into()))?;
            let key = RsaPublicKey::from_public_key_der(&spki_der)
                .map_err(|_| Error::BadCertificate("Invalid RSA public key".into()))?;
            return Ok(PeerKey::Rsa(key));
        }

        if spki.algorithm.oid != OID_EC_PUBLIC_KEY {
            return Err(Error::BadCertificate(format!(
                "Unsupported public key algorithm: {}",
                spki.algorithm.oid
            )));
        }

        let pubkey_bytes = spki
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| Error::BadCertificate("Invalid EC public key bitstring".into()))?;

        let curve_oid: ObjectIdentifier = spki
            .algorithm
            .parameters
            .as_ref()
            .ok_or_else(|| Error::BadCertificate("Missing EC curve parameter".into()))?
            .decode_as()
            .map_err(|_| Error::BadCertificate("Invalid EC curve parameter".into()))?;

        match curve_oid {
            OID_P256 => P256VerifyingKey::from_sec1_bytes(pubkey_bytes)
                .map(PeerKey::EcdsaP256)
                .map_err(|_| Error::BadCertificate("Invalid P-256 public key".into())),
            OID_P384 => P384VerifyingKey::from_sec1_bytes(pubkey_bytes)
                .map(PeerKey::EcdsaP384)
                .map_err(|_| Error::BadCertificate("Invalid P-384 public key".into())),
            _ => Err(Error::BadCertificate(format!(
                "Unsupported EC curve: {}",
                curve_oid
            ))),
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            PeerKey::EcdsaP256(_) | PeerKey::EcdsaP384(_) => SignatureAlgorithm::Ecdsa,
            PeerKey::Rsa(_) => SignatureAlgorithm::Rsa,
        }
    }

    pub fn curve(&self) -> Option<NamedGroup> {
        match self {
            PeerKey::EcdsaP256(_) => Some(NamedGroup::Secp256r1),
            PeerKey::EcdsaP384(_) => Some(NamedGroup::Secp384r1),
            PeerKey::Rsa(_) => None,
        }
    }

    pub fn bits(&self) -> usize {
        match self {
            PeerKey::EcdsaP256(_) => 256,
            PeerKey::EcdsaP384(_) => 384,
            PeerKey::Rsa(k) => k.size() * 8,
        }
    }

    /// Verify `signature` over a digest computed with `hash`.
    ///
    /// Any failure is reported as `decrypt_error`.
    pub fn verify(
        &self,
        hash: HashAlgorithm,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        let ok = match self {
            PeerKey::EcdsaP256(key) => P256Signature::from_der(signature)
                .map(|sig| key.verify_prehash(digest, &sig).is_ok())
                .unwrap_or(false),
            PeerKey::EcdsaP384(key) => P384Signature::from_der(signature)
                .map(|sig| key.verify_prehash(digest, &sig).is_ok())
                .unwrap_or(false),
            PeerKey::Rsa(key) => key.verify(rsa_padding(hash), digest, signature).is_ok(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::DecryptError("Signature verification failed"))
        }
    }

    /// Encrypt the premaster secret for RSA key transport.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            PeerKey::Rsa(key) => key
                .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
                .map_err(|e| Error::CryptoError(format!("RSA encryption failed: {}", e))),
            _ => Err(Error::HandshakeFailure(
                "RSA key exchange with a non-RSA certificate".into(),
            )),
        }
    }
}
