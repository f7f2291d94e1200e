//! Ephemeral elliptic curve key agreement for ECDHE suites.

use p256::{ecdh::EphemeralSecret as P256Secret, PublicKey as P256PublicKey};
use p384::{ecdh::EphemeralSecret as P384Secret, PublicKey as P384PublicKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::types::NamedGroup;
use crate::Error;

/// One side of an in-progress key agreement.
pub trait KeyAgreement: Send {
    /// The group this exchange runs over.
    fn group(&self) -> NamedGroup;

    /// Our public value, as sent in the key exchange message.
    fn public_key(&self) -> &[u8];

    /// Combine with the peer's public value into the shared secret.
    fn agree(self: Box<Self>, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;
}

/// Groups this implementation can run key agreement over.
pub fn is_supported(group: NamedGroup) -> bool {
    matches!(
        group,
        NamedGroup::Secp256r1 | NamedGroup::Secp384r1 | NamedGroup::X25519
    )
}

/// Generate a fresh ephemeral key for `group`.
pub fn start(group: NamedGroup) -> Result<Box<dyn KeyAgreement>, Error> {
    let kx = match group {
        NamedGroup::Secp256r1 => {
            let secret = P256Secret::random(&mut OsRng);
            let public_key = P256PublicKey::from(&secret).to_sec1_bytes().to_vec();
            EcdhKeyAgreement::P256 { secret, public_key }
        }
        NamedGroup::Secp384r1 => {
            let secret = P384Secret::random(&mut OsRng);
            let public_key = P384PublicKey::from(&secret).to_sec1_bytes().to_vec();
            EcdhKeyAgreement::P384 { secret, public_key }
        }
        NamedGroup::X25519 => {
            let secret = x25519_dalek::EphemeralSecret::random();
            let public_key = x25519_dalek::PublicKey::from(&secret).as_bytes().to_vec();
            EcdhKeyAgreement::X25519 { secret, public_key }
        }
        NamedGroup::Unknown(v) => {
            return Err(Error::HandshakeFailure(format!(
                "Unsupported key exchange group: {}",
                v
            )))
        }
    };
    Ok(Box::new(kx))
}

enum EcdhKeyAgreement {
    P256 {
        secret: P256Secret,
        public_key: Vec<u8>,
    },
    P384 {
        secret: P384Secret,
        public_key: Vec<u8>,
    },
    X25519 {
        secret: x25519_dalek::EphemeralSecret,
        public_key: Vec<u8>,
    },
}

impl std::fmt::Debug for EcdhKeyAgreement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhKeyAgreement")
            .field("group", &self.group())
            .finish_non_exhaustive()
    }
}

impl KeyAgreement for EcdhKeyAgreement {
    fn group(&self) -> NamedGroup {
        match self {
            EcdhKeyAgreement::P256 { .. } => NamedGroup::Secp256r1,
            EcdhKeyAgreement::P384 { .. } => NamedGroup::Secp384r1,
            EcdhKeyAgreement::X25519 { .. } => NamedGroup::X25519,
        }
    }

    fn public_key(&self) -> &[u8] {
        match self {
            EcdhKeyAgreement::P256 { public_key, .. } => public_key,
            EcdhKeyAgreement::P384 { public_key, .. } => public_key,
            EcdhKeyAgreement::X25519 { public_key, .. } => public_key,
        }
    }

    fn agree(self: Box<Self>, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        match *self {
            EcdhKeyAgreement::P256 { secret, .. } => {
                let peer = P256PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| Error::IllegalParameter("Invalid P-256 public key".into()))?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            EcdhKeyAgreement::P384 { secret, .. } => {
                let peer = P384PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| Error::IllegalParameter("Invalid P-384 public key".into()))?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            EcdhKeyAgreement::X25519 { secret, .. } => {
                let bytes: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| Error::IllegalParameter("Invalid X25519 public key".into()))?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(bytes));
                if !shared.was_contributory() {
                    return Err(Error::IllegalParameter(
                        "X25519 shared secret is all zero".into(),
                    ));
                }
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
        }
    }
}
