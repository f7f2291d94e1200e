//! Cryptographic building blocks used by the handshake.
//!
//! The primitives themselves come from RustCrypto. This module wires them
//! into the shapes TLS needs: a running transcript, the PRF based key
//! schedule, ephemeral key agreement, and signing/verification keys.

pub(crate) mod hash;
pub(crate) mod keys;
pub(crate) mod kx;
pub(crate) mod prf;

pub use hash::Transcript;
pub use keys::{PeerKey, PrivateKey};
pub use kx::KeyAgreement;
