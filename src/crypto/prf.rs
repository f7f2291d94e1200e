//! The TLS pseudo-random function and the key schedule built on it.
//!
//! TLS 1.2 uses P_SHA256 or P_SHA384 (RFC 5246 Section 5). TLS 1.0/1.1 XOR
//! P_MD5 and P_SHA1 over the two halves of the secret (RFC 2246 Section 5).

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha384};
use zeroize::Zeroizing;

use crate::types::{HashAlgorithm, Side};
use crate::Error;

pub const MASTER_SECRET_LEN: usize = 48;
pub const VERIFY_DATA_LEN: usize = 12;

/// PRF(secret, label, seed) written into `out`.
pub fn prf(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &str,
    seed: &[u8],
    out: &mut [u8],
) -> Result<(), Error> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);

    match hash {
        HashAlgorithm::Sha256 => p_hash::<Hmac<Sha256>>(secret, &full_seed, out),
        HashAlgorithm::Sha384 => p_hash::<Hmac<Sha384>>(secret, &full_seed, out),
        HashAlgorithm::Md5Sha1 => {
            let half = secret.len().div_ceil(2);
            let s1 = &secret[..half];
            let s2 = &secret[secret.len() - half..];

            p_hash::<Hmac<Md5>>(s1, &full_seed, out)?;
            let mut sha_out = Zeroizing::new(vec![0u8; out.len()]);
            p_hash::<Hmac<Sha1>>(s2, &full_seed, &mut sha_out)?;
            for (o, s) in out.iter_mut().zip(sha_out.iter()) {
                *o ^= s;
            }
            Ok(())
        }
        HashAlgorithm::Sha1 => Err(Error::InternalError("SHA-1 is not a PRF hash".into())),
    }
}

fn p_hash<M>(secret: &[u8], seed: &[u8], out: &mut [u8]) -> Result<(), Error>
where
    M: Mac + KeyInit + Clone,
{
    let key = <M as KeyInit>::new_from_slice(secret)
        .map_err(|_| Error::CryptoError("Invalid PRF key length".into()))?;

    // A(1) = HMAC_hash(secret, A(0)) where A(0) = seed
    let mut a = {
        let mut mac = key.clone();
        mac.update(seed);
        mac.finalize().into_bytes()
    };

    let mut written = 0;
    while written < out.len() {
        // HMAC_hash(secret, A(i) + seed)
        let mut mac = key.clone();
        mac.update(&a);
        mac.update(seed);
        let block = mac.finalize().into_bytes();

        let n = (out.len() - written).min(block.len());
        out[written..written + n].copy_from_slice(&block[..n]);
        written += n;

        // A(i+1) = HMAC_hash(secret, A(i))
        let mut mac = key.clone();
        mac.update(&a);
        a = mac.finalize().into_bytes();
    }

    Ok(())
}

/// master_secret = PRF(pre_master_secret, "master secret", client_random + server_random)
pub fn master_secret(
    hash: HashAlgorithm,
    pre_master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<Zeroizing<[u8; MASTER_SECRET_LEN]>, Error> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(client_random);
    seed[32..].copy_from_slice(server_random);
    let mut out = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
    prf(hash, pre_master_secret, "master secret", &seed, &mut out[..])?;
    Ok(out)
}

/// Extended master secret (RFC 7627), bound to the session hash.
pub fn extended_master_secret(
    hash: HashAlgorithm,
    pre_master_secret: &[u8],
    session_hash: &[u8],
) -> Result<Zeroizing<[u8; MASTER_SECRET_LEN]>, Error> {
    let mut out = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
    prf(
        hash,
        pre_master_secret,
        "extended master secret",
        session_hash,
        &mut out[..],
    )?;
    Ok(out)
}

/// key_block = PRF(master_secret, "key expansion", server_random + client_random)
pub fn key_block(
    hash: HashAlgorithm,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(server_random);
    seed[32..].copy_from_slice(client_random);
    let mut out = Zeroizing::new(vec![0u8; len]);
    prf(hash, master_secret, "key expansion", &seed, &mut out)?;
    Ok(out)
}

/// The Finished verify_data sent by `side`.
pub fn verify_data(
    hash: HashAlgorithm,
    master_secret: &[u8],
    side: Side,
    transcript_hash: &[u8],
) -> Result<[u8; VERIFY_DATA_LEN], Error> {
    let label = match side {
        Side::Client => "client finished",
        Side::Server => "server finished",
    };
    let mut out = [0u8; VERIFY_DATA_LEN];
    prf(hash, master_secret, label, transcript_hash, &mut out)?;
    Ok(out)
}
