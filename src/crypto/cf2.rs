//! Key combination (RFC 6113 5.1).

use super::{Cipher, Key};
use crate::Result;

/// `PRF+(key, pepper)`: outputs of the profile PRF over a one-octet counter
/// concatenated with the pepper, starting from one, truncated to `len`.
fn prf_plus(cipher: &dyn Cipher, key: &[u8], pepper: &[u8], len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 1_u8;

    while out.len() < len {
        let mut input = Vec::with_capacity(1 + pepper.len());
        input.push(counter);
        input.extend_from_slice(pepper);

        out.extend_from_slice(&cipher.pseudo_random(key, &input)?);
        counter += 1;
    }

    out.truncate(len);

    Ok(out)
}

/// KRB-FX-CF2: combines two keys into a fresh key of the first key's
/// encryption type. Neither input is recoverable from the output.
pub fn krb_fx_cf2(key1: &Key, pepper1: &[u8], key2: &Key, pepper2: &[u8]) -> Result<Key> {
    let cipher = key1.cipher();
    let seed_size = cipher.seed_size();

    let octets1 = prf_plus(cipher.as_ref(), key1.as_bytes(), pepper1, seed_size)?;
    let octets2 = prf_plus(key2.cipher().as_ref(), key2.as_bytes(), pepper2, seed_size)?;

    let seed = octets1.iter().zip(octets2.iter()).map(|(a, b)| a ^ b).collect();

    Key::new(key1.key_type(), cipher.random_to_key(seed))
}
