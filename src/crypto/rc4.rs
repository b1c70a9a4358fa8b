//! RC4-HMAC transforms (RFC 4757).
//!
//! The cipher engine behind [`crate::crypto::aes`] does not carry the legacy
//! stream-cipher profile, so the whole of it lives here: the RC4 stream, the
//! confounder-plus-checksum message layout, the NT one-way string-to-key, and
//! the Microsoft keyed signature used by protocol-transition checksums.

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use super::{checksums_match, Cipher, EncryptionType};
use crate::{Error, ErrorKind, Result};

const HMAC_LEN: usize = 16;
const CONFOUNDER_LEN: usize = 8;

/// RFC 4757 4: signature keys are derived with this constant, trailing NUL
/// included.
const SIGNATURE_KEY_CONSTANT: &[u8] = b"signaturekey\0";

/// The bare RC4 stream. Key scheduling runs in `new`; `process` advances the
/// keystream, so an instance must not span two messages.
pub(crate) struct Rc4 {
    i: u8,
    j: u8,
    state: [u8; 256],
}

impl Rc4 {
    pub(crate) fn new(key: &[u8]) -> Self {
        let mut state = [0_u8; 256];
        for (index, entry) in state.iter_mut().enumerate() {
            *entry = index as u8;
        }

        let mut j = 0_u8;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, usize::from(j));
        }

        Self { i: 0, j: 0, state }
    }

    pub(crate) fn process(&mut self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .map(|byte| {
                self.i = self.i.wrapping_add(1);
                self.j = self.j.wrapping_add(self.state[usize::from(self.i)]);
                self.state.swap(usize::from(self.i), usize::from(self.j));

                let index = self.state[usize::from(self.i)].wrapping_add(self.state[usize::from(self.j)]);

                byte ^ self.state[usize::from(index)]
            })
            .collect()
    }
}

pub(crate) fn hmac_md5(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Md5>::new_from_slice(key)
        .map_err(|err| Error::new(ErrorKind::InternalError, format!("invalid HMAC-MD5 key: {:?}", err)))?;
    mac.update(data);

    Ok(mac.finalize().into_bytes().to_vec())
}

/// KERB_CHECKSUM_HMAC_MD5, checksum type -138.
///
/// Defined for a key of any encryption type, which is what makes it usable as
/// the protocol-transition binding checksum even under an AES ticket-granting
/// session key.
pub fn hmac_md5_checksum(key: &[u8], key_usage: i32, payload: &[u8]) -> Result<Vec<u8>> {
    let signature_key = hmac_md5(key, SIGNATURE_KEY_CONSTANT)?;

    let mut to_digest = Vec::with_capacity(4 + payload.len());
    to_digest.extend_from_slice(&key_usage.to_le_bytes());
    to_digest.extend_from_slice(payload);

    hmac_md5(&signature_key, &Md5::digest(&to_digest))
}

/// RC4 collapses several key-usage numbers before derivation (MS-KILE
/// 3.1.5.9).
fn translate_usage(key_usage: i32) -> u32 {
    match key_usage {
        3 | 9 => 8,
        23 => 13,
        other => other as u32,
    }
}

/// The rc4-hmac profile.
pub struct Rc4HmacMd5;

impl Rc4HmacMd5 {
    pub fn new() -> Self {
        Self
    }

    fn usage_key(&self, key: &[u8], key_usage: i32) -> Result<Vec<u8>> {
        hmac_md5(key, &translate_usage(key_usage).to_le_bytes())
    }
}

impl Default for Rc4HmacMd5 {
    fn default() -> Self {
        Self::new()
    }
}

impl Cipher for Rc4HmacMd5 {
    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Rc4Hmac
    }

    fn key_size(&self) -> usize {
        HMAC_LEN
    }

    fn seed_size(&self) -> usize {
        HMAC_LEN
    }

    fn encrypt(&self, key: &[u8], key_usage: i32, payload: &[u8]) -> Result<Vec<u8>> {
        let usage_key = self.usage_key(key, key_usage)?;

        let mut confounded = vec![0_u8; CONFOUNDER_LEN + payload.len()];
        OsRng.fill_bytes(&mut confounded[..CONFOUNDER_LEN]);
        confounded[CONFOUNDER_LEN..].copy_from_slice(payload);

        let checksum = hmac_md5(&usage_key, &confounded)?;
        let stream_key = hmac_md5(&usage_key, &checksum)?;

        let mut cipher_data = checksum;
        cipher_data.extend_from_slice(&Rc4::new(&stream_key).process(&confounded));

        Ok(cipher_data)
    }

    fn decrypt(&self, key: &[u8], key_usage: i32, cipher_data: &[u8]) -> Result<Vec<u8>> {
        if cipher_data.len() < HMAC_LEN + CONFOUNDER_LEN {
            return Err(Error::new(
                ErrorKind::MalformedMessage,
                format!("RC4 ciphertext is too short: {} bytes", cipher_data.len()),
            ));
        }

        let (checksum, encrypted) = cipher_data.split_at(HMAC_LEN);

        let usage_key = self.usage_key(key, key_usage)?;
        let stream_key = hmac_md5(&usage_key, checksum)?;

        let confounded = Rc4::new(&stream_key).process(encrypted);

        if !checksums_match(&hmac_md5(&usage_key, &confounded)?, checksum) {
            return Err(Error::new(
                ErrorKind::IntegrityCheck,
                "RC4 ciphertext failed its integrity check",
            ));
        }

        Ok(confounded[CONFOUNDER_LEN..].to_vec())
    }

    fn checksum(&self, key: &[u8], key_usage: i32, payload: &[u8]) -> Result<Vec<u8>> {
        hmac_md5_checksum(key, key_usage, payload)
    }

    /// The NT one-way function: MD4 over the UTF-16LE password. The salt does
    /// not contribute.
    fn string_to_key(&self, password: &[u8], _salt: &[u8]) -> Result<Vec<u8>> {
        let password = std::str::from_utf8(password)?;

        let mut encoded = Vec::with_capacity(password.len() * 2);
        for unit in password.encode_utf16() {
            encoded.extend_from_slice(&unit.to_le_bytes());
        }

        Ok(Md4::digest(&encoded).to_vec())
    }

    fn random_to_key(&self, seed: Vec<u8>) -> Vec<u8> {
        seed
    }

    fn pseudo_random(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = Hmac::<Sha1>::new_from_slice(key)
            .map_err(|err| Error::new(ErrorKind::InternalError, format!("invalid HMAC-SHA1 key: {:?}", err)))?;
        mac.update(data);

        Ok(mac.finalize().into_bytes().to_vec())
    }
}
