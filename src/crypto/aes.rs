//! AES and triple-DES transforms.
//!
//! Encryption, checksums, and string-to-key are carried out by the
//! `picky-krb` cipher engine. The engine has no pseudo-random function, so
//! the RFC 3962 PRF is built here on top of its key-derivation export.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use picky_krb::crypto::aes::{derive_key, AesSize, AES_BLOCK_SIZE};
use picky_krb::crypto::CipherSuite;
use sha1::{Digest, Sha1};

use super::{Cipher, EncryptionType};
use crate::{Error, ErrorKind, Result};

/// RFC 3962 6: the PRF key-derivation constant.
const PRF_CONSTANT: &[u8] = b"prf";

/// A transform set backed by the `picky-krb` cipher engine.
pub(crate) struct EngineCipher {
    etype: EncryptionType,
    engine: CipherSuite,
}

impl EngineCipher {
    pub(crate) fn aes256() -> Self {
        Self {
            etype: EncryptionType::Aes256CtsHmacSha196,
            engine: CipherSuite::Aes256CtsHmacSha196,
        }
    }

    pub(crate) fn aes128() -> Self {
        Self {
            etype: EncryptionType::Aes128CtsHmacSha196,
            engine: CipherSuite::Aes128CtsHmacSha196,
        }
    }

    pub(crate) fn des3() -> Self {
        Self {
            etype: EncryptionType::Des3CbcSha1Kd,
            engine: CipherSuite::Des3CbcSha1Kd,
        }
    }

    fn aes_size(&self) -> Option<AesSize> {
        match self.etype {
            EncryptionType::Aes256CtsHmacSha196 => Some(AesSize::Aes256),
            EncryptionType::Aes128CtsHmacSha196 => Some(AesSize::Aes128),
            _ => None,
        }
    }
}

impl Cipher for EngineCipher {
    fn encryption_type(&self) -> EncryptionType {
        self.etype
    }

    fn key_size(&self) -> usize {
        self.engine.cipher().key_size()
    }

    fn seed_size(&self) -> usize {
        self.engine.cipher().seed_bit_len() / 8
    }

    fn encrypt(&self, key: &[u8], key_usage: i32, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(self.engine.cipher().encrypt(key, key_usage, payload)?)
    }

    fn decrypt(&self, key: &[u8], key_usage: i32, cipher_data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.engine.cipher().decrypt(key, key_usage, cipher_data)?)
    }

    fn checksum(&self, key: &[u8], key_usage: i32, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(self.engine.cipher().encryption_checksum(key, key_usage, payload)?)
    }

    fn string_to_key(&self, password: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
        Ok(self.engine.cipher().generate_key_from_password(password, salt)?)
    }

    fn random_to_key(&self, seed: Vec<u8>) -> Vec<u8> {
        self.engine.cipher().random_to_key(seed)
    }

    /// RFC 3962 6: `PRF(key, data) = E(DK(key, "prf"), truncate(SHA-1(data)))`,
    /// one cipher block of output.
    fn pseudo_random(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let aes_size = self.aes_size().ok_or_else(|| {
            Error::new(
                ErrorKind::UnsupportedEncryptionType,
                "the pseudo-random function is not defined for des3-cbc-sha1-kd here",
            )
        })?;

        let prf_key = derive_key(key, PRF_CONSTANT, &aes_size)?;

        let digest = Sha1::digest(data);
        let mut block = GenericArray::clone_from_slice(&digest[..AES_BLOCK_SIZE]);

        match aes_size {
            AesSize::Aes256 => Aes256::new_from_slice(&prf_key)
                .map_err(|err| Error::new(ErrorKind::InternalError, format!("invalid PRF key length: {:?}", err)))?
                .encrypt_block(&mut block),
            AesSize::Aes128 => Aes128::new_from_slice(&prf_key)
                .map_err(|err| Error::new(ErrorKind::InternalError, format!("invalid PRF key length: {:?}", err)))?
                .encrypt_block(&mut block),
        }

        Ok(block.to_vec())
    }
}
