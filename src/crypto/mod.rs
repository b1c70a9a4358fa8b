//! Encryption-type registry.
//!
//! Every cipher family is reachable through the [`Cipher`] capability
//! interface selected by [`EncryptionType`]. Callers never branch on the
//! cipher family: confounder-plus-checksum (RC4) and CTS-with-HMAC (AES) both
//! hide behind `encrypt`/`decrypt`/`checksum` with an explicit key-usage
//! number on every call.

pub mod aes;
pub mod cf2;
pub mod rc4;

use picky_krb::data_types::EncryptionKey;
use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag1, IntegerAsn1, OctetStringAsn1};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::secret::Secret;
use crate::{Error, ErrorKind, Result};

/// RFC 3961/3962/4757 assigned encryption-type numbers.
pub const AES256_CTS_HMAC_SHA1_96: usize = 18;
pub const AES128_CTS_HMAC_SHA1_96: usize = 17;
pub const RC4_HMAC: usize = 23;
pub const DES3_CBC_SHA1_KD: usize = 16;

/// Key usage of the PA-FOR-USER binding checksum (MS-SFU 2.2.1).
pub const PA_FOR_USER_CHECKSUM_USAGE: i32 = 17;

/// rsa-md5 checksum type number, carried over the TGS request body.
pub(crate) const RSA_MD5_CHECKSUM_TYPE: [u8; 1] = [0x07];

/// One symmetric transform set of RFC 3961: encryption, integrity, key
/// derivation, and the pseudo-random function.
///
/// The key-usage number is explicit on every call; no operation has a default
/// usage.
pub trait Cipher: Send + Sync {
    fn encryption_type(&self) -> EncryptionType;
    fn key_size(&self) -> usize;
    /// Length of the `random_to_key` input in bytes.
    fn seed_size(&self) -> usize;

    fn encrypt(&self, key: &[u8], key_usage: i32, payload: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key: &[u8], key_usage: i32, cipher_data: &[u8]) -> Result<Vec<u8>>;

    /// The keyed integrity checksum of this encryption type (the "required
    /// checksum mechanism" of the profile).
    fn checksum(&self, key: &[u8], key_usage: i32, payload: &[u8]) -> Result<Vec<u8>>;

    fn string_to_key(&self, password: &[u8], salt: &[u8]) -> Result<Vec<u8>>;
    fn random_to_key(&self, seed: Vec<u8>) -> Vec<u8>;

    /// RFC 3961 pseudo-random function of this profile, used by the
    /// key-combination helpers in [`crate::crypto::cf2`].
    fn pseudo_random(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;
}

/// Closed set of supported encryption types.
///
/// AES and triple-DES operations are carried out by the `picky-krb` cipher
/// engine; RC4-HMAC is implemented locally because the engine does not ship
/// the legacy stream-cipher profile.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionType {
    #[serde(rename = "aes256-cts-hmac-sha1-96")]
    Aes256CtsHmacSha196,
    #[serde(rename = "aes128-cts-hmac-sha1-96")]
    Aes128CtsHmacSha196,
    #[serde(rename = "rc4-hmac")]
    Rc4Hmac,
    #[serde(rename = "des3-cbc-sha1-kd")]
    Des3CbcSha1Kd,
}

impl EncryptionType {
    /// Instantiates the transform set for this encryption type.
    pub fn cipher(&self) -> Box<dyn Cipher> {
        match self {
            EncryptionType::Aes256CtsHmacSha196 => Box::new(aes::EngineCipher::aes256()),
            EncryptionType::Aes128CtsHmacSha196 => Box::new(aes::EngineCipher::aes128()),
            EncryptionType::Des3CbcSha1Kd => Box::new(aes::EngineCipher::des3()),
            EncryptionType::Rc4Hmac => Box::new(rc4::Rc4HmacMd5::new()),
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            EncryptionType::Aes256CtsHmacSha196 => 32,
            EncryptionType::Aes128CtsHmacSha196 => 16,
            EncryptionType::Rc4Hmac => 16,
            EncryptionType::Des3CbcSha1Kd => 24,
        }
    }

    /// Preference-ordered set offered in requests and accepted by the KDC by
    /// default.
    pub fn default_etypes() -> Vec<EncryptionType> {
        vec![EncryptionType::Aes256CtsHmacSha196, EncryptionType::Aes128CtsHmacSha196]
    }
}

impl TryFrom<usize> for EncryptionType {
    type Error = Error;

    fn try_from(identifier: usize) -> Result<Self> {
        match identifier {
            AES256_CTS_HMAC_SHA1_96 => Ok(EncryptionType::Aes256CtsHmacSha196),
            AES128_CTS_HMAC_SHA1_96 => Ok(EncryptionType::Aes128CtsHmacSha196),
            RC4_HMAC => Ok(EncryptionType::Rc4Hmac),
            DES3_CBC_SHA1_KD => Ok(EncryptionType::Des3CbcSha1Kd),
            identifier => Err(Error::new(
                ErrorKind::UnsupportedEncryptionType,
                format!("unsupported encryption type: {}", identifier),
            )),
        }
    }
}

impl TryFrom<&[u8]> for EncryptionType {
    type Error = Error;

    /// Parses the raw `etype` INTEGER bytes of a wire message.
    fn try_from(identifier: &[u8]) -> Result<Self> {
        match identifier {
            [b] => Self::try_from(usize::from(*b)),
            _ => Err(Error::new(
                ErrorKind::UnsupportedEncryptionType,
                format!("unsupported encryption type: {:?}", identifier),
            )),
        }
    }
}

impl From<EncryptionType> for u8 {
    fn from(etype: EncryptionType) -> Self {
        match etype {
            EncryptionType::Aes256CtsHmacSha196 => AES256_CTS_HMAC_SHA1_96 as u8,
            EncryptionType::Aes128CtsHmacSha196 => AES128_CTS_HMAC_SHA1_96 as u8,
            EncryptionType::Rc4Hmac => RC4_HMAC as u8,
            EncryptionType::Des3CbcSha1Kd => DES3_CBC_SHA1_KD as u8,
        }
    }
}

impl From<EncryptionType> for usize {
    fn from(etype: EncryptionType) -> Self {
        usize::from(u8::from(etype))
    }
}

/// A long-term or session key: encryption-type tag plus raw key bytes, with an
/// optional key-version number.
///
/// Derived once and owned by the credential or ticket that created it; the raw
/// bytes are zeroed on drop.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Key {
    key_type: EncryptionType,
    value: Secret<Vec<u8>>,
    kvno: Option<u32>,
}

impl Key {
    pub fn new(key_type: EncryptionType, value: Vec<u8>) -> Result<Self> {
        if value.len() != key_type.key_size() {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!(
                    "invalid key length: {}. Expected {} for {:?}",
                    value.len(),
                    key_type.key_size(),
                    key_type
                ),
            ));
        }

        Ok(Self {
            key_type,
            value: Secret::new(value),
            kvno: None,
        })
    }

    pub fn with_kvno(mut self, kvno: u32) -> Self {
        self.kvno = Some(kvno);
        self
    }

    /// Derives the key from a password and salt with the string-to-key
    /// function of the encryption type.
    pub fn from_password(key_type: EncryptionType, password: &str, salt: &str) -> Result<Self> {
        let value = key_type.cipher().string_to_key(password.as_bytes(), salt.as_bytes())?;

        Self::new(key_type, value)
    }

    /// A fresh random key, e.g. a session or sub-session key.
    pub fn random(key_type: EncryptionType) -> Self {
        let cipher = key_type.cipher();

        let mut seed = vec![0; cipher.seed_size()];
        OsRng.fill_bytes(&mut seed);

        Self {
            key_type,
            value: Secret::new(cipher.random_to_key(seed)),
            kvno: None,
        }
    }

    pub fn key_type(&self) -> EncryptionType {
        self.key_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_slice()
    }

    pub fn kvno(&self) -> Option<u32> {
        self.kvno
    }

    pub fn cipher(&self) -> Box<dyn Cipher> {
        self.key_type.cipher()
    }

    pub fn encrypt(&self, key_usage: i32, payload: &[u8]) -> Result<Vec<u8>> {
        self.cipher().encrypt(self.as_bytes(), key_usage, payload)
    }

    pub fn decrypt(&self, key_usage: i32, cipher_data: &[u8]) -> Result<Vec<u8>> {
        self.cipher().decrypt(self.as_bytes(), key_usage, cipher_data)
    }

    pub fn checksum(&self, key_usage: i32, payload: &[u8]) -> Result<Vec<u8>> {
        self.cipher().checksum(self.as_bytes(), key_usage, payload)
    }

    pub fn to_asn1(&self) -> EncryptionKey {
        EncryptionKey {
            key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(self.key_type)])),
            key_value: ExplicitContextTag1::from(OctetStringAsn1::from(self.as_bytes().to_vec())),
        }
    }

    pub fn from_asn1(key: &EncryptionKey) -> Result<Self> {
        let key_type = EncryptionType::try_from(key.key_type.0 .0.as_slice())?;

        Self::new(key_type, key.key_value.0 .0.clone())
    }
}

/// Compares two checksums without leaking the position of the first
/// difference through timing.
pub fn checksums_match(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    left.iter().zip(right.iter()).fold(0_u8, |acc, (l, r)| acc | (l ^ r)) == 0
}
