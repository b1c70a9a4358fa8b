//! Pluggable pre-authentication.
//!
//! The AS exchange asks every registered mechanism whether the request proves
//! the client's identity. A mechanism that matches a padata entry either
//! accepts (optionally replacing the reply key, as PKINIT does) or fails the
//! request; when nothing matches and the principal requires pre-auth, the
//! collected challenge entries go back in a KRB-ERROR.

use picky_krb::constants::types::PA_ENC_TIMESTAMP;
use picky_krb::data_types::PaData;
use picky_krb::messages::KdcReqBody;
use time::OffsetDateTime;

use super::extractors::{decrypt_timestamp, find_pa_data};
use super::generators::{empty_enc_timestamp_entry, generate_etype_info2};
use super::realm::{PrincipalRecord, RealmPolicy};
use crate::crypto::Key;
use crate::{Error, ErrorKind, Result};

/// What a request looks like to a mechanism.
pub struct PreAuthContext<'a> {
    pub record: &'a PrincipalRecord,
    pub policy: &'a RealmPolicy,
    pub req_body: &'a KdcReqBody,
}

/// A successful identity proof.
pub struct PreAuthProof {
    /// Sets the pre-authent flag on the issued ticket.
    pub proven: bool,
    /// Replaces the long-term reply key when the mechanism negotiated one.
    pub reply_key: Option<Key>,
    /// Entries echoed to the client in the reply padata.
    pub reply_pa_datas: Vec<PaData>,
}

impl PreAuthProof {
    /// Identity not proven; used for principals exempt from pre-auth.
    pub fn unproven() -> Self {
        Self {
            proven: false,
            reply_key: None,
            reply_pa_datas: Vec::new(),
        }
    }

    pub fn proven() -> Self {
        Self {
            proven: true,
            reply_key: None,
            reply_pa_datas: Vec::new(),
        }
    }
}

pub(super) enum PreAuthOutcome {
    Continue(PreAuthProof),
    ChallengeRequired(Vec<PaData>),
}

/// One pre-authentication mechanism.
pub trait PreAuthMechanism: Send + Sync + 'static {
    /// The padata-type this mechanism answers to.
    fn pa_type(&self) -> &'static [u8];

    /// Challenge entries announcing this mechanism to a client that sent no
    /// proof. `None` keeps the mechanism out of the challenge.
    fn challenge(&self, record: &PrincipalRecord) -> Result<Option<Vec<PaData>>>;

    /// Validates the client's proof.
    fn verify(&self, context: &PreAuthContext<'_>, pa_data: &PaData) -> Result<PreAuthProof>;
}

/// Mechanisms in match order. The first one whose padata-type appears in the
/// request decides.
pub struct PreAuthRegistry {
    mechanisms: Vec<Box<dyn PreAuthMechanism>>,
}

impl Default for PreAuthRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(EncryptedTimestamp);
        registry
    }
}

impl PreAuthRegistry {
    pub fn empty() -> Self {
        Self { mechanisms: Vec::new() }
    }

    pub fn register(&mut self, mechanism: impl PreAuthMechanism) {
        self.mechanisms.push(Box::new(mechanism));
    }

    pub(super) fn evaluate(&self, context: &PreAuthContext<'_>, pa_datas: &[PaData]) -> Result<PreAuthOutcome> {
        for mechanism in &self.mechanisms {
            if let Some(pa_data) = find_pa_data(pa_datas, mechanism.pa_type()) {
                let proof = mechanism.verify(context, pa_data)?;
                return Ok(PreAuthOutcome::Continue(proof));
            }
        }

        if !context.record.requires_preauth {
            return Ok(PreAuthOutcome::Continue(PreAuthProof::unproven()));
        }

        let mut entries = vec![generate_etype_info2(context.record)?];
        for mechanism in &self.mechanisms {
            if let Some(mut challenge) = mechanism.challenge(context.record)? {
                entries.append(&mut challenge);
            }
        }

        Ok(PreAuthOutcome::ChallengeRequired(entries))
    }
}

/// PA-ENC-TIMESTAMP (RFC 4120 7.5.2): the client proves knowledge of its
/// long-term key by encrypting the current time with it.
pub struct EncryptedTimestamp;

impl PreAuthMechanism for EncryptedTimestamp {
    fn pa_type(&self) -> &'static [u8] {
        &PA_ENC_TIMESTAMP
    }

    fn challenge(&self, _record: &PrincipalRecord) -> Result<Option<Vec<PaData>>> {
        Ok(Some(vec![empty_enc_timestamp_entry()]))
    }

    fn verify(&self, context: &PreAuthContext<'_>, pa_data: &PaData) -> Result<PreAuthProof> {
        let (patimestamp, _pausec) = decrypt_timestamp(pa_data, context.record)?;

        let now = OffsetDateTime::now_utc();
        if (now - patimestamp).abs() > context.policy.max_clock_skew {
            return Err(Error::new(
                ErrorKind::TimeSkew,
                format!("timestamp proof outside the permitted clock skew: {}", patimestamp),
            ));
        }

        Ok(PreAuthProof::proven())
    }
}
