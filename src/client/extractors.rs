//! Parsing helpers for the replies the client receives.
//!
//! KRB-ERROR detection happens on the raw bytes so the exchange drivers can
//! branch before committing to a reply shape; everything after that works on
//! the picky-krb structures.

use num_traits::FromPrimitive;
use picky_asn1::wrapper::{Asn1SequenceOf, IntegerAsn1};
use picky_krb::constants::key_usages::AS_REP_ENC;
use picky_krb::constants::types::PA_ETYPE_INFO2_TYPE;
use picky_krb::data_types::{EtypeInfo2, EtypeInfo2Entry, KerberosTime, PaData};
use picky_krb::messages::{EncAsRepPart, EncKdcRepPart, EncTgsRepPart, KdcRep, KrbError};
use time::OffsetDateTime;

use crate::cache::CachedTicket;
use crate::crypto::{EncryptionType, Key};
use crate::flags::decode_flags;
use crate::principal::PrincipalName;
use crate::{Error, ErrorKind, KrbErrorCode, Result};

/// APPLICATION 30, constructed: the outer tag of every KRB-ERROR.
const KRB_ERROR_TAG: u8 = 0x7e;

/// Parses the reply as a KRB-ERROR when its outer tag says it is one.
pub(super) fn krb_error(raw: &[u8]) -> Result<Option<KrbError>> {
    if raw.first() != Some(&KRB_ERROR_TAG) {
        return Ok(None);
    }

    Ok(Some(picky_asn1_der::from_bytes(raw)?))
}

/// Unknown codes collapse to the generic error rather than failing the parse.
pub(super) fn error_code(krb_error: &KrbError) -> KrbErrorCode {
    KrbErrorCode::from_u32(krb_error.0.error_code.0).unwrap_or(KrbErrorCode::KrbErrGeneric)
}

pub(super) fn error_from(krb_error: &KrbError) -> Error {
    let code = error_code(krb_error);
    let description = krb_error
        .0
        .e_text
        .0
        .as_ref()
        .map(|text| text.0.to_string())
        .unwrap_or_else(|| format!("KDC replied with {:?}", code));

    Error::krb(code, description)
}

/// The ETYPE-INFO2 hints inside a PREAUTH_REQUIRED error, in the KDC's
/// preference order.
pub(super) fn etype_info2(krb_error: &KrbError) -> Result<Vec<EtypeInfo2Entry>> {
    let e_data = krb_error.0.e_data.0.as_ref().ok_or_else(|| {
        Error::new(
            ErrorKind::MalformedMessage,
            "pre-authentication required but the KRB-ERROR carries no e-data",
        )
    })?;

    let pa_datas: Asn1SequenceOf<PaData> = picky_asn1_der::from_bytes(&e_data.0 .0)?;
    let entries = pa_datas
        .0
        .iter()
        .find(|pa_data| pa_data.padata_type.0 .0 == PA_ETYPE_INFO2_TYPE)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::MalformedMessage,
                "pre-authentication required but no ETYPE-INFO2 offered",
            )
        })?;

    let entries: EtypeInfo2 = picky_asn1_der::from_bytes(&entries.padata_data.0 .0)?;

    Ok(entries.0)
}

pub(super) fn reply_pa_data<'a>(rep: &'a KdcRep, pa_type: &[u8]) -> Option<&'a PaData> {
    rep.padata
        .0
        .as_ref()
        .and_then(|pa_datas| pa_datas.0 .0.iter().find(|pa_data| pa_data.padata_type.0 .0 == pa_type))
}

pub(super) fn decrypt_as_rep(rep: &KdcRep, reply_key: &Key) -> Result<EncKdcRepPart> {
    let raw = decrypt_enc_part(rep, reply_key, AS_REP_ENC)?;
    let part: EncAsRepPart = picky_asn1_der::from_bytes(&raw)?;

    Ok(part.0)
}

pub(super) fn decrypt_tgs_rep(rep: &KdcRep, reply_key: &Key, key_usage: i32) -> Result<EncKdcRepPart> {
    let raw = decrypt_enc_part(rep, reply_key, key_usage)?;
    let part: EncTgsRepPart = picky_asn1_der::from_bytes(&raw)?;

    Ok(part.0)
}

fn decrypt_enc_part(rep: &KdcRep, reply_key: &Key, key_usage: i32) -> Result<Vec<u8>> {
    let etype = EncryptionType::try_from(rep.enc_part.0.etype.0 .0.as_slice())?;
    if etype != reply_key.key_type() {
        return Err(Error::new(
            ErrorKind::UnsupportedEncryptionType,
            format!(
                "reply encrypted with {:?} but the reply key is {:?}",
                etype,
                reply_key.key_type()
            ),
        ));
    }

    reply_key.decrypt(key_usage, &rep.enc_part.0.cipher.0 .0)
}

/// The nonce of the reply must echo the request, or the reply was not minted
/// for this exchange.
pub(super) fn verify_nonce(enc_part: &EncKdcRepPart, sent: &[u8]) -> Result<()> {
    if enc_part.nonce.0 .0 != sent {
        return Err(Error::new(
            ErrorKind::IntegrityCheck,
            "reply nonce does not match the request",
        ));
    }

    Ok(())
}

/// Converts a wire INTEGER to a host integer, keeping the low 32 bits.
pub(super) fn asn1_to_u32(value: &IntegerAsn1) -> u32 {
    let bytes = value.as_unsigned_bytes_be();
    let tail = &bytes[bytes.len().saturating_sub(4)..];

    tail.iter().fold(0, |acc, byte| (acc << 8) | u32::from(*byte))
}

pub(super) fn kerberos_time(value: &KerberosTime) -> Result<OffsetDateTime> {
    OffsetDateTime::try_from(value.0.clone())
        .map_err(|err| Error::new(ErrorKind::MalformedMessage, format!("invalid kerberos time: {:?}", err)))
}

/// Assembles the cache entry from the outer reply and its decrypted part.
pub(super) fn cached_ticket(rep: &KdcRep, enc_part: &EncKdcRepPart) -> Result<CachedTicket> {
    let client = PrincipalName::from_asn1(&rep.cname.0, &rep.crealm.0)?;
    let service = PrincipalName::from_asn1(&enc_part.sname.0, &enc_part.srealm.0)?;
    let session_key = Key::from_asn1(&enc_part.key.0)?;

    let start_time = enc_part
        .start_time
        .0
        .as_ref()
        .map(|at| kerberos_time(&at.0))
        .transpose()?;
    let renew_till = enc_part
        .renew_till
        .0
        .as_ref()
        .map(|at| kerberos_time(&at.0))
        .transpose()?;

    Ok(CachedTicket {
        client,
        service,
        ticket: rep.ticket.0.clone(),
        session_key,
        flags: decode_flags(&enc_part.flags.0),
        auth_time: kerberos_time(&enc_part.auth_time.0)?,
        start_time,
        end_time: kerberos_time(&enc_part.end_time.0)?,
        renew_till,
    })
}
