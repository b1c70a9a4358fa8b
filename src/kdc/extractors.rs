//! Parsing helpers for incoming KDC requests.
//!
//! These pull typed values out of the picky-krb wire structures and select
//! the long-term key matching what the peer actually used. They report plain
//! errors; mapping onto protocol error codes happens in the exchange
//! handlers.

use picky_asn1::wrapper::IntegerAsn1;
use picky_krb::constants::key_usages::TICKET_REP;
use picky_krb::constants::types::PA_ENC_TIMESTAMP_KEY_USAGE;
use picky_krb::data_types::{
    Authenticator, EncTicketPart, EncryptedData, KerberosTime, PaData, PaEncTsEnc, PaPacOptions, Ticket,
};
use picky_krb::messages::{ApReq, KdcReq, KdcReqBody};
use time::OffsetDateTime;

use super::realm::PrincipalRecord;
use crate::crypto::{EncryptionType, Key};
use crate::flags::decode_flags;
use crate::principal::PrincipalName;
use crate::s4u::PaForUser;
use crate::{Error, ErrorKind, Result};

pub(super) fn find_pa_data<'a>(pa_datas: &'a [PaData], pa_type: &[u8]) -> Option<&'a PaData> {
    pa_datas.iter().find(|pa_data| pa_data.padata_type.0 .0 == pa_type)
}

pub(super) fn request_pa_datas(req: &KdcReq) -> &[PaData] {
    req.padata
        .0
        .as_ref()
        .map(|pa_datas| pa_datas.0 .0.as_slice())
        .unwrap_or(&[])
}

/// Encryption types offered by the client, in its preference order. Unknown
/// identifiers are skipped rather than failing the whole request.
pub(super) fn requested_etypes(req_body: &KdcReqBody) -> Vec<EncryptionType> {
    req_body
        .etype
        .0
         .0
        .iter()
        .filter_map(|etype| EncryptionType::try_from(etype.0.as_slice()).ok())
        .collect()
}

pub(super) fn client_name(req_body: &KdcReqBody) -> Result<Option<PrincipalName>> {
    req_body
        .cname
        .0
        .as_ref()
        .map(|cname| PrincipalName::from_asn1(&cname.0, &req_body.realm.0))
        .transpose()
}

pub(super) fn server_name(req_body: &KdcReqBody) -> Result<Option<PrincipalName>> {
    req_body
        .sname
        .0
        .as_ref()
        .map(|sname| PrincipalName::from_asn1(&sname.0, &req_body.realm.0))
        .transpose()
}

pub(super) fn first_additional_ticket(req_body: &KdcReqBody) -> Option<Ticket> {
    req_body
        .additional_tickets
        .0
        .as_ref()
        .and_then(|tickets| tickets.0 .0.first().cloned())
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

/// Decrypts and decodes the PA-ENC-TIMESTAMP proof with the client key
/// matching the encryption type the client actually used.
pub(super) fn decrypt_timestamp(pa_data: &PaData, record: &PrincipalRecord) -> Result<(OffsetDateTime, Option<u32>)> {
    let enc_data: EncryptedData = picky_asn1_der::from_bytes(&pa_data.padata_data.0 .0)?;

    let etype = EncryptionType::try_from(enc_data.etype.0 .0.as_slice())?;
    let key = record.key_of_type(etype).ok_or_else(|| {
        Error::new(
            ErrorKind::UnsupportedEncryptionType,
            format!("no {:?} key on record for {}", etype, record.principal),
        )
    })?;

    let raw = key.decrypt(PA_ENC_TIMESTAMP_KEY_USAGE, &enc_data.cipher.0 .0)?;
    let timestamp: PaEncTsEnc = picky_asn1_der::from_bytes(&raw)?;

    let patimestamp = kerberos_time(&timestamp.patimestamp.0)?;
    let pausec = timestamp.pausec.0.as_ref().map(|usec| asn1_to_u32(&usec.0));

    Ok((patimestamp, pausec))
}

pub(super) fn tgs_ap_req(pa_data: &PaData) -> Result<ApReq> {
    Ok(picky_asn1_der::from_bytes(&pa_data.padata_data.0 .0)?)
}

/// Decrypts the ticket inside an AP-REQ with whichever service key encrypted
/// it.
pub(super) fn decrypt_ticket_enc_part(record: &PrincipalRecord, ticket: &Ticket) -> Result<EncTicketPart> {
    let enc_part = &ticket.0.enc_part.0;

    let etype = EncryptionType::try_from(enc_part.etype.0 .0.as_slice())?;
    let key = record.key_of_type(etype).ok_or_else(|| {
        Error::new(
            ErrorKind::UnsupportedEncryptionType,
            format!("no {:?} key on record for {}", etype, record.principal),
        )
    })?;

    let raw = key.decrypt(TICKET_REP, &enc_part.cipher.0 .0)?;

    Ok(picky_asn1_der::from_bytes(&raw)?)
}

pub(super) fn decrypt_authenticator(session_key: &Key, key_usage: i32, ap_req: &ApReq) -> Result<Authenticator> {
    let raw = session_key.decrypt(key_usage, &ap_req.0.authenticator.0.cipher.0 .0)?;

    Ok(picky_asn1_der::from_bytes(&raw)?)
}

pub(super) fn ticket_session_key(enc_part: &EncTicketPart) -> Result<Key> {
    Key::from_asn1(&enc_part.0.key.0)
}

pub(super) fn ticket_client(enc_part: &EncTicketPart) -> Result<PrincipalName> {
    PrincipalName::from_asn1(&enc_part.0.cname.0, &enc_part.0.crealm.0)
}

pub(super) fn pac_options_flags(pa_data: &PaData) -> Result<u32> {
    let options: PaPacOptions = picky_asn1_der::from_bytes(&pa_data.padata_data.0 .0)?;

    Ok(decode_flags(&options.flags.0))
}

pub(super) fn pa_for_user(pa_data: &PaData) -> Result<PaForUser> {
    Ok(picky_asn1_der::from_bytes(&pa_data.padata_data.0 .0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_conversion_handles_short_and_wide_integers() {
        assert_eq!(asn1_to_u32(&IntegerAsn1::from(vec![0x05])), 5);
        assert_eq!(asn1_to_u32(&IntegerAsn1::from(vec![0x01, 0x00])), 256);
        assert_eq!(
            asn1_to_u32(&IntegerAsn1::from(vec![0x00, 0xff, 0xff, 0xff, 0xff])),
            u32::MAX
        );
    }
}
