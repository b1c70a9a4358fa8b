//! Reply builders for the KDC exchanges.
//!
//! Pure assembly of wire structures. All policy (lifetimes, flags, key
//! selection) is decided by the exchange handlers before these run.

use picky_asn1::date::GeneralizedTime;
use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag10, ExplicitContextTag11,
    ExplicitContextTag12, ExplicitContextTag2, ExplicitContextTag3, ExplicitContextTag4, ExplicitContextTag5,
    ExplicitContextTag6, ExplicitContextTag7, ExplicitContextTag8, ExplicitContextTag9, IntegerAsn1,
    OctetStringAsn1, Optional,
};
use picky_krb::constants::key_usages::TICKET_REP;
use picky_krb::constants::types::{KRB_ERROR_MSG_TYPE, PA_ENC_TIMESTAMP, PA_ETYPE_INFO2_TYPE};
use picky_krb::data_types::{
    AuthorizationData, EncTicketPart, EncTicketPartInner, EncryptedData, EtypeInfo2Entry, KerberosStringAsn1, KerberosTime, LastReq,
    LastReqInner, Microseconds, PaData, Realm, Ticket, TicketInner, TransitedEncoding,
};
use picky_krb::messages::{EncKdcRepPart, KdcRep, KrbError, KrbErrorInner};
use time::OffsetDateTime;

use super::realm::PrincipalRecord;
use crate::crypto::Key;
use crate::errors::KrbErrorCode;
use crate::flags::encode_flags;
use crate::principal::PrincipalName;
use crate::{Result, KERBEROS_VERSION};

pub(crate) const MAX_MICROSECONDS: u32 = 999_999;

pub(super) fn kerberos_now() -> (OffsetDateTime, u32) {
    let now = OffsetDateTime::now_utc();
    let microseconds = now.microsecond().min(MAX_MICROSECONDS);

    (now, microseconds)
}

pub(super) fn wire_time(date: OffsetDateTime) -> KerberosTime {
    KerberosTime::from(GeneralizedTime::from(date))
}

/// Encrypts `payload` under `key` and wraps it in the wire EncryptedData
/// envelope carrying the key's encryption type.
pub(super) fn encrypt_payload(key: &Key, key_usage: i32, payload: &[u8]) -> Result<EncryptedData> {
    Ok(EncryptedData {
        etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(key.key_type())])),
        kvno: Optional::from(None),
        cipher: ExplicitContextTag2::from(OctetStringAsn1::from(key.encrypt(key_usage, payload)?)),
    })
}

/// ETYPE-INFO2 advertising every long-term key of the record with its salt,
/// in the record's key order.
pub(super) fn generate_etype_info2(record: &PrincipalRecord) -> Result<PaData> {
    let entries = record
        .keys
        .iter()
        .map(|key| {
            Ok(EtypeInfo2Entry {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(key.key_type())])),
                salt: Optional::from(Some(ExplicitContextTag1::from(KerberosStringAsn1::from(
                    IA5String::from_string(record.salt.clone())?,
                )))),
                s2kparams: Optional::from(None),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ETYPE_INFO2_TYPE.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(picky_asn1_der::to_vec(
            &Asn1SequenceOf::from(entries),
        )?)),
    })
}

/// The empty PA-ENC-TIMESTAMP entry a pre-authentication challenge carries to
/// name the mechanism the client should answer with.
pub(super) fn empty_enc_timestamp_entry() -> PaData {
    PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ENC_TIMESTAMP.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(Vec::new())),
    }
}

/// Encodes METHOD-DATA for the e-data field of a KRB-ERROR.
pub(super) fn method_data(pa_datas: Vec<PaData>) -> Result<Vec<u8>> {
    Ok(picky_asn1_der::to_vec(&Asn1SequenceOf::from(pa_datas))?)
}

pub(super) fn generate_krb_error(
    code: KrbErrorCode,
    realm: &str,
    sname: &PrincipalName,
    e_text: Option<&str>,
    e_data: Option<Vec<u8>>,
) -> Result<KrbError> {
    let (now, microseconds) = kerberos_now();

    let e_text = match e_text {
        Some(text) => Some(ExplicitContextTag11::from(KerberosStringAsn1::from(
            IA5String::from_string(text.to_owned())?,
        ))),
        None => None,
    };

    Ok(KrbError::from(KrbErrorInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![KRB_ERROR_MSG_TYPE])),
        ctime: Optional::from(None),
        cusec: Optional::from(None),
        stime: ExplicitContextTag4::from(wire_time(now)),
        susec: ExplicitContextTag5::from(Microseconds::from(microseconds.to_be_bytes().to_vec())),
        error_code: ExplicitContextTag6::from(code as u32),
        crealm: Optional::from(None),
        cname: Optional::from(None),
        realm: ExplicitContextTag9::from(Realm::from(IA5String::from_string(realm.to_owned())?)),
        sname: ExplicitContextTag10::from(sname.to_asn1()?),
        e_text: Optional::from(e_text),
        e_data: Optional::from(e_data.map(|data| ExplicitContextTag12::from(OctetStringAsn1::from(data)))),
    }))
}

/// Everything the issuance step decided about one ticket.
pub(super) struct TicketIssue<'a> {
    pub flags: u32,
    pub session_key: &'a Key,
    pub client: &'a PrincipalName,
    pub service: &'a PrincipalName,
    pub auth_time: OffsetDateTime,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub renew_till: Option<OffsetDateTime>,
    pub authorization_data: Option<AuthorizationData>,
}

/// Builds the ticket and seals its encrypted part under the service key.
pub(super) fn generate_ticket(issue: &TicketIssue<'_>, service_key: &Key) -> Result<Ticket> {
    let enc_part = EncTicketPart::from(EncTicketPartInner {
        flags: ExplicitContextTag0::from(encode_flags(issue.flags)),
        key: ExplicitContextTag1::from(issue.session_key.to_asn1()),
        crealm: ExplicitContextTag2::from(issue.client.realm_to_asn1()?),
        cname: ExplicitContextTag3::from(issue.client.to_asn1()?),
        transited: ExplicitContextTag4::from(TransitedEncoding {
            tr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![1])),
            contents: ExplicitContextTag1::from(OctetStringAsn1::from(Vec::new())),
        }),
        auth_time: ExplicitContextTag5::from(wire_time(issue.auth_time)),
        starttime: Optional::from(Some(ExplicitContextTag6::from(wire_time(issue.start_time)))),
        endtime: ExplicitContextTag7::from(wire_time(issue.end_time)),
        renew_till: Optional::from(
            issue
                .renew_till
                .map(|renew_till| ExplicitContextTag8::from(wire_time(renew_till))),
        ),
        caddr: Optional::from(None),
        authorization_data: Optional::from(
            issue
                .authorization_data
                .clone()
                .map(ExplicitContextTag10::from),
        ),
    });

    let enc_data = encrypt_payload(service_key, TICKET_REP, &picky_asn1_der::to_vec(&enc_part)?)?;

    Ok(Ticket::from(TicketInner {
        tkt_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        realm: ExplicitContextTag1::from(issue.service.realm_to_asn1()?),
        sname: ExplicitContextTag2::from(issue.service.to_asn1()?),
        enc_part: ExplicitContextTag3::from(enc_data),
    }))
}

/// The reply's encrypted part, mirroring the issued ticket so the client
/// learns the session key and the effective times without opening the ticket.
pub(super) fn generate_reply_enc_part(issue: &TicketIssue<'_>, nonce: &IntegerAsn1) -> Result<EncKdcRepPart> {
    Ok(EncKdcRepPart {
        key: ExplicitContextTag0::from(issue.session_key.to_asn1()),
        last_req: ExplicitContextTag1::from(LastReq::from(vec![LastReqInner {
            lr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![0])),
            lr_value: ExplicitContextTag1::from(wire_time(issue.auth_time)),
        }])),
        nonce: ExplicitContextTag2::from(nonce.clone()),
        key_expiration: Optional::from(None),
        flags: ExplicitContextTag4::from(encode_flags(issue.flags)),
        auth_time: ExplicitContextTag5::from(wire_time(issue.auth_time)),
        start_time: Optional::from(Some(ExplicitContextTag6::from(wire_time(issue.start_time)))),
        end_time: ExplicitContextTag7::from(wire_time(issue.end_time)),
        renew_till: Optional::from(
            issue
                .renew_till
                .map(|renew_till| ExplicitContextTag8::from(wire_time(renew_till))),
        ),
        srealm: ExplicitContextTag9::from(issue.service.realm_to_asn1()?),
        sname: ExplicitContextTag10::from(issue.service.to_asn1()?),
        caadr: Optional::from(None),
        encrypted_pa_data: Optional::from(None),
    })
}

pub(super) fn generate_kdc_rep(
    msg_type: u8,
    client: &PrincipalName,
    pa_datas: Option<Vec<PaData>>,
    ticket: Ticket,
    enc_part: EncryptedData,
) -> Result<KdcRep> {
    Ok(KdcRep {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![msg_type])),
        padata: Optional::from(pa_datas.map(|pa_datas| ExplicitContextTag2::from(Asn1SequenceOf::from(pa_datas)))),
        crealm: ExplicitContextTag3::from(client.realm_to_asn1()?),
        cname: ExplicitContextTag4::from(client.to_asn1()?),
        ticket: ExplicitContextTag5::from(ticket),
        enc_part: ExplicitContextTag6::from(enc_part),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionType;
    use crate::flags::TicketFlags;
    use picky_krb::constants::key_usages::TICKET_REP;

    fn issue_fixture<'a>(
        session_key: &'a Key,
        client: &'a PrincipalName,
        service: &'a PrincipalName,
    ) -> TicketIssue<'a> {
        let auth_time = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();

        TicketIssue {
            flags: (TicketFlags::INITIAL | TicketFlags::PRE_AUTHENT).bits(),
            session_key,
            client,
            service,
            auth_time,
            start_time: auth_time,
            end_time: auth_time + time::Duration::hours(10),
            renew_till: None,
            authorization_data: None,
        }
    }

    #[test]
    fn issued_ticket_decrypts_under_the_service_key() {
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let client = PrincipalName::client("alice", "EXAMPLE.COM").unwrap();
        let service = PrincipalName::tgs("EXAMPLE.COM").unwrap();

        let ticket = generate_ticket(&issue_fixture(&session_key, &client, &service), &service_key).unwrap();

        let raw = service_key
            .decrypt(TICKET_REP, &ticket.0.enc_part.0.cipher.0 .0)
            .unwrap();
        let enc_part: EncTicketPart = picky_asn1_der::from_bytes(&raw).unwrap();

        assert_eq!(Key::from_asn1(&enc_part.0.key.0).unwrap(), session_key);
        assert_eq!(
            PrincipalName::from_asn1(&enc_part.0.cname.0, &enc_part.0.crealm.0).unwrap(),
            client
        );
        assert_eq!(
            crate::flags::decode_flags(&enc_part.0.flags.0),
            (TicketFlags::INITIAL | TicketFlags::PRE_AUTHENT).bits()
        );
    }

    #[test]
    fn reply_enc_part_echoes_the_nonce() {
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let client = PrincipalName::client("alice", "EXAMPLE.COM").unwrap();
        let service = PrincipalName::tgs("EXAMPLE.COM").unwrap();
        let nonce = IntegerAsn1::from(vec![0x01, 0x02, 0x03, 0x04]);

        let enc_part = generate_reply_enc_part(&issue_fixture(&session_key, &client, &service), &nonce).unwrap();

        assert_eq!(enc_part.nonce.0, nonce);
        assert_eq!(Key::from_asn1(&enc_part.key.0).unwrap(), session_key);
    }

    #[test]
    fn krb_error_carries_code_and_method_data() {
        let sname = PrincipalName::tgs("EXAMPLE.COM").unwrap();
        let e_data = method_data(vec![empty_enc_timestamp_entry()]).unwrap();

        let error = generate_krb_error(
            KrbErrorCode::KdcErrPreauthRequired,
            "EXAMPLE.COM",
            &sname,
            None,
            Some(e_data.clone()),
        )
        .unwrap();

        assert_eq!(error.0.error_code.0, KrbErrorCode::KdcErrPreauthRequired as u32);
        assert_eq!(error.0.e_data.0.as_ref().unwrap().0 .0, e_data);
    }

    #[test]
    fn etype_info2_lists_every_key_with_salt() {
        let record = PrincipalRecord {
            principal: PrincipalName::client("alice", "EXAMPLE.COM").unwrap(),
            keys: vec![
                Key::random(EncryptionType::Aes256CtsHmacSha196),
                Key::random(EncryptionType::Aes128CtsHmacSha196),
            ],
            salt: "EXAMPLE.COMalice".to_owned(),
            requires_preauth: true,
            delegation_targets: Vec::new(),
        };

        let pa_data = generate_etype_info2(&record).unwrap();
        let entries: Asn1SequenceOf<EtypeInfo2Entry> =
            picky_asn1_der::from_bytes(&pa_data.padata_data.0 .0).unwrap();

        assert_eq!(entries.0.len(), 2);
        assert_eq!(entries.0[0].etype.0 .0, vec![18]);
        assert_eq!(entries.0[1].etype.0 .0, vec![17]);
        assert_eq!(entries.0[0].salt.0.as_ref().unwrap().0.to_string(), "EXAMPLE.COMalice");
    }
}
