//! Builders for the messages the client sends.
//!
//! Everything leaves here as a picky-krb structure ready for DER encoding.
//! Protocol decisions (which pre-auth to attach, which options to set) stay
//! with the exchange drivers; these functions only shape bytes.

use md5::{Digest, Md5};
use picky_asn1::bit_string::BitString;
use picky_asn1::date::GeneralizedTime;
use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag11, ExplicitContextTag2,
    ExplicitContextTag3, ExplicitContextTag4, ExplicitContextTag5, ExplicitContextTag6, ExplicitContextTag7,
    ExplicitContextTag8, IntegerAsn1, OctetStringAsn1, Optional,
};
use picky_krb::constants::types::{
    AP_REQ_MSG_TYPE, AS_REQ_MSG_TYPE, PA_ENC_TIMESTAMP, PA_ENC_TIMESTAMP_KEY_USAGE, PA_PAC_OPTIONS_TYPE,
    PA_PAC_REQUEST_TYPE, PA_TGS_REQ_TYPE, TGS_REQ_MSG_TYPE,
};
use picky_krb::data_types::{
    Authenticator, AuthenticatorInner, Checksum, EncryptedData, KerbPaPacRequest, KerberosTime, PaData, PaEncTsEnc,
    PaPacOptions, Ticket,
};
use picky_krb::messages::{ApReq, ApReqInner, AsReq, KdcReq, KdcReqBody, TgsReq};
use rand::rngs::OsRng;
use rand::RngCore;
use time::OffsetDateTime;

use crate::crypto::{EncryptionType, Key, RSA_MD5_CHECKSUM_TYPE};
use crate::flags::encode_flags;
use crate::kdc::generators::MAX_MICROSECONDS;
use crate::principal::PrincipalName;
use crate::s4u::build_pa_for_user;
use crate::{Result, KERBEROS_VERSION, PA_FOR_USER_TYPE};

/// A fresh request nonce. Four bytes, high bit cleared so the DER INTEGER
/// stays positive and minimal.
pub(super) fn generate_nonce() -> Vec<u8> {
    let mut nonce = [0_u8; 4];
    OsRng.fill_bytes(&mut nonce);
    nonce[0] &= 0x7f;

    nonce.to_vec()
}

pub(super) fn wire_time(at: OffsetDateTime) -> KerberosTime {
    KerberosTime::from(GeneralizedTime::from(at))
}

fn u32_asn1(value: u32) -> IntegerAsn1 {
    IntegerAsn1::from_bytes_be_unsigned(value.to_be_bytes().to_vec())
}

/// Everything that varies between KDC-REQ bodies. `client` is set on AS
/// requests and absent on TGS requests, where the AP-REQ names the client.
pub(super) struct BodyParams<'a> {
    pub client: Option<&'a PrincipalName>,
    pub service: &'a PrincipalName,
    pub options: u32,
    pub etypes: &'a [EncryptionType],
    pub till: OffsetDateTime,
    pub rtime: Option<OffsetDateTime>,
    pub nonce: Vec<u8>,
    pub additional_ticket: Option<Ticket>,
}

pub(super) fn kdc_req_body(params: BodyParams<'_>) -> Result<KdcReqBody> {
    let BodyParams {
        client,
        service,
        options,
        etypes,
        till,
        rtime,
        nonce,
        additional_ticket,
    } = params;

    let etypes = etypes
        .iter()
        .map(|etype| IntegerAsn1::from(vec![u8::from(*etype)]))
        .collect::<Vec<_>>();

    Ok(KdcReqBody {
        kdc_options: ExplicitContextTag0::from(encode_flags(options)),
        cname: Optional::from(
            client
                .map(|client| client.to_asn1().map(ExplicitContextTag1::from))
                .transpose()?,
        ),
        realm: ExplicitContextTag2::from(service.realm_to_asn1()?),
        sname: Optional::from(Some(ExplicitContextTag3::from(service.to_asn1()?))),
        from: Optional::from(None),
        till: ExplicitContextTag5::from(wire_time(till)),
        rtime: Optional::from(rtime.map(|rtime| ExplicitContextTag6::from(wire_time(rtime)))),
        nonce: ExplicitContextTag7::from(IntegerAsn1::from(nonce)),
        etype: ExplicitContextTag8::from(Asn1SequenceOf::from(etypes)),
        addresses: Optional::from(None),
        enc_authorization_data: Optional::from(None),
        additional_tickets: Optional::from(
            additional_ticket.map(|ticket| ExplicitContextTag11::from(Asn1SequenceOf::from(vec![ticket]))),
        ),
    })
}

fn kdc_req(msg_type: u8, req_body: KdcReqBody, pa_datas: Vec<PaData>) -> KdcReq {
    KdcReq {
        pvno: ExplicitContextTag1::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag2::from(IntegerAsn1::from(vec![msg_type])),
        padata: Optional::from((!pa_datas.is_empty()).then(|| ExplicitContextTag3::from(Asn1SequenceOf::from(pa_datas)))),
        req_body: ExplicitContextTag4::from(req_body),
    }
}

pub(super) fn generate_as_req(req_body: KdcReqBody, pa_datas: Vec<PaData>) -> AsReq {
    AsReq::from(kdc_req(AS_REQ_MSG_TYPE, req_body, pa_datas))
}

pub(super) fn generate_tgs_req(req_body: KdcReqBody, pa_datas: Vec<PaData>) -> TgsReq {
    TgsReq::from(kdc_req(TGS_REQ_MSG_TYPE, req_body, pa_datas))
}

/// The PA-ENC-TIMESTAMP pre-authentication proof: the current time encrypted
/// under the client's long-term key.
pub(super) fn generate_pa_enc_timestamp(key: &Key) -> Result<PaData> {
    let now = OffsetDateTime::now_utc();
    let microseconds = now.microsecond().min(MAX_MICROSECONDS);

    let timestamp = PaEncTsEnc {
        patimestamp: ExplicitContextTag0::from(wire_time(now)),
        pausec: Optional::from(Some(ExplicitContextTag1::from(u32_asn1(microseconds)))),
    };
    let encrypted = key.encrypt(PA_ENC_TIMESTAMP_KEY_USAGE, &picky_asn1_der::to_vec(&timestamp)?)?;

    let enc_data = EncryptedData {
        etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(key.key_type())])),
        kvno: Optional::from(None),
        cipher: ExplicitContextTag2::from(OctetStringAsn1::from(encrypted)),
    };

    pa_data(&PA_ENC_TIMESTAMP, picky_asn1_der::to_vec(&enc_data)?)
}

pub(super) fn generate_pa_pac_request(include_pac: bool) -> Result<PaData> {
    let request = KerbPaPacRequest {
        include_pac: ExplicitContextTag0::from(include_pac),
    };

    pa_data(&PA_PAC_REQUEST_TYPE, picky_asn1_der::to_vec(&request)?)
}

pub(super) fn generate_pa_pac_options(flags: u32) -> Result<PaData> {
    let options = PaPacOptions {
        flags: ExplicitContextTag0::from(encode_flags(flags)),
    };

    pa_data(&PA_PAC_OPTIONS_TYPE, picky_asn1_der::to_vec(&options)?)
}

/// The MS-SFU PA-FOR-USER identity of the user a service impersonates,
/// checksummed under the TGT session key.
pub(super) fn generate_pa_for_user(user: &PrincipalName, tgt_session_key: &Key) -> Result<PaData> {
    let pa_for_user = build_pa_for_user(user, tgt_session_key)?;

    pa_data(&PA_FOR_USER_TYPE, picky_asn1_der::to_vec(&pa_for_user)?)
}

pub(super) fn generate_pa_tgs_req(ap_req: &ApReq) -> Result<PaData> {
    pa_data(&PA_TGS_REQ_TYPE, picky_asn1_der::to_vec(ap_req)?)
}

fn pa_data(pa_type: &[u8], data: Vec<u8>) -> Result<PaData> {
    Ok(PaData {
        padata_type: ExplicitContextTag1::from(IntegerAsn1::from(pa_type.to_vec())),
        padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(data)),
    })
}

/// The authenticator carried inside an AP-REQ. A request-body checksum binds
/// TGS requests to their body; AP exchanges pass `None` there and may carry a
/// subkey and sequence number instead.
pub(super) fn generate_authenticator(
    client: &PrincipalName,
    checksum_of: Option<&KdcReqBody>,
    subkey: Option<&Key>,
    seq_number: Option<u32>,
) -> Result<Authenticator> {
    let now = OffsetDateTime::now_utc();
    let microseconds = now.microsecond().min(MAX_MICROSECONDS);

    let cksum = checksum_of
        .map(|req_body| {
            let digest = Md5::digest(picky_asn1_der::to_vec(req_body)?);

            Ok::<_, crate::Error>(ExplicitContextTag3::from(Checksum {
                cksumtype: ExplicitContextTag0::from(IntegerAsn1::from(RSA_MD5_CHECKSUM_TYPE.to_vec())),
                checksum: ExplicitContextTag1::from(OctetStringAsn1::from(digest.to_vec())),
            }))
        })
        .transpose()?;

    Ok(Authenticator::from(AuthenticatorInner {
        authenticator_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        crealm: ExplicitContextTag1::from(client.realm_to_asn1()?),
        cname: ExplicitContextTag2::from(client.to_asn1()?),
        cksum: Optional::from(cksum),
        cusec: ExplicitContextTag4::from(u32_asn1(microseconds)),
        ctime: ExplicitContextTag5::from(wire_time(now)),
        subkey: Optional::from(subkey.map(|subkey| ExplicitContextTag6::from(subkey.to_asn1()))),
        seq_number: Optional::from(seq_number.map(|seq| ExplicitContextTag7::from(u32_asn1(seq)))),
        authorization_data: Optional::from(None),
    }))
}

/// Wraps a ticket and an authenticator into an AP-REQ, encrypting the
/// authenticator under the ticket session key at the given usage.
pub(super) fn generate_ap_req(
    ticket: Ticket,
    session_key: &Key,
    authenticator: &Authenticator,
    key_usage: i32,
    ap_options: u32,
) -> Result<ApReq> {
    let encrypted = session_key.encrypt(key_usage, &picky_asn1_der::to_vec(authenticator)?)?;

    Ok(ApReq::from(ApReqInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REQ_MSG_TYPE])),
        ap_options: ExplicitContextTag2::from(picky_krb::data_types::ApOptions::from(BitString::with_bytes(
            ap_options.to_be_bytes().to_vec(),
        ))),
        ticket: ExplicitContextTag3::from(ticket),
        authenticator: ExplicitContextTag4::from(EncryptedData {
            etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(session_key.key_type())])),
            kvno: Optional::from(None),
            cipher: ExplicitContextTag2::from(OctetStringAsn1::from(encrypted)),
        }),
    }))
}
