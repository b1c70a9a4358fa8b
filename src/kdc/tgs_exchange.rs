//! TGS exchange: issues follow-on tickets off a TGT. Besides plain service
//! tickets this covers renewal and the MS-SFU delegation variants, S4U2Self
//! (a service obtains a ticket to itself in another user's name) and
//! S4U2Proxy (it trades that evidence for a ticket to a backend it may
//! delegate to).

use std::cmp::min;
use std::sync::Arc;

use md5::{Digest, Md5};
use picky_krb::constants::key_usages::{
    TGS_REP_ENC_SESSION_KEY, TGS_REP_ENC_SUB_KEY, TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR,
};
use picky_krb::constants::types::{PA_PAC_OPTIONS_TYPE, PA_TGS_REQ_TYPE, TGS_REP_MSG_TYPE};
use picky_krb::data_types::{Authenticator, AuthorizationData, EncTicketPart, PaData, Ticket};
use picky_krb::messages::{EncTgsRepPart, KdcReqBody, TgsRep, TgsReq};
use time::OffsetDateTime;

use super::extractors::{
    decrypt_authenticator, decrypt_ticket_enc_part, find_pa_data, first_additional_ticket, kerberos_time,
    pa_for_user, pac_options_flags, request_pa_datas, requested_etypes, server_name, tgs_ap_req, ticket_client,
    ticket_session_key,
};
use super::generators::{
    encrypt_payload, generate_kdc_rep, generate_reply_enc_part, generate_ticket, kerberos_now, TicketIssue,
};
use super::pac::AuthorizationProvider;
use super::realm::{PrincipalRecord, RealmDirectory, RealmLookup, RealmStore};
use super::{ExchangeHandler, ExchangeResult, KdcError};
use crate::crypto::{checksums_match, EncryptionType, Key, RSA_MD5_CHECKSUM_TYPE};
use crate::errors::KrbErrorCode;
use crate::flags::{decode_flags, KdcOptions, TicketFlags};
use crate::principal::PrincipalName;
use crate::s4u::verify_pa_for_user;
use crate::{Error, ErrorKind, PA_FOR_USER_TYPE};

pub(super) struct TgsExchange {
    realms: Arc<RealmStore>,
    authorization: Arc<dyn AuthorizationProvider>,
}

/// The authenticated state carried out of the PA-TGS-REQ AP-REQ.
struct TgtContext {
    enc_ticket: EncTicketPart,
    client: PrincipalName,
    session_key: Key,
    subkey: Option<Key>,
    ticket_service: PrincipalName,
}

/// Everything a branch decided about the ticket to issue.
struct IssueDecision {
    flags: u32,
    client: PrincipalName,
    service: PrincipalName,
    auth_time: OffsetDateTime,
    start_time: OffsetDateTime,
    end_time: OffsetDateTime,
    renew_till: Option<OffsetDateTime>,
    authorization_data: Option<AuthorizationData>,
    session_key: Key,
    service_key: Key,
}

impl TgsExchange {
    pub(super) fn new(realms: Arc<RealmStore>, authorization: Arc<dyn AuthorizationProvider>) -> Self {
        Self { realms, authorization }
    }

    fn issue(&self, tgs_req: &TgsReq) -> ExchangeResult<TgsRep> {
        let realm_name = tgs_req.0.req_body.0.realm.0 .0.to_string();
        let realm = self.realms.realm(&realm_name).ok_or_else(|| {
            debug!(realm = realm_name, "request for a realm not served here");
            KdcError::new(KrbErrorCode::KdcErrWrongRealm)
        })?;

        self.issue_in_realm(&realm, tgs_req)
            .map_err(|failure| failure.attributed_to(realm.name()))
    }

    fn issue_in_realm(&self, realm: &RealmDirectory, tgs_req: &TgsReq) -> ExchangeResult<TgsRep> {
        let req_body = &tgs_req.0.req_body.0;
        let (now, _) = kerberos_now();

        let tgt = self.authenticate(realm, tgs_req, now)?;

        let options = decode_flags(&req_body.kdc_options.0);
        if options & KdcOptions::ENC_TKT_IN_SKEY.bits() != 0 {
            return Err(KdcError::new(KrbErrorCode::KdcErrBadoption).with_text("user-to-user tickets are not served"));
        }

        let service = match server_name(req_body) {
            Ok(Some(service)) => service,
            Ok(None) => {
                return Err(KdcError::new(KrbErrorCode::KdcErrSPrincipalUnknown).with_text("TGS-REQ carries no sname"))
            }
            Err(err) => return Err(err.into()),
        };

        let etypes = requested_etypes(req_body);
        let session_etype = *etypes.first().ok_or_else(|| {
            KdcError::new(KrbErrorCode::KdcErrEtypeNosupp).with_text("no mutually supported encryption type")
        })?;

        let pa_datas = request_pa_datas(&tgs_req.0);
        let decision = if options & KdcOptions::RENEW.bits() != 0 {
            self.renew(realm, &tgt, now, session_etype)?
        } else if let Some(pa_data) = find_pa_data(pa_datas, &PA_FOR_USER_TYPE) {
            self.impersonate(realm, &tgt, service, pa_data, options, now, session_etype)?
        } else if let Some(evidence) = first_additional_ticket(req_body) {
            self.delegate(realm, &tgt, service, evidence, pa_datas, now, session_etype)?
        } else {
            self.service_ticket(realm, &tgt, service, req_body, options, now, session_etype)?
        };

        let IssueDecision {
            flags,
            client,
            service,
            auth_time,
            start_time,
            end_time,
            renew_till,
            authorization_data,
            session_key,
            service_key,
        } = decision;

        let issue = TicketIssue {
            flags,
            session_key: &session_key,
            client: &client,
            service: &service,
            auth_time,
            start_time,
            end_time,
            renew_till,
            authorization_data,
        };

        let ticket = generate_ticket(&issue, &service_key)?;
        let enc_part = generate_reply_enc_part(&issue, &req_body.nonce.0)?;

        let raw_enc_part = picky_asn1_der::to_vec(&EncTgsRepPart::from(enc_part)).map_err(Error::from)?;
        let enc_data = match &tgt.subkey {
            Some(subkey) => encrypt_payload(subkey, TGS_REP_ENC_SUB_KEY, &raw_enc_part)?,
            None => encrypt_payload(&tgt.session_key, TGS_REP_ENC_SESSION_KEY, &raw_enc_part)?,
        };

        debug!(client = %client, service = %service, "issuing ticket");

        Ok(TgsRep::from(generate_kdc_rep(
            TGS_REP_MSG_TYPE,
            &client,
            None,
            ticket,
            enc_data,
        )?))
    }

    /// Opens and checks the TGT and its authenticator from PA-TGS-REQ.
    fn authenticate(&self, realm: &RealmDirectory, tgs_req: &TgsReq, now: OffsetDateTime) -> ExchangeResult<TgtContext> {
        let pa_datas = request_pa_datas(&tgs_req.0);
        let pa_tgs_req = find_pa_data(pa_datas, &PA_TGS_REQ_TYPE).ok_or_else(|| {
            KdcError::new(KrbErrorCode::KdcErrPadataTypeNosupp).with_text("TGS-REQ carries no PA-TGS-REQ")
        })?;
        let ap_req = tgs_ap_req(pa_tgs_req)?;

        let ticket = &ap_req.0.ticket.0;
        let ticket_service = PrincipalName::from_asn1(&ticket.0.sname.0, &ticket.0.realm.0)?;
        let tgs_record = realm.tgs_record();
        if ticket_service != tgs_record.principal {
            return Err(KdcError::new(KrbErrorCode::KrbApErrNotUs).with_text("ticket was not issued by this TGS"));
        }

        let enc_ticket = decrypt_ticket_enc_part(&tgs_record, ticket).map_err(integrity_failure)?;
        let ticket_flags = decode_flags(&enc_ticket.0.flags.0);
        let skew = realm.policy().max_clock_skew;

        if ticket_flags & TicketFlags::INVALID.bits() != 0 {
            return Err(KdcError::new(KrbErrorCode::KrbApErrTktNyv));
        }
        if now > kerberos_time(&enc_ticket.0.endtime.0)? + skew {
            return Err(KdcError::new(KrbErrorCode::KrbApErrTktExpired));
        }
        if let Some(start_time) = enc_ticket.0.starttime.0.as_ref() {
            if kerberos_time(&start_time.0)? > now + skew {
                return Err(KdcError::new(KrbErrorCode::KrbApErrTktNyv));
            }
        }

        let session_key = ticket_session_key(&enc_ticket)?;
        let authenticator =
            decrypt_authenticator(&session_key, TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR, &ap_req).map_err(integrity_failure)?;

        let client = ticket_client(&enc_ticket)?;
        let authenticator_client = PrincipalName::from_asn1(&authenticator.0.cname.0, &authenticator.0.crealm.0)?;
        if authenticator_client != client {
            return Err(KdcError::new(KrbErrorCode::KrbApErrBadmatch));
        }

        if (now - kerberos_time(&authenticator.0.ctime.0)?).abs() > skew {
            return Err(KdcError::new(KrbErrorCode::KrbApErrSkew));
        }

        verify_body_checksum(&authenticator, &tgs_req.0.req_body.0)?;

        let subkey = match authenticator.0.subkey.0.as_ref() {
            Some(subkey) => Some(Key::from_asn1(&subkey.0)?),
            None => None,
        };

        Ok(TgtContext {
            enc_ticket,
            client,
            session_key,
            subkey,
            ticket_service,
        })
    }

    /// RENEW: reissues the presented ticket with fresh times and a fresh
    /// session key, bounded by its renew-till.
    fn renew(
        &self,
        realm: &RealmDirectory,
        tgt: &TgtContext,
        now: OffsetDateTime,
        session_etype: EncryptionType,
    ) -> ExchangeResult<IssueDecision> {
        let flags = decode_flags(&tgt.enc_ticket.0.flags.0);
        let renew_till = match tgt.enc_ticket.0.renew_till.0.as_ref() {
            Some(renew_till) if flags & TicketFlags::RENEWABLE.bits() != 0 => kerberos_time(&renew_till.0)?,
            _ => return Err(KdcError::new(KrbErrorCode::KdcErrBadoption).with_text("ticket is not renewable")),
        };
        if now > renew_till {
            return Err(KdcError::new(KrbErrorCode::KrbApErrTktExpired));
        }

        let service_record = realm
            .lookup(&tgt.ticket_service)
            .ok_or_else(|| KdcError::new(KrbErrorCode::KdcErrSPrincipalUnknown))?;
        let service_key = service_key_of(&service_record)?;

        Ok(IssueDecision {
            flags,
            client: tgt.client.clone(),
            service: tgt.ticket_service.clone(),
            auth_time: kerberos_time(&tgt.enc_ticket.0.auth_time.0)?,
            start_time: now,
            end_time: min(now + realm.policy().ticket_lifetime, renew_till),
            renew_till: Some(renew_till),
            authorization_data: ticket_authorization_data(&tgt.enc_ticket),
            session_key: Key::random(session_etype),
            service_key,
        })
    }

    /// S4U2Self: the requesting service gets a ticket to itself naming the
    /// impersonated user as client.
    #[allow(clippy::too_many_arguments)]
    fn impersonate(
        &self,
        realm: &RealmDirectory,
        tgt: &TgtContext,
        service: PrincipalName,
        pa_data: &PaData,
        options: u32,
        now: OffsetDateTime,
        session_etype: EncryptionType,
    ) -> ExchangeResult<IssueDecision> {
        let for_user = pa_for_user(pa_data)?;
        let impersonated = verify_pa_for_user(&for_user, &tgt.session_key).map_err(|err| match err.error_type {
            ErrorKind::IntegrityCheck => {
                KdcError::new(KrbErrorCode::KrbApErrModified).with_text("PA-FOR-USER checksum mismatch")
            }
            _ => err.into(),
        })?;

        if service != tgt.client {
            return Err(
                KdcError::new(KrbErrorCode::KdcErrBadoption).with_text("S4U2Self target must be the requesting service")
            );
        }
        let requester_record = realm
            .lookup(&tgt.client)
            .ok_or_else(|| KdcError::new(KrbErrorCode::KdcErrCPrincipalUnknown))?;
        let impersonated_record = realm.lookup(&impersonated).ok_or_else(|| {
            debug!(impersonated = %impersonated, "impersonated principal is unknown");
            KdcError::new(KrbErrorCode::KdcErrCPrincipalUnknown)
        })?;

        debug!(requester = %tgt.client, impersonated = %impersonated, "S4U2Self");

        // forwardable only for services that are allowed to push the identity
        // further, otherwise the ticket is usable for local authorization only
        let mut flags = TicketFlags::PRE_AUTHENT;
        if options & KdcOptions::FORWARDABLE.bits() != 0 && !requester_record.delegation_targets.is_empty() {
            flags |= TicketFlags::FORWARDABLE;
        }

        let end_time = min(
            now + realm.policy().ticket_lifetime,
            kerberos_time(&tgt.enc_ticket.0.endtime.0)?,
        );

        let service_key = service_key_of(&requester_record)?;
        let authorization_data = self.authorization.authorization_data(&impersonated_record, &service)?;

        Ok(IssueDecision {
            flags: flags.bits(),
            client: impersonated_record.principal.clone(),
            service,
            auth_time: kerberos_time(&tgt.enc_ticket.0.auth_time.0)?,
            start_time: now,
            end_time,
            renew_till: None,
            authorization_data,
            session_key: Key::random(session_etype),
            service_key,
        })
    }

    /// S4U2Proxy: the requesting service trades an evidence ticket for a
    /// ticket to a backend service, still in the delegated user's name.
    #[allow(clippy::too_many_arguments)]
    fn delegate(
        &self,
        realm: &RealmDirectory,
        tgt: &TgtContext,
        service: PrincipalName,
        evidence: Ticket,
        pa_datas: &[PaData],
        now: OffsetDateTime,
        session_etype: EncryptionType,
    ) -> ExchangeResult<IssueDecision> {
        let requester_record = realm
            .lookup(&tgt.client)
            .ok_or_else(|| KdcError::new(KrbErrorCode::KdcErrCPrincipalUnknown))?;

        // the evidence must be a ticket issued to the requester itself
        let evidence_enc = decrypt_ticket_enc_part(&requester_record, &evidence).map_err(|err| match err.error_type {
            ErrorKind::IntegrityCheck => KdcError::new(KrbErrorCode::KrbApErrModified)
                .with_text("evidence ticket does not open under the requesting service key"),
            _ => err.into(),
        })?;

        let evidence_flags = decode_flags(&evidence_enc.0.flags.0);
        if evidence_flags & TicketFlags::FORWARDABLE.bits() == 0 {
            return Err(KdcError::new(KrbErrorCode::KdcErrBadoption).with_text("evidence ticket is not forwardable"));
        }
        let evidence_end = kerberos_time(&evidence_enc.0.endtime.0)?;
        if now > evidence_end + realm.policy().max_clock_skew {
            return Err(KdcError::new(KrbErrorCode::KrbApErrTktExpired));
        }

        if !requester_record.can_delegate_to(&service) {
            debug!(requester = %tgt.client, target = %service, "delegation refused by policy");
            return Err(KdcError::new(KrbErrorCode::KdcErrPolicy));
        }

        if let Some(pa_data) = find_pa_data(pa_datas, &PA_PAC_OPTIONS_TYPE) {
            debug!(pac_options = pac_options_flags(pa_data)?, "PA-PAC-OPTIONS");
        }

        let target_record = realm.lookup(&service).ok_or_else(|| {
            debug!(service = %service, "unknown delegation target");
            KdcError::new(KrbErrorCode::KdcErrSPrincipalUnknown)
        })?;
        let service_key = service_key_of(&target_record)?;

        let delegated = ticket_client(&evidence_enc)?;
        debug!(requester = %tgt.client, delegated = %delegated, target = %service, "S4U2Proxy");

        Ok(IssueDecision {
            flags: (TicketFlags::FORWARDABLE | TicketFlags::FORWARDED | TicketFlags::PRE_AUTHENT).bits(),
            client: delegated,
            service,
            auth_time: kerberos_time(&evidence_enc.0.auth_time.0)?,
            start_time: now,
            end_time: min(now + realm.policy().ticket_lifetime, evidence_end),
            renew_till: None,
            authorization_data: ticket_authorization_data(&evidence_enc),
            session_key: Key::random(session_etype),
            service_key,
        })
    }

    /// The plain case: a service ticket in the TGT client's name.
    #[allow(clippy::too_many_arguments)]
    fn service_ticket(
        &self,
        realm: &RealmDirectory,
        tgt: &TgtContext,
        service: PrincipalName,
        req_body: &KdcReqBody,
        options: u32,
        now: OffsetDateTime,
        session_etype: EncryptionType,
    ) -> ExchangeResult<IssueDecision> {
        let policy = realm.policy();
        let service_record = realm.lookup(&service).ok_or_else(|| {
            debug!(service = %service, "unknown service principal");
            KdcError::new(KrbErrorCode::KdcErrSPrincipalUnknown)
        })?;
        let service_key = service_key_of(&service_record)?;

        let tgt_flags = decode_flags(&tgt.enc_ticket.0.flags.0);

        let till = kerberos_time(&req_body.till.0)?;
        if till <= now {
            return Err(KdcError::new(KrbErrorCode::KdcErrNeverValid));
        }
        let end_time = min(
            till,
            min(now + policy.ticket_lifetime, kerberos_time(&tgt.enc_ticket.0.endtime.0)?),
        );

        let mut flags = TicketFlags::empty();
        if tgt_flags & TicketFlags::PRE_AUTHENT.bits() != 0 {
            flags |= TicketFlags::PRE_AUTHENT;
        }
        if options & KdcOptions::FORWARDABLE.bits() != 0 && tgt_flags & TicketFlags::FORWARDABLE.bits() != 0 {
            flags |= TicketFlags::FORWARDABLE;
        }
        if options & KdcOptions::FORWARDED.bits() != 0 {
            if tgt_flags & TicketFlags::FORWARDABLE.bits() == 0 {
                return Err(KdcError::new(KrbErrorCode::KdcErrBadoption).with_text("TGT is not forwardable"));
            }
            flags |= TicketFlags::FORWARDED;
        }
        if options & KdcOptions::PROXIABLE.bits() != 0 && tgt_flags & TicketFlags::PROXIABLE.bits() != 0 {
            flags |= TicketFlags::PROXIABLE;
        }

        let renewable_limit = now + policy.renewable_lifetime;
        let renew_till = if options & KdcOptions::RENEWABLE.bits() != 0
            && tgt_flags & TicketFlags::RENEWABLE.bits() != 0
        {
            flags |= TicketFlags::RENEWABLE;
            let requested = match req_body.rtime.0.as_ref() {
                Some(rtime) => kerberos_time(&rtime.0)?,
                None => renewable_limit,
            };
            Some(min(requested, renewable_limit))
        } else {
            None
        };

        Ok(IssueDecision {
            flags: flags.bits(),
            client: tgt.client.clone(),
            service,
            auth_time: kerberos_time(&tgt.enc_ticket.0.auth_time.0)?,
            start_time: now,
            end_time,
            renew_till,
            authorization_data: ticket_authorization_data(&tgt.enc_ticket),
            session_key: Key::random(session_etype),
            service_key,
        })
    }
}

impl ExchangeHandler for TgsExchange {
    fn handle(&self, raw: &[u8]) -> ExchangeResult<Vec<u8>> {
        let tgs_req: TgsReq = picky_asn1_der::from_bytes(raw).map_err(|err| {
            debug!(?err, "TGS-REQ does not parse");
            KdcError::new(KrbErrorCode::KrbErrGeneric).with_text("malformed TGS-REQ")
        })?;

        let reply = self.issue(&tgs_req)?;
        picky_asn1_der::to_vec(&reply).map_err(|err| Error::from(err).into())
    }
}

fn integrity_failure(err: Error) -> KdcError {
    match err.error_type {
        ErrorKind::IntegrityCheck => KdcError::new(KrbErrorCode::KrbApErrBadIntegrity),
        ErrorKind::UnsupportedEncryptionType => KdcError::new(KrbErrorCode::KdcErrEtypeNosupp),
        _ => err.into(),
    }
}

fn service_key_of(record: &PrincipalRecord) -> ExchangeResult<Key> {
    record
        .keys
        .first()
        .cloned()
        .ok_or_else(|| KdcError::new(KrbErrorCode::KdcErrEtypeNosupp).with_text("no usable service key"))
}

fn ticket_authorization_data(enc_ticket: &EncTicketPart) -> Option<AuthorizationData> {
    enc_ticket.0.authorization_data.0.as_ref().map(|data| data.0.clone())
}

/// An rsa-md5 checksum over the request body binds the authenticator to this
/// request; other checksum types pass through unchecked.
fn verify_body_checksum(authenticator: &Authenticator, req_body: &KdcReqBody) -> ExchangeResult<()> {
    let cksum = match authenticator.0.cksum.0.as_ref() {
        Some(cksum) => cksum,
        None => return Ok(()),
    };
    if cksum.0.cksumtype.0 .0 != RSA_MD5_CHECKSUM_TYPE {
        return Ok(());
    }

    let digest = Md5::digest(picky_asn1_der::to_vec(req_body).map_err(Error::from)?);
    if !checksums_match(&digest, &cksum.0.checksum.0 .0) {
        return Err(KdcError::new(KrbErrorCode::KrbApErrModified).with_text("request body checksum mismatch"));
    }

    Ok(())
}
