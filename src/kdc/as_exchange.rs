//! AS exchange: authenticates a client against its realm and issues the
//! initial ticket, normally a TGT.

use std::cmp::min;
use std::sync::Arc;

use picky_krb::constants::key_usages::AS_REP_ENC;
use picky_krb::constants::types::{AS_REP_MSG_TYPE, PA_PAC_REQUEST_TYPE};
use picky_krb::data_types::KerbPaPacRequest;
use picky_krb::messages::{AsRep, AsReq};

use super::extractors::{client_name, find_pa_data, kerberos_time, request_pa_datas, requested_etypes, server_name};
use super::generators::{
    encrypt_payload, generate_kdc_rep, generate_reply_enc_part, generate_ticket, kerberos_now, method_data,
    TicketIssue,
};
use super::pac::AuthorizationProvider;
use super::preauth::{PreAuthContext, PreAuthOutcome, PreAuthRegistry};
use super::realm::{RealmDirectory, RealmLookup, RealmStore};
use super::{ExchangeHandler, ExchangeResult, KdcError};
use crate::crypto::Key;
use crate::errors::KrbErrorCode;
use crate::flags::{decode_flags, KdcOptions, TicketFlags};
use crate::{Error, ErrorKind};

pub(super) struct AsExchange {
    realms: Arc<RealmStore>,
    preauth: Arc<PreAuthRegistry>,
    authorization: Arc<dyn AuthorizationProvider>,
}

impl AsExchange {
    pub(super) fn new(
        realms: Arc<RealmStore>,
        preauth: Arc<PreAuthRegistry>,
        authorization: Arc<dyn AuthorizationProvider>,
    ) -> Self {
        Self {
            realms,
            preauth,
            authorization,
        }
    }

    fn issue(&self, as_req: &AsReq) -> ExchangeResult<AsRep> {
        let req_body = &as_req.0.req_body.0;

        let realm_name = req_body.realm.0 .0.to_string();
        let realm = self.realms.realm(&realm_name).ok_or_else(|| {
            debug!(realm = realm_name, "request for a realm not served here");
            KdcError::new(KrbErrorCode::KdcErrWrongRealm)
        })?;

        self.issue_in_realm(&realm, as_req)
            .map_err(|failure| failure.attributed_to(realm.name()))
    }

    fn issue_in_realm(&self, realm: &RealmDirectory, as_req: &AsReq) -> ExchangeResult<AsRep> {
        let req_body = &as_req.0.req_body.0;
        let policy = realm.policy();

        let client = match client_name(req_body) {
            Ok(Some(client)) => client,
            Ok(None) => {
                return Err(KdcError::new(KrbErrorCode::KdcErrCPrincipalUnknown).with_text("AS-REQ carries no cname"))
            }
            Err(err) => return Err(err.into()),
        };
        let record = realm.lookup(&client).ok_or_else(|| {
            debug!(client = %client, "unknown client principal");
            KdcError::new(KrbErrorCode::KdcErrCPrincipalUnknown)
        })?;

        let service = match server_name(req_body) {
            Ok(Some(service)) => service,
            Ok(None) => {
                return Err(KdcError::new(KrbErrorCode::KdcErrSPrincipalUnknown).with_text("AS-REQ carries no sname"))
            }
            Err(err) => return Err(err.into()),
        };
        let service_record = realm.lookup(&service).ok_or_else(|| {
            debug!(service = %service, "unknown service principal");
            KdcError::new(KrbErrorCode::KdcErrSPrincipalUnknown)
        })?;

        let etypes = requested_etypes(req_body);
        let session_etype = *etypes.first().ok_or_else(|| {
            KdcError::new(KrbErrorCode::KdcErrEtypeNosupp).with_text("no mutually supported encryption type")
        })?;
        let client_key = record
            .pick_key(&etypes)
            .ok_or_else(|| KdcError::new(KrbErrorCode::KdcErrEtypeNosupp).with_text("no usable client key"))?;
        let service_key = service_record
            .keys
            .first()
            .ok_or_else(|| KdcError::new(KrbErrorCode::KdcErrEtypeNosupp).with_text("no usable service key"))?;

        let pa_datas = request_pa_datas(&as_req.0);
        let context = PreAuthContext {
            record: &record,
            policy,
            req_body,
        };
        let proof = match self.preauth.evaluate(&context, pa_datas) {
            Ok(PreAuthOutcome::Continue(proof)) => proof,
            Ok(PreAuthOutcome::ChallengeRequired(entries)) => {
                debug!(client = %client, "pre-authentication required");
                return Err(KdcError::new(KrbErrorCode::KdcErrPreauthRequired).with_data(method_data(entries)?));
            }
            Err(err) => return Err(preauth_failure(err)),
        };

        let options = decode_flags(&req_body.kdc_options.0);
        if options & KdcOptions::POSTDATED.bits() != 0 {
            return Err(KdcError::new(KrbErrorCode::KdcErrCannotPostdate));
        }
        if options & (KdcOptions::RENEW | KdcOptions::VALIDATE | KdcOptions::ENC_TKT_IN_SKEY).bits() != 0 {
            return Err(KdcError::new(KrbErrorCode::KdcErrBadoption).with_text("option is only valid against a TGS"));
        }

        let (auth_time, _) = kerberos_now();
        let start_time = auth_time;
        let till = kerberos_time(&req_body.till.0)?;
        if till <= start_time {
            return Err(KdcError::new(KrbErrorCode::KdcErrNeverValid));
        }
        let end_time = min(till, start_time + policy.ticket_lifetime);

        let mut flags = TicketFlags::INITIAL;
        if proof.proven {
            flags |= TicketFlags::PRE_AUTHENT;
        }
        if options & KdcOptions::FORWARDABLE.bits() != 0 {
            flags |= TicketFlags::FORWARDABLE;
        }
        if options & KdcOptions::PROXIABLE.bits() != 0 {
            flags |= TicketFlags::PROXIABLE;
        }

        let renewable_limit = start_time + policy.renewable_lifetime;
        let renew_till = if options & KdcOptions::RENEWABLE.bits() != 0 {
            flags |= TicketFlags::RENEWABLE;
            let requested = match req_body.rtime.0.as_ref() {
                Some(rtime) => kerberos_time(&rtime.0)?,
                None => renewable_limit,
            };
            Some(min(requested, renewable_limit))
        } else if options & KdcOptions::RENEWABLE_OK.bits() != 0 && till > end_time {
            // the requested endtime is out of reach, so a renewable ticket
            // bounded by it is the next best thing
            flags |= TicketFlags::RENEWABLE;
            Some(min(till, renewable_limit))
        } else {
            None
        };

        let include_pac = match find_pa_data(pa_datas, &PA_PAC_REQUEST_TYPE) {
            Some(pa_data) => picky_asn1_der::from_bytes::<KerbPaPacRequest>(&pa_data.padata_data.0 .0)
                .map(|request| request.include_pac.0)
                .unwrap_or(true),
            None => true,
        };
        let authorization_data = if include_pac {
            self.authorization.authorization_data(&record, &service)?
        } else {
            None
        };

        let session_key = Key::random(session_etype);
        let issue = TicketIssue {
            flags: flags.bits(),
            session_key: &session_key,
            client: &record.principal,
            service: &service,
            auth_time,
            start_time,
            end_time,
            renew_till,
            authorization_data,
        };

        let ticket = generate_ticket(&issue, service_key)?;
        let enc_part = generate_reply_enc_part(&issue, &req_body.nonce.0)?;

        let reply_key = proof.reply_key.as_ref().unwrap_or(client_key);
        let enc_as_rep = picky_krb::messages::EncAsRepPart::from(enc_part);
        let enc_data = encrypt_payload(
            reply_key,
            AS_REP_ENC,
            &picky_asn1_der::to_vec(&enc_as_rep).map_err(Error::from)?,
        )?;

        let reply_pa_datas = if proof.reply_pa_datas.is_empty() {
            None
        } else {
            Some(proof.reply_pa_datas)
        };

        debug!(client = %record.principal, service = %service, "issuing initial ticket");

        Ok(AsRep::from(generate_kdc_rep(
            AS_REP_MSG_TYPE,
            &record.principal,
            reply_pa_datas,
            ticket,
            enc_data,
        )?))
    }
}

impl ExchangeHandler for AsExchange {
    fn handle(&self, raw: &[u8]) -> ExchangeResult<Vec<u8>> {
        let as_req: AsReq = picky_asn1_der::from_bytes(raw).map_err(|err| {
            debug!(?err, "AS-REQ does not parse");
            KdcError::new(KrbErrorCode::KrbErrGeneric).with_text("malformed AS-REQ")
        })?;

        let reply = self.issue(&as_req)?;
        picky_asn1_der::to_vec(&reply).map_err(|err| Error::from(err).into())
    }
}

/// Maps a mechanism failure onto the wire code the client acts on.
fn preauth_failure(err: Error) -> KdcError {
    let code = match err.error_type {
        ErrorKind::TimeSkew => KrbErrorCode::KrbApErrSkew,
        ErrorKind::IntegrityCheck | ErrorKind::MalformedMessage => KrbErrorCode::KdcErrPreauthFailed,
        ErrorKind::UnsupportedEncryptionType => KrbErrorCode::KdcErrEtypeNosupp,
        ErrorKind::KdcError(code) => code,
        _ => return err.into(),
    };
    debug!(?err, "pre-authentication failed");
    KdcError::new(code)
}
