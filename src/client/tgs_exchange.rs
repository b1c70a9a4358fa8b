//! Client side of the TGS exchange and its S4U variants.
//!
//! Every request is the same skeleton: a KDC-REQ-BODY naming the target, an
//! authenticator whose checksum binds that body, and the TGT wrapped into a
//! PA-TGS-REQ. The variants only change the body options and the extra
//! pre-authentication payloads.

use picky_krb::constants::key_usages::{TGS_REP_ENC_SESSION_KEY, TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR};
use picky_krb::data_types::PaData;
use picky_krb::messages::{KdcReqBody, TgsRep};
use time::OffsetDateTime;

use super::extractors::{cached_ticket, decrypt_tgs_rep, error_from, krb_error, verify_nonce};
use super::generators::{
    generate_ap_req, generate_authenticator, generate_nonce, generate_pa_for_user, generate_pa_pac_options,
    generate_pa_tgs_req, generate_tgs_req, kdc_req_body, BodyParams,
};
use super::KerberosClient;
use crate::cache::CachedTicket;
use crate::flags::{KdcOptions, PacOptions};
use crate::principal::PrincipalName;
use crate::{Error, ErrorKind, Result};

/// A plain service-ticket request against the TGT.
pub(super) async fn request_service_ticket(
    client: &KerberosClient,
    tgt: &CachedTicket,
    service: &PrincipalName,
) -> Result<CachedTicket> {
    let nonce = generate_nonce();
    let req_body = service_req_body(client, service, KdcOptions::FORWARDABLE.bits(), nonce.clone(), None)?;

    exchange(client, tgt, req_body, Vec::new(), &nonce).await
}

/// S4U2Self: a service asks for a ticket to itself in the name of `user`.
/// The acquired ticket is the evidence for a later delegation hop.
pub(super) async fn request_self_ticket(
    client: &KerberosClient,
    tgt: &CachedTicket,
    user: &PrincipalName,
) -> Result<CachedTicket> {
    let nonce = generate_nonce();
    // The service names itself; the impersonated identity rides in PA-FOR-USER.
    let req_body = service_req_body(client, &tgt.client, KdcOptions::FORWARDABLE.bits(), nonce.clone(), None)?;
    let pa_for_user = generate_pa_for_user(user, &tgt.session_key)?;

    exchange(client, tgt, req_body, vec![pa_for_user], &nonce).await
}

/// S4U2Proxy: trade a forwardable evidence ticket for a ticket to `target`,
/// still in the impersonated user's name.
pub(super) async fn request_proxy_ticket(
    client: &KerberosClient,
    tgt: &CachedTicket,
    evidence: &CachedTicket,
    target: &PrincipalName,
) -> Result<CachedTicket> {
    let nonce = generate_nonce();
    let req_body = service_req_body(
        client,
        target,
        KdcOptions::FORWARDABLE.bits(),
        nonce.clone(),
        Some(evidence),
    )?;
    let pac_options = generate_pa_pac_options(PacOptions::RESOURCE_BASED_CONSTRAINED_DELEGATION.bits())?;

    exchange(client, tgt, req_body, vec![pac_options], &nonce).await
}

/// Renews a renewable ticket before its renew-till horizon. The ticket being
/// renewed is itself presented in the PA-TGS-REQ.
pub(super) async fn renew_ticket(client: &KerberosClient, ticket: &CachedTicket) -> Result<CachedTicket> {
    if ticket.renew_till.is_none() {
        return Err(Error::new(ErrorKind::InvalidOperation, "ticket is not renewable"));
    }

    let nonce = generate_nonce();
    let req_body = service_req_body(
        client,
        &ticket.service,
        (KdcOptions::RENEW | KdcOptions::RENEWABLE).bits(),
        nonce.clone(),
        None,
    )?;

    exchange(client, ticket, req_body, Vec::new(), &nonce).await
}

fn service_req_body(
    client: &KerberosClient,
    service: &PrincipalName,
    options: u32,
    nonce: Vec<u8>,
    evidence: Option<&CachedTicket>,
) -> Result<KdcReqBody> {
    kdc_req_body(BodyParams {
        client: None,
        service,
        options,
        etypes: &client.config.encryption_types,
        till: OffsetDateTime::now_utc() + client.config.ticket_lifetime,
        rtime: None,
        nonce,
        additional_ticket: evidence.map(|evidence| evidence.ticket.clone()),
    })
}

async fn exchange(
    client: &KerberosClient,
    tgt: &CachedTicket,
    req_body: KdcReqBody,
    extra_pa_datas: Vec<PaData>,
    nonce: &[u8],
) -> Result<CachedTicket> {
    let authenticator = generate_authenticator(&tgt.client, Some(&req_body), None, None)?;
    let ap_req = generate_ap_req(
        tgt.ticket.clone(),
        &tgt.session_key,
        &authenticator,
        TGS_REQ_PA_DATA_AP_REQ_AUTHENTICATOR,
        0,
    )?;

    let mut pa_datas = vec![generate_pa_tgs_req(&ap_req)?];
    pa_datas.extend(extra_pa_datas);

    let realm = tgt.service.realm().to_owned();
    let tgs_req = generate_tgs_req(req_body, pa_datas);

    let reply = client.exchange(&realm, &picky_asn1_der::to_vec(&tgs_req)?).await?;
    if let Some(error) = krb_error(&reply)? {
        return Err(error_from(&error));
    }

    let rep: TgsRep = picky_asn1_der::from_bytes(&reply)?;
    let enc_part = decrypt_tgs_rep(&rep.0, &tgt.session_key, TGS_REP_ENC_SESSION_KEY)?;
    verify_nonce(&enc_part, nonce)?;

    cached_ticket(&rep.0, &enc_part)
}
