//! Client side of the AS exchange.
//!
//! The first request goes out without a pre-authentication proof. A
//! PREAUTH_REQUIRED error is the expected answer for most principals; its
//! ETYPE-INFO2 hints pick the encryption type and salt for the long-term key,
//! and the exchange is retried with an encrypted timestamp. PKINIT replaces
//! the timestamp with a signed AuthPack and derives the reply key from the
//! Diffie-Hellman agreement instead of the password.

use picky_krb::constants::types::PA_PK_AS_REP;
use picky_krb::data_types::EtypeInfo2Entry;
use picky_krb::messages::AsRep;
use time::OffsetDateTime;

use super::extractors::{cached_ticket, decrypt_as_rep, error_code, error_from, etype_info2, krb_error, reply_pa_data, verify_nonce};
use super::generators::{
    generate_as_req, generate_nonce, generate_pa_enc_timestamp, generate_pa_pac_request, kdc_req_body, BodyParams,
};
use super::{Credentials, KerberosClient};
use crate::cache::CachedTicket;
use crate::crypto::{EncryptionType, Key};
use crate::flags::KdcOptions;
use crate::pkinit::{generate_client_dh_parameters, generate_pa_pk_as_req, process_pa_pk_as_rep, PkCredentials};
use crate::principal::PrincipalName;
use crate::{Error, ErrorKind, KrbErrorCode, Result};

/// Requests an initial ticket for `service` with password credentials,
/// handling the pre-authentication round trip.
pub(super) async fn request_initial_ticket(
    client: &KerberosClient,
    credentials: &Credentials,
    service: &PrincipalName,
) -> Result<CachedTicket> {
    let realm = credentials.client.realm();
    let nonce = generate_nonce();
    let req_body = initial_req_body(client, &credentials.client, service, nonce.clone())?;

    let as_req = generate_as_req(req_body.clone(), vec![generate_pa_pac_request(true)?]);
    let reply = client.exchange(realm, &picky_asn1_der::to_vec(&as_req)?).await?;

    let reply = match krb_error(&reply)? {
        None => reply,
        Some(error) if error_code(&error) == KrbErrorCode::KdcErrPreauthRequired => {
            debug!(client = %credentials.client, "pre-authentication required, retrying with a timestamp proof");

            let reply_key = reply_key_from_hints(client, credentials, &etype_info2(&error)?)?;
            let pa_datas = vec![generate_pa_enc_timestamp(&reply_key)?, generate_pa_pac_request(true)?];
            let as_req = generate_as_req(req_body, pa_datas);

            let reply = client.exchange(realm, &picky_asn1_der::to_vec(&as_req)?).await?;
            if let Some(error) = krb_error(&reply)? {
                return Err(error_from(&error));
            }

            return complete_with_key(reply, &reply_key, &nonce);
        }
        Some(error) => return Err(error_from(&error)),
    };

    // The principal did not require pre-authentication; derive the reply key
    // from the etype the KDC picked and the default salt convention.
    let rep: AsRep = picky_asn1_der::from_bytes(&reply)?;
    let etype = EncryptionType::try_from(rep.0.enc_part.0.etype.0 .0.as_slice())?;
    let salt = credentials.client.salt(client.config.salt_strategy);
    let reply_key = Key::from_password(etype, credentials.password()?, &salt)?;

    complete(rep, &reply_key, &nonce)
}

/// Requests an initial ticket with certificate credentials (PKINIT). A single
/// round trip: the signed AuthPack rides along with the first request.
pub(super) async fn request_initial_ticket_pkinit(
    client: &KerberosClient,
    principal: &PrincipalName,
    pk_credentials: &PkCredentials,
    service: &PrincipalName,
) -> Result<CachedTicket> {
    let realm = principal.realm();
    let nonce = generate_nonce();
    let req_body = initial_req_body(client, principal, service, nonce.clone())?;

    let mut dh = generate_client_dh_parameters();
    let pa_pk_as_req = generate_pa_pk_as_req(pk_credentials, &req_body, &dh)?;
    let as_req = generate_as_req(req_body, vec![pa_pk_as_req, generate_pa_pac_request(true)?]);

    let reply = client.exchange(realm, &picky_asn1_der::to_vec(&as_req)?).await?;
    if let Some(error) = krb_error(&reply)? {
        return Err(error_from(&error));
    }

    let rep: AsRep = picky_asn1_der::from_bytes(&reply)?;
    let pa_pk_as_rep = reply_pa_data(&rep.0, &PA_PK_AS_REP).ok_or_else(|| {
        Error::new(
            ErrorKind::MalformedMessage,
            "AS-REP to a PKINIT request carries no PA-PK-AS-REP",
        )
    })?;

    let etype = EncryptionType::try_from(rep.0.enc_part.0.etype.0 .0.as_slice())?;
    let reply_key = process_pa_pk_as_rep(pa_pk_as_rep, &mut dh, etype)?;

    complete(rep, &reply_key, &nonce)
}

fn initial_req_body(
    client: &KerberosClient,
    principal: &PrincipalName,
    service: &PrincipalName,
    nonce: Vec<u8>,
) -> Result<picky_krb::messages::KdcReqBody> {
    let now = OffsetDateTime::now_utc();

    let mut options = KdcOptions::FORWARDABLE | KdcOptions::RENEWABLE_OK;
    if client.config.renewable_lifetime.is_some() {
        options |= KdcOptions::RENEWABLE;
    }

    kdc_req_body(BodyParams {
        client: Some(principal),
        service,
        options: options.bits(),
        etypes: &client.config.encryption_types,
        till: now + client.config.ticket_lifetime,
        rtime: client.config.renewable_lifetime.map(|lifetime| now + lifetime),
        nonce,
        additional_ticket: None,
    })
}

/// Picks the first ETYPE-INFO2 entry with a mutually supported encryption
/// type and derives the long-term key from it.
fn reply_key_from_hints(
    client: &KerberosClient,
    credentials: &Credentials,
    entries: &[EtypeInfo2Entry],
) -> Result<Key> {
    for entry in entries {
        let Ok(etype) = EncryptionType::try_from(entry.etype.0 .0.as_slice()) else {
            continue;
        };
        if !client.config.encryption_types.contains(&etype) {
            continue;
        }

        let salt = entry
            .salt
            .0
            .as_ref()
            .map(|salt| salt.0.to_string())
            .unwrap_or_else(|| credentials.client.salt(client.config.salt_strategy));

        return Key::from_password(etype, credentials.password()?, &salt);
    }

    Err(Error::new(
        ErrorKind::UnsupportedEncryptionType,
        "no mutually supported encryption type in the ETYPE-INFO2 hints",
    ))
}

fn complete_with_key(reply: Vec<u8>, reply_key: &Key, nonce: &[u8]) -> Result<CachedTicket> {
    let rep: AsRep = picky_asn1_der::from_bytes(&reply)?;

    complete(rep, reply_key, nonce)
}

fn complete(rep: AsRep, reply_key: &Key, nonce: &[u8]) -> Result<CachedTicket> {
    let enc_part = decrypt_as_rep(&rep.0, reply_key)?;
    verify_nonce(&enc_part, nonce)?;

    cached_ticket(&rep.0, &enc_part)
}
