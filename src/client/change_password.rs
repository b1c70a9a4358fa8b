//! RFC 3244 password change.
//!
//! The client first obtains a ticket for `kadmin/changepw` through a regular
//! AS exchange, then speaks the kpasswd protocol: an AP-REQ plus a KRB-PRIV
//! carrying the new password, framed with the 2-byte length and protocol
//! version. Replies echo the framing with an AP-REP and a KRB-PRIV whose
//! user-data starts with the 2-byte result code.

use picky_asn1::wrapper::{
    ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ExplicitContextTag3, ExplicitContextTag4,
    IntegerAsn1, OctetStringAsn1, Optional,
};
use picky_krb::constants::key_usages::{AP_REP_ENC, AP_REQ_AUTHENTICATOR, KRB_PRIV_ENC_PART};
use picky_krb::constants::types::KRB_PRIV as KRB_PRIV_MSG_TYPE;
use picky_krb::data_types::{
    ChangePasswdData, EncKrbPrivPart, EncKrbPrivPartInner, EncryptedData, HostAddress,
};
use picky_krb::messages::{ApMessage, KrbPriv, KrbPrivInner, KrbPrivMessage};
use rand::rngs::OsRng;
use rand::RngCore;
use url::Url;

use super::as_exchange::request_initial_ticket;
use super::extractors::{error_from, krb_error};
use super::generators::{generate_ap_req, generate_authenticator};
use super::{Credentials, KerberosClient};
use crate::cache::CachedTicket;
use crate::crypto::Key;
use crate::errors::ErrorClass;
use crate::principal::PrincipalName;
use crate::transport::discovery::KdcLocator;
use crate::transport::tcp::TcpTransport;
use crate::{Error, ErrorKind, Result, DEFAULT_KDC_PORT, DEFAULT_KPASSWD_PORT, KERBEROS_VERSION};

/// IPv4 address-type number of RFC 4120 7.5.3.
const IPV4_ADDR_TYPE: u8 = 0x02;

/// Bytes of protocol framing before the AP message: message length, protocol
/// version, AP length.
const FRAMING_LEN: usize = 6;

pub(super) async fn change_password(
    client: &KerberosClient,
    credentials: &Credentials,
    new_password: &str,
) -> Result<()> {
    let realm = credentials.client.realm();
    let kpasswd = PrincipalName::kpasswd(realm)?;
    let ticket = request_initial_ticket(client, credentials, &kpasswd).await?;

    let subkey = Key::random(ticket.session_key.key_type());
    let seq_number = OsRng.next_u32() >> 1;
    let request = build_request(&ticket, &subkey, seq_number, new_password)?;

    let endpoints = kpasswd_endpoints(client, realm).await?;
    let transport = TcpTransport::new(client.config.max_pool_connections);

    let mut last_error = Error::new(
        ErrorKind::NoEndpoints,
        format!("no kpasswd endpoint reachable for realm {}", realm),
    );
    for endpoint in &endpoints {
        match transport.exchange(endpoint, &request).await {
            Ok(reply) => {
                parse_reply(&reply, &ticket.session_key, &subkey)?;
                info!(client = %credentials.client, "password changed");
                return Ok(());
            }
            Err(err) if err.class() == ErrorClass::Transport => {
                warn!(%endpoint, ?err, "kpasswd endpoint failed, trying the next one");
                last_error = err;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error)
}

/// The kpasswd endpoints of a realm: the discovered KDCs on the kpasswd
/// port. An explicitly pinned non-default port is kept as-is.
async fn kpasswd_endpoints(client: &KerberosClient, realm: &str) -> Result<Vec<Url>> {
    let locator = KdcLocator::new(&client.config);
    let mut endpoints = locator.locate(realm).await?;

    for endpoint in &mut endpoints {
        if endpoint.port() == Some(DEFAULT_KDC_PORT) {
            let _ = endpoint.set_port(Some(DEFAULT_KPASSWD_PORT));
        }
    }

    Ok(endpoints)
}

fn build_request(ticket: &CachedTicket, subkey: &Key, seq_number: u32, new_password: &str) -> Result<Vec<u8>> {
    let authenticator = generate_authenticator(&ticket.client, None, Some(subkey), Some(seq_number))?;
    let ap_req = generate_ap_req(
        ticket.ticket.clone(),
        &ticket.session_key,
        &authenticator,
        AP_REQ_AUTHENTICATOR,
        0,
    )?;

    // Self-change: no target principal, the authenticated client is implied.
    let change_data = ChangePasswdData {
        new_passwd: ExplicitContextTag0::from(OctetStringAsn1::from(new_password.as_bytes().to_vec())),
        target_name: Optional::from(None),
        target_realm: Optional::from(None),
    };

    let priv_part = EncKrbPrivPart::from(EncKrbPrivPartInner {
        user_data: ExplicitContextTag0::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&change_data)?)),
        timestamp: Optional::from(None),
        usec: Optional::from(None),
        seq_number: Optional::from(Some(ExplicitContextTag3::from(IntegerAsn1::from_bytes_be_unsigned(
            seq_number.to_be_bytes().to_vec(),
        )))),
        s_address: ExplicitContextTag4::from(HostAddress {
            addr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![IPV4_ADDR_TYPE])),
            address: ExplicitContextTag1::from(OctetStringAsn1::from(vec![0, 0, 0, 0])),
        }),
        r_address: Optional::from(None),
    });
    let encrypted = subkey.encrypt(KRB_PRIV_ENC_PART, &picky_asn1_der::to_vec(&priv_part)?)?;

    let krb_priv = KrbPriv::from(KrbPrivInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![KRB_PRIV_MSG_TYPE])),
        enc_part: ExplicitContextTag3::from(EncryptedData {
            etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(subkey.key_type())])),
            kvno: Optional::from(None),
            cipher: ExplicitContextTag2::from(OctetStringAsn1::from(encrypted)),
        }),
    });

    let message = KrbPrivMessage {
        ap_message: ApMessage::ApReq(ap_req),
        krb_priv,
    };

    Ok(picky_asn1_der::to_vec(&message)?)
}

fn parse_reply(raw: &[u8], session_key: &Key, subkey: &Key) -> Result<()> {
    // A refused exchange may come back as a bare KRB-ERROR after the framing.
    if raw.len() > FRAMING_LEN {
        if let Some(error) = krb_error(&raw[FRAMING_LEN..])? {
            return Err(error_from(&error));
        }
    }

    let message = KrbPrivMessage::deserialize(raw)
        .map_err(|err| Error::new(ErrorKind::MalformedMessage, format!("invalid kpasswd reply: {}", err)))?;

    let ApMessage::ApRep(ap_rep) = message.ap_message else {
        return Err(Error::new(
            ErrorKind::MalformedMessage,
            "kpasswd reply does not carry an AP-REP",
        ));
    };

    // Mutual authentication: the AP-REP part must decrypt under the session key.
    session_key.decrypt(AP_REP_ENC, &ap_rep.0.enc_part.0.cipher.0 .0)?;

    let raw_priv = subkey.decrypt(KRB_PRIV_ENC_PART, &message.krb_priv.0.enc_part.0.cipher.0 .0)?;
    let priv_part: EncKrbPrivPart = picky_asn1_der::from_bytes(&raw_priv)?;

    change_result(&priv_part.0.user_data.0 .0)
}

fn change_result(user_data: &[u8]) -> Result<()> {
    if user_data.len() < 2 {
        return Err(Error::new(
            ErrorKind::MalformedMessage,
            "kpasswd result is shorter than the result code",
        ));
    }

    let code = u16::from_be_bytes([user_data[0], user_data[1]]);
    if code == 0 {
        return Ok(());
    }

    let explanation = String::from_utf8_lossy(&user_data[2..]);
    Err(Error::new(
        ErrorKind::InvalidOperation,
        format!("password change refused (result {}): {}", code, explanation.trim()),
    ))
}

#[cfg(test)]
mod tests {
    use picky_asn1::date::GeneralizedTime;
    use picky_krb::data_types::{
        Authenticator, EncApRepPart, EncApRepPartInner, KerberosTime, Ticket, TicketInner,
    };
    use picky_krb::messages::{ApRep, ApRepInner};
    use picky_krb::constants::types::AP_REP_MSG_TYPE;
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::crypto::EncryptionType;

    fn ticket_fixture() -> CachedTicket {
        let client = PrincipalName::client("alice", "EXAMPLE.COM").unwrap();
        let service = PrincipalName::kpasswd("EXAMPLE.COM").unwrap();
        let now = OffsetDateTime::now_utc();

        let ticket = Ticket::from(TicketInner {
            tkt_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            realm: ExplicitContextTag1::from(service.realm_to_asn1().unwrap()),
            sname: ExplicitContextTag2::from(service.to_asn1().unwrap()),
            enc_part: ExplicitContextTag3::from(EncryptedData {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![18])),
                kvno: Optional::from(None),
                cipher: ExplicitContextTag2::from(OctetStringAsn1::from(vec![0_u8; 32])),
            }),
        });

        CachedTicket {
            client,
            service,
            ticket,
            session_key: Key::random(EncryptionType::Aes256CtsHmacSha196),
            flags: 0,
            auth_time: now,
            start_time: None,
            end_time: now + Duration::hours(2),
            renew_till: None,
        }
    }

    fn reply_bytes(session_key: &Key, subkey: &Key, user_data: Vec<u8>) -> Vec<u8> {
        let now = OffsetDateTime::now_utc();
        let ap_part = EncApRepPart::from(EncApRepPartInner {
            ctime: ExplicitContextTag0::from(KerberosTime::from(GeneralizedTime::from(now))),
            cusec: ExplicitContextTag1::from(IntegerAsn1::from(vec![0])),
            subkey: Optional::from(None),
            seq_number: Optional::from(None),
        });
        let ap_rep = ApRep::from(ApRepInner {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REP_MSG_TYPE])),
            enc_part: ExplicitContextTag2::from(EncryptedData {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(session_key.key_type())])),
                kvno: Optional::from(None),
                cipher: ExplicitContextTag2::from(OctetStringAsn1::from(
                    session_key
                        .encrypt(AP_REP_ENC, &picky_asn1_der::to_vec(&ap_part).unwrap())
                        .unwrap(),
                )),
            }),
        });

        let priv_part = EncKrbPrivPart::from(EncKrbPrivPartInner {
            user_data: ExplicitContextTag0::from(OctetStringAsn1::from(user_data)),
            timestamp: Optional::from(None),
            usec: Optional::from(None),
            seq_number: Optional::from(None),
            s_address: ExplicitContextTag4::from(HostAddress {
                addr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![IPV4_ADDR_TYPE])),
                address: ExplicitContextTag1::from(OctetStringAsn1::from(vec![0, 0, 0, 0])),
            }),
            r_address: Optional::from(None),
        });
        let krb_priv = KrbPriv::from(KrbPrivInner {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![KRB_PRIV_MSG_TYPE])),
            enc_part: ExplicitContextTag3::from(EncryptedData {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(subkey.key_type())])),
                kvno: Optional::from(None),
                cipher: ExplicitContextTag2::from(OctetStringAsn1::from(
                    subkey
                        .encrypt(KRB_PRIV_ENC_PART, &picky_asn1_der::to_vec(&priv_part).unwrap())
                        .unwrap(),
                )),
            }),
        });

        picky_asn1_der::to_vec(&KrbPrivMessage {
            ap_message: ApMessage::ApRep(ap_rep),
            krb_priv,
        })
        .unwrap()
    }

    #[test]
    fn request_carries_the_new_password_under_the_subkey() {
        let ticket = ticket_fixture();
        let subkey = Key::random(EncryptionType::Aes256CtsHmacSha196);

        let raw = build_request(&ticket, &subkey, 41, "correct horse battery staple").unwrap();
        let message = KrbPrivMessage::deserialize(raw.as_slice()).unwrap();

        let ApMessage::ApReq(ap_req) = message.ap_message else {
            panic!("request must start with an AP-REQ");
        };

        let raw_auth = ticket
            .session_key
            .decrypt(AP_REQ_AUTHENTICATOR, &ap_req.0.authenticator.0.cipher.0 .0)
            .unwrap();
        let authenticator: Authenticator = picky_asn1_der::from_bytes(&raw_auth).unwrap();
        let carried_subkey = Key::from_asn1(&authenticator.0.subkey.0.as_ref().unwrap().0).unwrap();
        assert_eq!(carried_subkey, subkey);

        let raw_priv = subkey
            .decrypt(KRB_PRIV_ENC_PART, &message.krb_priv.0.enc_part.0.cipher.0 .0)
            .unwrap();
        let priv_part: EncKrbPrivPart = picky_asn1_der::from_bytes(&raw_priv).unwrap();
        let change_data: ChangePasswdData = picky_asn1_der::from_bytes(&priv_part.0.user_data.0 .0).unwrap();

        assert_eq!(change_data.new_passwd.0 .0, b"correct horse battery staple".to_vec());
    }

    #[test]
    fn successful_reply_is_accepted() {
        let ticket = ticket_fixture();
        let subkey = Key::random(EncryptionType::Aes256CtsHmacSha196);

        let reply = reply_bytes(&ticket.session_key, &subkey, vec![0, 0]);
        assert!(parse_reply(&reply, &ticket.session_key, &subkey).is_ok());
    }

    #[test]
    fn refusal_surfaces_the_result_code_and_text() {
        let ticket = ticket_fixture();
        let subkey = Key::random(EncryptionType::Aes256CtsHmacSha196);

        let mut user_data = vec![0, 5];
        user_data.extend_from_slice(b"policy forbids reuse");
        let reply = reply_bytes(&ticket.session_key, &subkey, user_data);

        let err = parse_reply(&reply, &ticket.session_key, &subkey).unwrap_err();
        assert_eq!(err.error_type, ErrorKind::InvalidOperation);
        assert!(err.description.contains("result 5"));
        assert!(err.description.contains("policy forbids reuse"));
    }

    #[test]
    fn reply_under_a_wrong_subkey_is_rejected() {
        let ticket = ticket_fixture();
        let subkey = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let other = Key::random(EncryptionType::Aes256CtsHmacSha196);

        let reply = reply_bytes(&ticket.session_key, &subkey, vec![0, 0]);
        assert!(parse_reply(&reply, &ticket.session_key, &other).is_err());
    }
}
