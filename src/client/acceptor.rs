//! AP-REQ acceptor for services.
//!
//! The receiving side of the AP exchange: a service holding its long-term key
//! opens the ticket, verifies the authenticator against it, and rejects
//! replays within the clock-skew window. Mutual authentication produces the
//! AP-REP echo of the authenticator time.

use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, IntegerAsn1, OctetStringAsn1, Optional};
use picky_krb::constants::key_usages::{AP_REP_ENC, AP_REQ_AUTHENTICATOR, TICKET_REP};
use picky_krb::constants::types::AP_REP_MSG_TYPE;
use picky_krb::data_types::{Authenticator, EncApRepPart, EncApRepPartInner, EncTicketPart, EncryptedData};
use picky_krb::messages::{ApRep, ApRepInner, ApReq};
use time::{Duration, OffsetDateTime};

use super::extractors::{asn1_to_u32, kerberos_time};
use crate::cache::{ReplayCache, ReplayKey};
use crate::crypto::{EncryptionType, Key};
use crate::flags::{decode_flags, ApOptions, TicketFlags};
use crate::principal::PrincipalName;
use crate::{Error, ErrorKind, KrbErrorCode, Result, KERBEROS_VERSION};

/// The authenticated state a service keeps after accepting an AP-REQ.
#[derive(Debug)]
pub struct AcceptedContext {
    pub client: PrincipalName,
    pub session_key: Key,
    /// Sub-session key from the authenticator, when the client sent one.
    pub subkey: Option<Key>,
    pub sequence_number: Option<u32>,
    pub ticket_flags: u32,
}

/// Verifies incoming AP-REQ tokens against one service identity.
///
/// The replay cache is internal; one acceptor instance must see every token
/// addressed to its service principal for replay detection to hold.
pub struct ApAcceptor {
    service: PrincipalName,
    service_key: Key,
    replay: ReplayCache,
    max_clock_skew: Duration,
}

impl ApAcceptor {
    pub fn new(service: PrincipalName, service_key: Key, max_clock_skew: Duration) -> Self {
        Self {
            replay: ReplayCache::new(max_clock_skew),
            service,
            service_key,
            max_clock_skew,
        }
    }

    /// Verifies one AP-REQ. On success returns the authenticated context and,
    /// when the client asked for mutual authentication, the AP-REP to send
    /// back.
    pub fn accept(&self, ap_req: &ApReq) -> Result<(AcceptedContext, Option<ApRep>)> {
        let ticket = &ap_req.0.ticket.0 .0;

        let sname = PrincipalName::from_asn1(&ticket.sname.0, &ticket.realm.0)?;
        if sname != self.service {
            return Err(Error::krb(
                KrbErrorCode::KrbApErrNotUs,
                format!("ticket is for {}, not {}", sname, self.service),
            ));
        }

        let enc_part = self.open_ticket(&ticket.enc_part.0)?;
        let client = PrincipalName::from_asn1(&enc_part.0.cname.0, &enc_part.0.crealm.0)?;
        let session_key = Key::from_asn1(&enc_part.0.key.0)?;
        let ticket_flags = decode_flags(&enc_part.0.flags.0);

        let now = OffsetDateTime::now_utc();
        self.check_validity(ticket_flags, &enc_part, now)?;

        let authenticator = self.open_authenticator(&session_key, ap_req)?;
        let auth_client = PrincipalName::from_asn1(&authenticator.0.cname.0, &authenticator.0.crealm.0)?;
        if auth_client != client {
            return Err(Error::krb(
                KrbErrorCode::KrbApErrBadmatch,
                format!("authenticator names {}, ticket names {}", auth_client, client),
            ));
        }

        let ctime = kerberos_time(&authenticator.0.ctime.0)?;
        if (now - ctime).abs() > self.max_clock_skew {
            return Err(Error::krb(
                KrbErrorCode::KrbApErrSkew,
                "authenticator time is outside the clock-skew window",
            ));
        }

        let cusec = asn1_to_u32(&authenticator.0.cusec.0);
        let seen_before = !self.replay.add(ReplayKey {
            crealm: client.realm().to_owned(),
            cname: client.components().join("/"),
            ctime,
            cusec,
        });
        if seen_before {
            return Err(Error::krb(KrbErrorCode::KrbApErrRepeat, "authenticator replayed"));
        }

        let subkey = authenticator
            .0
            .subkey
            .0
            .as_ref()
            .map(|subkey| Key::from_asn1(&subkey.0))
            .transpose()?;
        let sequence_number = authenticator.0.seq_number.0.as_ref().map(|seq| asn1_to_u32(&seq.0));

        let options = decode_flags(&ap_req.0.ap_options.0);
        let ap_rep = if ApOptions::from_bits_truncate(options).contains(ApOptions::MUTUAL_REQUIRED) {
            Some(self.mutual_reply(&session_key, &authenticator)?)
        } else {
            None
        };

        debug!(client = %client, service = %self.service, "AP-REQ accepted");

        Ok((
            AcceptedContext {
                client,
                session_key,
                subkey,
                sequence_number,
                ticket_flags,
            },
            ap_rep,
        ))
    }

    fn open_ticket(&self, enc_data: &EncryptedData) -> Result<EncTicketPart> {
        let etype = EncryptionType::try_from(enc_data.etype.0 .0.as_slice())?;
        if etype != self.service_key.key_type() {
            return Err(Error::new(
                ErrorKind::UnsupportedEncryptionType,
                format!(
                    "ticket sealed with {:?} but the service key is {:?}",
                    etype,
                    self.service_key.key_type()
                ),
            ));
        }

        let raw = self
            .service_key
            .decrypt(TICKET_REP, &enc_data.cipher.0 .0)
            .map_err(|_| {
                Error::krb(
                    KrbErrorCode::KrbApErrBadIntegrity,
                    "ticket does not decrypt under the service key",
                )
            })?;

        Ok(picky_asn1_der::from_bytes(&raw)?)
    }

    fn check_validity(&self, flags: u32, enc_part: &EncTicketPart, now: OffsetDateTime) -> Result<()> {
        if TicketFlags::from_bits_truncate(flags).contains(TicketFlags::INVALID) {
            return Err(Error::krb(
                KrbErrorCode::KrbApErrTktNyv,
                "ticket carries the INVALID flag",
            ));
        }

        if let Some(starttime) = enc_part.0.starttime.0.as_ref() {
            if kerberos_time(&starttime.0)? > now + self.max_clock_skew {
                return Err(Error::krb(KrbErrorCode::KrbApErrTktNyv, "ticket is not yet valid"));
            }
        }

        if kerberos_time(&enc_part.0.endtime.0)? < now - self.max_clock_skew {
            return Err(Error::krb(KrbErrorCode::KrbApErrTktExpired, "ticket has expired"));
        }

        Ok(())
    }

    fn open_authenticator(&self, session_key: &Key, ap_req: &ApReq) -> Result<Authenticator> {
        let raw = session_key
            .decrypt(AP_REQ_AUTHENTICATOR, &ap_req.0.authenticator.0.cipher.0 .0)
            .map_err(|_| {
                Error::krb(
                    KrbErrorCode::KrbApErrBadIntegrity,
                    "authenticator does not decrypt under the ticket session key",
                )
            })?;

        Ok(picky_asn1_der::from_bytes(&raw)?)
    }

    /// The AP-REP proves knowledge of the session key by echoing the
    /// authenticator timestamp.
    fn mutual_reply(&self, session_key: &Key, authenticator: &Authenticator) -> Result<ApRep> {
        let part = EncApRepPart::from(EncApRepPartInner {
            ctime: ExplicitContextTag0::from(authenticator.0.ctime.0.clone()),
            cusec: ExplicitContextTag1::from(authenticator.0.cusec.0.clone()),
            subkey: Optional::from(None),
            seq_number: Optional::from(None),
        });
        let encrypted = session_key.encrypt(AP_REP_ENC, &picky_asn1_der::to_vec(&part)?)?;

        Ok(ApRep::from(ApRepInner {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REP_MSG_TYPE])),
            enc_part: ExplicitContextTag2::from(EncryptedData {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(session_key.key_type())])),
                kvno: Optional::from(None),
                cipher: ExplicitContextTag2::from(OctetStringAsn1::from(encrypted)),
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use picky_asn1::wrapper::{ExplicitContextTag10, ExplicitContextTag3, ExplicitContextTag4, ExplicitContextTag5, ExplicitContextTag6, ExplicitContextTag7, ExplicitContextTag8};
    use picky_krb::data_types::{EncTicketPartInner, Ticket, TicketInner, TransitedEncoding};
    use picky_krb::messages::ApReq;

    use super::super::generators::{generate_ap_req, generate_authenticator, wire_time};
    use super::*;
    use crate::flags::encode_flags;

    fn service() -> PrincipalName {
        PrincipalName::service("HTTP", "web.example.com", "EXAMPLE.COM").unwrap()
    }

    fn alice() -> PrincipalName {
        PrincipalName::client("alice", "EXAMPLE.COM").unwrap()
    }

    struct TicketSpec {
        flags: u32,
        starttime: Option<OffsetDateTime>,
        endtime: OffsetDateTime,
    }

    impl Default for TicketSpec {
        fn default() -> Self {
            Self {
                flags: TicketFlags::INITIAL.bits(),
                starttime: None,
                endtime: OffsetDateTime::now_utc() + Duration::hours(8),
            }
        }
    }

    fn seal_ticket(spec: &TicketSpec, session_key: &Key, service_key: &Key) -> Ticket {
        let client = alice();
        let service = service();

        let enc_part = EncTicketPart::from(EncTicketPartInner {
            flags: ExplicitContextTag0::from(encode_flags(spec.flags)),
            key: ExplicitContextTag1::from(session_key.to_asn1()),
            crealm: ExplicitContextTag2::from(client.realm_to_asn1().unwrap()),
            cname: ExplicitContextTag3::from(client.to_asn1().unwrap()),
            transited: ExplicitContextTag4::from(TransitedEncoding {
                tr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![1])),
                contents: ExplicitContextTag1::from(OctetStringAsn1::from(Vec::new())),
            }),
            auth_time: ExplicitContextTag5::from(wire_time(OffsetDateTime::now_utc())),
            starttime: Optional::from(spec.starttime.map(|at| ExplicitContextTag6::from(wire_time(at)))),
            endtime: ExplicitContextTag7::from(wire_time(spec.endtime)),
            renew_till: Optional::from(None::<ExplicitContextTag8<picky_krb::data_types::KerberosTime>>),
            caddr: Optional::from(None),
            authorization_data: Optional::from(None::<ExplicitContextTag10<picky_krb::data_types::AuthorizationData>>),
        });
        let encrypted = service_key
            .encrypt(TICKET_REP, &picky_asn1_der::to_vec(&enc_part).unwrap())
            .unwrap();

        Ticket::from(TicketInner {
            tkt_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            realm: ExplicitContextTag1::from(service.realm_to_asn1().unwrap()),
            sname: ExplicitContextTag2::from(service.to_asn1().unwrap()),
            enc_part: ExplicitContextTag3::from(EncryptedData {
                etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(service_key.key_type())])),
                kvno: Optional::from(None),
                cipher: ExplicitContextTag2::from(OctetStringAsn1::from(encrypted)),
            }),
        })
    }

    fn ap_req(spec: &TicketSpec, session_key: &Key, service_key: &Key, options: u32) -> ApReq {
        let ticket = seal_ticket(spec, session_key, service_key);
        let authenticator = generate_authenticator(&alice(), None, None, Some(11)).unwrap();

        generate_ap_req(ticket, session_key, &authenticator, AP_REQ_AUTHENTICATOR, options).unwrap()
    }

    fn acceptor(service_key: &Key) -> ApAcceptor {
        ApAcceptor::new(service(), service_key.clone(), Duration::minutes(5))
    }

    #[test]
    fn valid_ap_req_yields_the_client_identity() {
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let acceptor = acceptor(&service_key);

        let (context, ap_rep) = acceptor
            .accept(&ap_req(&TicketSpec::default(), &session_key, &service_key, 0))
            .unwrap();

        assert_eq!(context.client, alice());
        assert_eq!(context.session_key, session_key);
        assert_eq!(context.sequence_number, Some(11));
        assert!(ap_rep.is_none());
    }

    #[test]
    fn replayed_authenticator_is_rejected() {
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let acceptor = acceptor(&service_key);
        let ap_req = ap_req(&TicketSpec::default(), &session_key, &service_key, 0);

        assert!(acceptor.accept(&ap_req).is_ok());

        let err = acceptor.accept(&ap_req).unwrap_err();
        assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KrbApErrRepeat));
    }

    #[test]
    fn expired_ticket_is_rejected() {
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let spec = TicketSpec {
            endtime: OffsetDateTime::now_utc() - Duration::hours(1),
            ..TicketSpec::default()
        };

        let err = acceptor(&service_key)
            .accept(&ap_req(&spec, &session_key, &service_key, 0))
            .unwrap_err();
        assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KrbApErrTktExpired));
    }

    #[test]
    fn not_yet_valid_ticket_is_rejected() {
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let spec = TicketSpec {
            starttime: Some(OffsetDateTime::now_utc() + Duration::hours(1)),
            ..TicketSpec::default()
        };

        let err = acceptor(&service_key)
            .accept(&ap_req(&spec, &session_key, &service_key, 0))
            .unwrap_err();
        assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KrbApErrTktNyv));
    }

    #[test]
    fn invalid_flag_is_rejected() {
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let spec = TicketSpec {
            flags: TicketFlags::INVALID.bits(),
            ..TicketSpec::default()
        };

        let err = acceptor(&service_key)
            .accept(&ap_req(&spec, &session_key, &service_key, 0))
            .unwrap_err();
        assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KrbApErrTktNyv));
    }

    #[test]
    fn foreign_ticket_is_not_us() {
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let other = ApAcceptor::new(
            PrincipalName::service("cifs", "files.example.com", "EXAMPLE.COM").unwrap(),
            service_key.clone(),
            Duration::minutes(5),
        );

        let err = other
            .accept(&ap_req(&TicketSpec::default(), &session_key, &service_key, 0))
            .unwrap_err();
        assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KrbApErrNotUs));
    }

    #[test]
    fn wrong_service_key_fails_integrity() {
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let wrong_key = Key::random(EncryptionType::Aes256CtsHmacSha196);

        let err = acceptor(&wrong_key)
            .accept(&ap_req(&TicketSpec::default(), &session_key, &service_key, 0))
            .unwrap_err();
        assert_eq!(err.krb_error_code(), Some(KrbErrorCode::KrbApErrBadIntegrity));
    }

    #[test]
    fn mutual_authentication_echoes_the_authenticator_time() {
        let service_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let session_key = Key::random(EncryptionType::Aes256CtsHmacSha196);
        let acceptor = acceptor(&service_key);

        let ap_req = ap_req(
            &TicketSpec::default(),
            &session_key,
            &service_key,
            ApOptions::MUTUAL_REQUIRED.bits(),
        );
        let authenticator: Authenticator = {
            let raw = session_key
                .decrypt(AP_REQ_AUTHENTICATOR, &ap_req.0.authenticator.0.cipher.0 .0)
                .unwrap();
            picky_asn1_der::from_bytes(&raw).unwrap()
        };

        let (_, ap_rep) = acceptor.accept(&ap_req).unwrap();
        let ap_rep = ap_rep.expect("mutual authentication must produce an AP-REP");

        let raw = session_key
            .decrypt(AP_REP_ENC, &ap_rep.0.enc_part.0.cipher.0 .0)
            .unwrap();
        let part: EncApRepPart = picky_asn1_der::from_bytes(&raw).unwrap();

        assert_eq!(part.0.ctime.0, authenticator.0.ctime.0);
        assert_eq!(part.0.cusec.0, authenticator.0.cusec.0);
    }
}
