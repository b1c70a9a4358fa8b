//! Key Distribution Center.
//!
//! [`Kdc`] turns raw KDC-REQ bytes into KDC-REP or KRB-ERROR bytes and is
//! transport-agnostic; the listener that feeds it lives in [`server`].
//! Principals and policy come from [`realm`], pre-authentication mechanisms
//! from the [`PreAuthRegistry`], and authorization-data payloads from the
//! [`AuthorizationProvider`] hook. Any failure inside an exchange collapses
//! into a KRB-ERROR reply: protocol failures keep their error code, internal
//! ones are reported as generic so nothing about the directory leaks.

use std::collections::HashMap;
use std::sync::Arc;

pub mod pac;
pub mod realm;
pub mod server;

mod as_exchange;
mod extractors;
pub(crate) mod generators;
mod preauth;
mod tgs_exchange;

pub use pac::{AuthorizationProvider, NoAuthorizationData};
pub use preauth::{EncryptedTimestamp, PreAuthContext, PreAuthMechanism, PreAuthProof, PreAuthRegistry};
pub use realm::{PrincipalRecord, RealmDirectory, RealmLookup, RealmPolicy, RealmStore};
pub use server::KdcServer;

use crate::errors::KrbErrorCode;
use crate::principal::PrincipalName;
use crate::{Error, ErrorKind, Result};
use as_exchange::AsExchange;
use generators::generate_krb_error;
use tgs_exchange::TgsExchange;

const AS_REQ_TAG: u8 = 10;
const TGS_REQ_TAG: u8 = 12;

/// A failed exchange, with whatever context the handler had collected for the
/// KRB-ERROR reply before it gave up.
struct KdcError {
    code: KrbErrorCode,
    e_text: Option<String>,
    e_data: Option<Vec<u8>>,
    realm: Option<String>,
    sname: Option<PrincipalName>,
}

impl KdcError {
    fn new(code: KrbErrorCode) -> Self {
        Self {
            code,
            e_text: None,
            e_data: None,
            realm: None,
            sname: None,
        }
    }

    fn with_text(mut self, text: impl Into<String>) -> Self {
        self.e_text = Some(text.into());
        self
    }

    fn with_data(mut self, data: Vec<u8>) -> Self {
        self.e_data = Some(data);
        self
    }

    /// Fills in the reply attribution when the failure site did not set one.
    fn attributed_to(mut self, realm: &str) -> Self {
        if self.realm.is_none() {
            self.realm = Some(realm.to_owned());
        }
        self
    }
}

impl From<Error> for KdcError {
    fn from(err: Error) -> Self {
        warn!(?err, "internal failure during an exchange");
        Self::new(KrbErrorCode::KrbErrGeneric).with_text("request processing failed")
    }
}

type ExchangeResult<T> = std::result::Result<T, KdcError>;

/// One KDC-REQ message family, keyed by its outer application tag.
trait ExchangeHandler: Send + Sync {
    fn handle(&self, raw: &[u8]) -> ExchangeResult<Vec<u8>>;
}

/// Collaborators of [`Kdc::new`]. [`Kdc::with_realms`] fills in the defaults:
/// encrypted-timestamp pre-auth and no authorization data.
pub struct KdcProperties {
    pub realms: RealmStore,
    pub preauth: PreAuthRegistry,
    pub authorization: Arc<dyn AuthorizationProvider>,
}

/// The request pipeline shared by every transport connection.
pub struct Kdc {
    realms: Arc<RealmStore>,
    handlers: HashMap<u8, Box<dyn ExchangeHandler>>,
}

impl Kdc {
    pub fn new(properties: KdcProperties) -> Self {
        let KdcProperties {
            realms,
            preauth,
            authorization,
        } = properties;

        let realms = Arc::new(realms);
        let preauth = Arc::new(preauth);

        let mut handlers: HashMap<u8, Box<dyn ExchangeHandler>> = HashMap::new();
        handlers.insert(
            AS_REQ_TAG,
            Box::new(AsExchange::new(
                Arc::clone(&realms),
                preauth,
                Arc::clone(&authorization),
            )),
        );
        handlers.insert(TGS_REQ_TAG, Box::new(TgsExchange::new(Arc::clone(&realms), authorization)));

        Self { realms, handlers }
    }

    pub fn with_realms(realms: RealmStore) -> Self {
        Self::new(KdcProperties {
            realms,
            preauth: PreAuthRegistry::default(),
            authorization: Arc::new(NoAuthorizationData),
        })
    }

    /// Produces the reply for one request. `Err` means not even a KRB-ERROR
    /// could be encoded; the caller should drop the exchange.
    pub fn process(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self.dispatch(raw) {
            Ok(reply) => Ok(reply),
            Err(failure) => {
                warn!(code = ?failure.code, "exchange failed, replying with KRB-ERROR");
                self.error_reply(failure)
            }
        }
    }

    fn dispatch(&self, raw: &[u8]) -> ExchangeResult<Vec<u8>> {
        let tag = peek_application_tag(raw)
            .ok_or_else(|| KdcError::new(KrbErrorCode::KrbErrGeneric).with_text("not a kerberos message"))?;

        debug!(tag, len = raw.len(), "dispatching KDC request");

        let handler = self.handlers.get(&tag).ok_or_else(|| {
            debug!(tag, "no handler for application tag");
            KdcError::new(KrbErrorCode::KrbErrGeneric).with_text("unsupported message type")
        })?;

        handler.handle(raw)
    }

    fn error_reply(&self, failure: KdcError) -> Result<Vec<u8>> {
        let realm = failure
            .realm
            .or_else(|| self.realms.primary().map(|primary| primary.name().to_owned()))
            .ok_or_else(|| Error::new(ErrorKind::InvalidConfiguration, "error reply with no realm configured"))?;

        let sname = match failure.sname {
            Some(sname) => sname,
            None => PrincipalName::tgs(&realm)?,
        };

        let krb_error = generate_krb_error(failure.code, &realm, &sname, failure.e_text.as_deref(), failure.e_data)?;

        Ok(picky_asn1_der::to_vec(&krb_error)?)
    }
}

/// Reads the application tag of the outermost DER value, if there is one.
fn peek_application_tag(raw: &[u8]) -> Option<u8> {
    let first = *raw.first()?;
    if first & 0xc0 != 0x40 {
        return None;
    }
    Some(first & 0x1f)
}

#[cfg(test)]
pub(crate) mod testutil {
    use picky_asn1::date::GeneralizedTime;
    use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, IntegerAsn1, OctetStringAsn1, Optional};
    use picky_krb::constants::types::{PA_ENC_TIMESTAMP, PA_ENC_TIMESTAMP_KEY_USAGE};
    use picky_krb::data_types::{EncryptedData, KerberosTime, PaData, PaEncTsEnc};
    use time::OffsetDateTime;

    use super::realm::{RealmDirectory, RealmStore};
    use crate::crypto::Key;

    pub(crate) const REALM_FIXTURE: &str = r#"
        realm = "EXAMPLE.COM"

        [principals."krbtgt/EXAMPLE.COM"]
        password = "krbtgt-master-secret"

        [principals.alice]
        password = "alice-password"

        [principals.bob]
        password = "bob-password"
        requires_preauth = false

        [principals."HTTP/web.example.com"]
        password = "web-service-secret"
        delegation_targets = ["cifs/files.example.com"]

        [principals."cifs/files.example.com"]
        password = "files-service-secret"
    "#;

    pub(crate) fn realm_store() -> RealmStore {
        let mut store = RealmStore::new();
        store.add(RealmDirectory::from_data(REALM_FIXTURE).unwrap());
        store
    }

    pub(crate) fn kdc() -> super::Kdc {
        super::Kdc::with_realms(realm_store())
    }

    /// An encrypted-timestamp proof as a client would send it.
    pub(crate) fn timestamp_proof(key: &Key, at: OffsetDateTime) -> PaData {
        let timestamp = PaEncTsEnc {
            patimestamp: ExplicitContextTag0::from(KerberosTime::from(GeneralizedTime::from(at))),
            pausec: Optional::from(None),
        };
        let encrypted = key
            .encrypt(PA_ENC_TIMESTAMP_KEY_USAGE, &picky_asn1_der::to_vec(&timestamp).unwrap())
            .unwrap();

        PaData {
            padata_type: ExplicitContextTag1::from(IntegerAsn1::from(PA_ENC_TIMESTAMP.to_vec())),
            padata_data: ExplicitContextTag2::from(OctetStringAsn1::from(
                picky_asn1_der::to_vec(&EncryptedData {
                    etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![u8::from(key.key_type())])),
                    kvno: Optional::from(None),
                    cipher: ExplicitContextTag2::from(OctetStringAsn1::from(encrypted)),
                })
                .unwrap(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use picky_krb::messages::KrbError;

    use super::*;

    fn error_code(reply: &[u8]) -> u32 {
        let krb_error: KrbError = picky_asn1_der::from_bytes(reply).unwrap();
        krb_error.0.error_code.0
    }

    #[test]
    fn application_tag_is_peeked_from_the_first_byte() {
        assert_eq!(peek_application_tag(&[0x6a, 0x82, 0x01, 0x00]), Some(10));
        assert_eq!(peek_application_tag(&[0x6c, 0x82, 0x01, 0x00]), Some(12));
        // universal SEQUENCE is not an application tag
        assert_eq!(peek_application_tag(&[0x30, 0x03]), None);
        assert_eq!(peek_application_tag(&[]), None);
    }

    #[test]
    fn non_kerberos_bytes_get_a_generic_error() {
        let kdc = testutil::kdc();
        let reply = kdc.process(&[0x30, 0x03, 0x02, 0x01, 0x05]).unwrap();
        assert_eq!(error_code(&reply), KrbErrorCode::KrbErrGeneric as u32);
    }

    #[test]
    fn unsupported_message_type_gets_a_generic_error() {
        let kdc = testutil::kdc();
        // AP-REQ carries tag 14, which the KDC does not serve
        let reply = kdc.process(&[0x6e, 0x03, 0x02, 0x01, 0x05]).unwrap();
        assert_eq!(error_code(&reply), KrbErrorCode::KrbErrGeneric as u32);
    }

    #[test]
    fn garbled_as_req_still_yields_an_error_reply() {
        let kdc = testutil::kdc();
        let reply = kdc.process(&[0x6a, 0x03, 0x02, 0x01, 0x05]).unwrap();

        let krb_error: KrbError = picky_asn1_der::from_bytes(&reply).unwrap();
        assert_eq!(krb_error.0.realm.0 .0.to_string(), "EXAMPLE.COM");
        assert_eq!(krb_error.0.error_code.0, KrbErrorCode::KrbErrGeneric as u32);
    }
}
