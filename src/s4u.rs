//! Protocol transition and constrained delegation (MS-SFU).
//!
//! S4U2Self lets a service obtain a ticket to itself in the name of another
//! user; S4U2Proxy lets it exchange that evidence ticket for a ticket to a
//! backend service it is allowed to delegate to. This module carries the
//! PA-FOR-USER padata both sides agree on; the exchange logic lives with the
//! client and the KDC respectively.

use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{
    ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ExplicitContextTag3, IntegerAsn1, OctetStringAsn1,
};
use picky_krb::data_types::{Checksum, KerberosStringAsn1, PrincipalName as PrincipalNameAsn1, Realm};
use serde::{Deserialize, Serialize};

use crate::crypto::rc4::hmac_md5_checksum;
use crate::crypto::{checksums_match, Key, PA_FOR_USER_CHECKSUM_USAGE};
use crate::principal::PrincipalName;
use crate::{Error, ErrorKind, Result};

/// The only auth-package value defined for PA-FOR-USER. Compared
/// case-insensitively (MS-SFU 2.2.1).
pub const KERBEROS_AUTH_PACKAGE: &str = "Kerberos";

/// KERB_CHECKSUM_HMAC_MD5 (-138) as a two's-complement DER INTEGER.
pub(crate) const PA_FOR_USER_CHECKSUM_TYPE: [u8; 2] = [0xff, 0x76];

/// [MS-SFU 2.2.1](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-sfu/)
///
/// ```not_rust
/// PA-FOR-USER-ENC ::= SEQUENCE {
///     userName              [0] PrincipalName,
///     userRealm             [1] Realm,
///     cksum                 [2] Checksum,
///     auth-package          [3] KerberosString
/// }
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct PaForUser {
    pub user_name: ExplicitContextTag0<PrincipalNameAsn1>,
    pub user_realm: ExplicitContextTag1<Realm>,
    pub cksum: ExplicitContextTag2<Checksum>,
    pub auth_package: ExplicitContextTag3<KerberosStringAsn1>,
}

/// Builds the PA-FOR-USER padata naming the user to impersonate, bound to the
/// requesting service's TGT session key.
pub fn build_pa_for_user(impersonated: &PrincipalName, session_key: &Key) -> Result<PaForUser> {
    let input = binding_checksum_input(impersonated, KERBEROS_AUTH_PACKAGE);
    let checksum = hmac_md5_checksum(session_key.as_bytes(), PA_FOR_USER_CHECKSUM_USAGE, &input)?;

    Ok(PaForUser {
        user_name: ExplicitContextTag0::from(impersonated.to_asn1()?),
        user_realm: ExplicitContextTag1::from(impersonated.realm_to_asn1()?),
        cksum: ExplicitContextTag2::from(Checksum {
            cksumtype: ExplicitContextTag0::from(IntegerAsn1::from(PA_FOR_USER_CHECKSUM_TYPE.to_vec())),
            checksum: ExplicitContextTag1::from(OctetStringAsn1::from(checksum)),
        }),
        auth_package: ExplicitContextTag3::from(KerberosStringAsn1::from(IA5String::from_string(
            KERBEROS_AUTH_PACKAGE.to_owned(),
        )?)),
    })
}

/// Verifies the binding checksum of a received PA-FOR-USER and returns the
/// named user. The checksum is keyed with the TGT session key no matter which
/// encryption type that key has (MS-SFU 2.2.1).
pub fn verify_pa_for_user(pa_for_user: &PaForUser, session_key: &Key) -> Result<PrincipalName> {
    let impersonated = PrincipalName::from_asn1(&pa_for_user.user_name.0, &pa_for_user.user_realm.0)?;

    let auth_package = pa_for_user.auth_package.0.to_string();
    if !auth_package.eq_ignore_ascii_case(KERBEROS_AUTH_PACKAGE) {
        return Err(Error::new(
            ErrorKind::MalformedMessage,
            format!("unsupported PA-FOR-USER auth-package: {}", auth_package),
        ));
    }

    let input = binding_checksum_input(&impersonated, &auth_package);
    let expected = hmac_md5_checksum(session_key.as_bytes(), PA_FOR_USER_CHECKSUM_USAGE, &input)?;

    if !checksums_match(&expected, &pa_for_user.cksum.0.checksum.0 .0) {
        return Err(Error::new(
            ErrorKind::IntegrityCheck,
            "PA-FOR-USER checksum does not match its content",
        ));
    }

    Ok(impersonated)
}

/// MS-SFU 2.2.1 checksum input: the little-endian name-type followed by every
/// name component, the realm, and the auth-package, all unseparated.
fn binding_checksum_input(user: &PrincipalName, auth_package: &str) -> Vec<u8> {
    let mut input = u32::from(user.name_type()).to_le_bytes().to_vec();
    for component in user.components() {
        input.extend_from_slice(component.as_bytes());
    }
    input.extend_from_slice(user.realm().as_bytes());
    input.extend_from_slice(auth_package.as_bytes());

    input
}
