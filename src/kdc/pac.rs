//! Authorization-data attachment.
//!
//! Tickets can carry opaque authorization payloads (a Windows PAC or an
//! equivalent). The KDC itself does not interpret them; it asks a provider at
//! issuance time and embeds whatever comes back.

use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag1, IntegerAsn1, OctetStringAsn1};
use picky_krb::data_types::{AuthorizationData, AuthorizationDataInner};

use super::realm::PrincipalRecord;
use crate::principal::PrincipalName;
use crate::Result;

/// ad-type of AD-IF-RELEVANT (RFC 4120 5.2.6.1).
pub const AD_IF_RELEVANT_TYPE: [u8; 1] = [0x01];

/// ad-type of a Windows PAC (MS-PAC), carried inside AD-IF-RELEVANT.
pub const AD_WIN2K_PAC_TYPE: [u8; 2] = [0x00, 0x80];

/// Supplies the authorization data embedded in issued tickets.
///
/// Called once per issuance unless the client asked for no PAC. Returning
/// `None` issues the ticket without authorization data.
pub trait AuthorizationProvider: Send + Sync + 'static {
    fn authorization_data(
        &self,
        client: &PrincipalRecord,
        service: &PrincipalName,
    ) -> Result<Option<AuthorizationData>>;
}

/// Default provider: tickets carry no authorization data.
#[derive(Debug, Default)]
pub struct NoAuthorizationData;

impl AuthorizationProvider for NoAuthorizationData {
    fn authorization_data(
        &self,
        _client: &PrincipalRecord,
        _service: &PrincipalName,
    ) -> Result<Option<AuthorizationData>> {
        Ok(None)
    }
}

/// Wraps a raw payload in AD-IF-RELEVANT so acceptors that do not understand
/// it can ignore it (RFC 4120 5.2.6.1).
pub fn wrap_in_ad_if_relevant(ad_type: &[u8], payload: Vec<u8>) -> Result<AuthorizationData> {
    let inner = AuthorizationData::from(vec![AuthorizationDataInner {
        ad_type: ExplicitContextTag0::from(IntegerAsn1::from(ad_type.to_vec())),
        ad_data: ExplicitContextTag1::from(OctetStringAsn1::from(payload)),
    }]);

    Ok(AuthorizationData::from(vec![AuthorizationDataInner {
        ad_type: ExplicitContextTag0::from(IntegerAsn1::from(AD_IF_RELEVANT_TYPE.to_vec())),
        ad_data: ExplicitContextTag1::from(OctetStringAsn1::from(picky_asn1_der::to_vec(&inner)?)),
    }]))
}
