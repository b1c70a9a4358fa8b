//! KDC proxy transport (MS-KKDCP).
//!
//! The Kerberos message travels inside a `KDC-PROXY-MESSAGE` posted to an
//! HTTPS gateway. The `kerb-message` field carries the message with its
//! 4-byte stream length prefix; some gateways answer without the prefix, so
//! unwrapping detects it by comparing the declared length against what is
//! actually there.

use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag1, OctetStringAsn1, Optional};
use picky_krb::data_types::KerberosStringAsn1;
use picky_krb::messages::KdcProxyMessage;
use url::Url;

use crate::errors::{Error, ErrorKind, Result};

pub struct ProxyTransport {
    client: reqwest::Client,
}

impl ProxyTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| Error::new(ErrorKind::InternalError, format!("cannot build the HTTP client: {}", err)))?;

        Ok(Self { client })
    }

    #[instrument(level = "debug", skip(self, request))]
    pub async fn exchange(&self, endpoint: &Url, realm: &str, request: &[u8]) -> Result<Vec<u8>> {
        let body = wrap_proxy_message(request, Some(realm))?;

        let response = self
            .client
            .post(endpoint.clone())
            .body(body)
            .send()
            .await
            .map_err(|err| {
                Error::new(
                    ErrorKind::ConnectionFailure,
                    format!("cannot reach the KDC proxy {}: {}", endpoint, err),
                )
            })?;

        if !response.status().is_success() {
            return Err(Error::new(
                ErrorKind::ConnectionFailure,
                format!("KDC proxy {} answered with status {}", endpoint, response.status()),
            ));
        }

        let bytes = response.bytes().await.map_err(|err| {
            Error::new(
                ErrorKind::ConnectionFailure,
                format!("cannot read the KDC proxy response: {}", err),
            )
        })?;

        unwrap_proxy_message(&bytes)
    }
}

/// Encloses a Kerberos message, stream framing included, in a
/// `KDC-PROXY-MESSAGE`.
pub fn wrap_proxy_message(message: &[u8], target_domain: Option<&str>) -> Result<Vec<u8>> {
    let mut framed = Vec::with_capacity(4 + message.len());
    framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
    framed.extend_from_slice(message);

    let target_domain = match target_domain {
        Some(domain) => Some(ExplicitContextTag1::from(KerberosStringAsn1::from(
            IA5String::from_string(domain.to_owned())?,
        ))),
        None => None,
    };

    let proxy_message = KdcProxyMessage {
        kerb_message: ExplicitContextTag0::from(OctetStringAsn1::from(framed)),
        target_domain: Optional::from(target_domain),
        dclocator_hint: Optional::from(None),
    };

    Ok(picky_asn1_der::to_vec(&proxy_message)?)
}

/// Extracts the inner Kerberos message, tolerating both the length-prefixed
/// and the bare encoding of `kerb-message`.
pub fn unwrap_proxy_message(bytes: &[u8]) -> Result<Vec<u8>> {
    let proxy_message: KdcProxyMessage = picky_asn1_der::from_bytes(bytes)?;
    let inner = proxy_message.kerb_message.0 .0;

    if inner.len() >= 4 {
        let declared = u32::from_be_bytes([inner[0], inner[1], inner[2], inner[3]]) as usize;
        if declared == inner.len() - 4 {
            return Ok(inner[4..].to_vec());
        }
    }

    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap_strips_the_length_prefix() {
        let message = [0x6a, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

        let wrapped = wrap_proxy_message(&message, Some("EXAMPLE.COM")).unwrap();
        let proxy_message: KdcProxyMessage = picky_asn1_der::from_bytes(&wrapped).unwrap();
        assert_eq!(&proxy_message.kerb_message.0 .0[0..4], &[0, 0, 0, 9]);

        assert_eq!(unwrap_proxy_message(&wrapped).unwrap(), message);
    }

    #[test]
    fn unwrap_accepts_a_bare_inner_message() {
        let message = vec![0x6a, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

        let proxy_message = KdcProxyMessage {
            kerb_message: ExplicitContextTag0::from(OctetStringAsn1::from(message.clone())),
            target_domain: Optional::from(None),
            dclocator_hint: Optional::from(None),
        };
        let encoded = picky_asn1_der::to_vec(&proxy_message).unwrap();

        assert_eq!(unwrap_proxy_message(&encoded).unwrap(), message);
    }

    #[test]
    fn unwrap_rejects_garbage() {
        let err = unwrap_proxy_message(&[0xff, 0x00, 0x12]).unwrap_err();
        assert_eq!(err.error_type, ErrorKind::MalformedMessage);
    }
}
