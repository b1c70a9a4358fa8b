//! Delivery of encoded Kerberos messages to a KDC.
//!
//! [`TransportStack`] resolves the endpoints for a realm through
//! [`KdcLocator`] and tries each enabled transport in priority order against
//! the endpoints that speak it. Only transport-classified failures advance
//! the loop; a protocol answer, KRB-ERROR included, ends the exchange
//! immediately.

pub mod codec;
pub mod discovery;
#[cfg(feature = "kdc_proxy")]
pub mod proxy;
pub mod tcp;
pub mod udp;

use std::time::Duration;

use url::Url;

use crate::config::ClientConfig;
use crate::errors::{Error, ErrorClass, ErrorKind, Result};
use crate::DEFAULT_KDC_PORT;

pub use codec::{KrbStreamCodec, MAX_MESSAGE_LEN};
pub use discovery::KdcLocator;
pub use tcp::{TcpTransport, DEFAULT_MAX_CONNECTIONS};
pub use udp::UdpTransport;

/// Per-endpoint attempt budget; a slow endpoint is abandoned, not waited out.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    HttpsProxy,
}

impl TransportKind {
    pub fn from_url_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "https" => Some(TransportKind::HttpsProxy),
            _ => None,
        }
    }

    /// Stream transports carry responses of any size and serve the
    /// RESPONSE_TOO_BIG retry.
    pub const fn is_stream(self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::HttpsProxy)
    }
}

/// A raw KDC reply plus the transport that delivered it. The caller needs the
/// transport to decide whether a RESPONSE_TOO_BIG error warrants a stream
/// retry.
#[derive(Debug)]
pub struct KdcResponse {
    pub bytes: Vec<u8>,
    pub transport: TransportKind,
}

pub struct TransportStack {
    order: Vec<TransportKind>,
    timeout: Duration,
    locator: KdcLocator,
    tcp: TcpTransport,
    udp: UdpTransport,
    #[cfg(feature = "kdc_proxy")]
    proxy: proxy::ProxyTransport,
}

impl TransportStack {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            order: config.transport_order.clone(),
            timeout: config.exchange_timeout,
            locator: KdcLocator::new(config),
            tcp: TcpTransport::new(config.max_pool_connections),
            udp: UdpTransport,
            #[cfg(feature = "kdc_proxy")]
            proxy: proxy::ProxyTransport::new()?,
        })
    }

    /// Sends one request and returns the raw response, failing over across
    /// transports and endpoints.
    #[instrument(level = "debug", skip(self, request))]
    pub async fn exchange(&self, realm: &str, request: &[u8]) -> Result<KdcResponse> {
        self.exchange_via(&self.order, realm, request).await
    }

    /// Re-runs an exchange on stream transports only. Used after the KDC
    /// answers a datagram request with `KRB_ERR_RESPONSE_TOO_BIG`.
    #[instrument(level = "debug", skip(self, request))]
    pub async fn exchange_stream(&self, realm: &str, request: &[u8]) -> Result<KdcResponse> {
        let order: Vec<TransportKind> = self.order.iter().copied().filter(|kind| kind.is_stream()).collect();

        if order.is_empty() {
            return Err(Error::new(ErrorKind::NoEndpoints, "no stream transport is enabled"));
        }

        self.exchange_via(&order, realm, request).await
    }

    async fn exchange_via(&self, order: &[TransportKind], realm: &str, request: &[u8]) -> Result<KdcResponse> {
        let endpoints = self.locator.locate(realm).await?;
        let mut last_transport_err: Option<Error> = None;

        for kind in order {
            let matching = endpoints
                .iter()
                .filter(|endpoint| TransportKind::from_url_scheme(endpoint.scheme()) == Some(*kind));

            for endpoint in matching {
                let attempt = tokio::time::timeout(self.timeout, self.send_one(*kind, endpoint, realm, request)).await;

                let err = match attempt {
                    Ok(Ok(bytes)) => {
                        return Ok(KdcResponse {
                            bytes,
                            transport: *kind,
                        })
                    }
                    Ok(Err(err)) if err.class() == ErrorClass::Transport => err,
                    Ok(Err(err)) => return Err(err),
                    Err(_) => Error::new(
                        ErrorKind::Timeout,
                        format!("{} did not answer within {:?}", endpoint, self.timeout),
                    ),
                };

                warn!(%endpoint, %err, "transport attempt failed");
                last_transport_err = Some(err);
            }
        }

        Err(last_transport_err.unwrap_or_else(|| {
            Error::new(
                ErrorKind::NoEndpoints,
                format!("no endpoint for realm {} matches an enabled transport", realm),
            )
        }))
    }

    async fn send_one(&self, kind: TransportKind, endpoint: &Url, realm: &str, request: &[u8]) -> Result<Vec<u8>> {
        match kind {
            TransportKind::Udp => self.udp.exchange(endpoint, request).await,
            TransportKind::Tcp => self.tcp.exchange(endpoint, request).await,
            #[cfg(feature = "kdc_proxy")]
            TransportKind::HttpsProxy => self.proxy.exchange(endpoint, realm, request).await,
            #[cfg(not(feature = "kdc_proxy"))]
            TransportKind::HttpsProxy => {
                let _ = realm;
                Err(Error::new(
                    ErrorKind::InvalidConfiguration,
                    "KDC proxy support is not compiled into this build",
                ))
            }
        }
    }
}

pub(crate) fn endpoint_key(endpoint: &Url) -> Result<String> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| Error::new(ErrorKind::InvalidConfiguration, format!("KDC URL {} has no host", endpoint)))?;

    Ok(format!("{}:{}", host, endpoint.port().unwrap_or(DEFAULT_KDC_PORT)))
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use static_assertions::assert_impl_all;
    use tokio::net::{TcpListener, UdpSocket};
    use tokio_util::codec::Framed;

    use super::*;

    assert_impl_all!(TransportStack: Send, Sync);

    async fn tcp_echo() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, KrbStreamCodec::default());
                    while let Some(Ok(frame)) = framed.next().await {
                        if framed.send(frame.to_vec()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        format!("tcp://127.0.0.1:{}", addr.port())
    }

    async fn udp_echo() -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0_u8; MAX_MESSAGE_LEN];
            while let Ok((received, peer)) = socket.recv_from(&mut buf).await {
                if socket.send_to(&buf[..received], peer).await.is_err() {
                    break;
                }
            }
        });

        format!("udp://127.0.0.1:{}", addr.port())
    }

    async fn dead_tcp_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        format!("tcp://127.0.0.1:{}", addr.port())
    }

    #[test]
    fn scheme_mapping() {
        assert_eq!(TransportKind::from_url_scheme("udp"), Some(TransportKind::Udp));
        assert_eq!(TransportKind::from_url_scheme("tcp"), Some(TransportKind::Tcp));
        assert_eq!(TransportKind::from_url_scheme("https"), Some(TransportKind::HttpsProxy));
        assert_eq!(TransportKind::from_url_scheme("ftp"), None);
    }

    #[test]
    fn endpoint_key_fills_the_default_port() {
        let url = Url::parse("tcp://dc1.example.com").unwrap();
        assert_eq!(endpoint_key(&url).unwrap(), "dc1.example.com:88");

        let url = Url::parse("tcp://dc1.example.com:1088").unwrap();
        assert_eq!(endpoint_key(&url).unwrap(), "dc1.example.com:1088");
    }

    #[tokio::test]
    async fn fails_over_to_the_next_endpoint() {
        let dead = dead_tcp_endpoint().await;
        let live = tcp_echo().await;

        let mut config = ClientConfig::new("FAILOVER.TEST");
        config.pin_kdc("FAILOVER.TEST", &dead).unwrap();
        config.pin_kdc("FAILOVER.TEST", &live).unwrap();
        config.exchange_timeout = Duration::from_millis(500);

        let stack = TransportStack::new(&config).unwrap();
        let response = stack.exchange("FAILOVER.TEST", b"as-req bytes").await.unwrap();

        assert_eq!(response.bytes, b"as-req bytes");
        assert_eq!(response.transport, TransportKind::Tcp);
    }

    #[tokio::test]
    async fn datagram_is_preferred_over_stream() {
        let tcp = tcp_echo().await;
        let udp = udp_echo().await;

        let mut config = ClientConfig::new("ORDER.TEST");
        config.pin_kdc("ORDER.TEST", &tcp).unwrap();
        config.pin_kdc("ORDER.TEST", &udp).unwrap();

        let stack = TransportStack::new(&config).unwrap();
        let response = stack.exchange("ORDER.TEST", b"request").await.unwrap();

        assert_eq!(response.transport, TransportKind::Udp);
    }

    #[tokio::test]
    async fn contract_errors_do_not_fail_over() {
        let tcp = tcp_echo().await;
        let udp = udp_echo().await;

        let mut config = ClientConfig::new("POOL.TEST");
        config.pin_kdc("POOL.TEST", &tcp).unwrap();
        config.pin_kdc("POOL.TEST", &udp).unwrap();
        config.transport_order = vec![TransportKind::Tcp, TransportKind::Udp];
        config.max_pool_connections = 0;

        let stack = TransportStack::new(&config).unwrap();
        // The UDP endpoint would have answered; the pool violation must
        // surface instead of being retried around.
        let err = stack.exchange("POOL.TEST", b"request").await.unwrap_err();

        assert_eq!(err.error_type, ErrorKind::InvalidOperation);
    }

    #[tokio::test]
    async fn stream_retry_needs_a_stream_transport() {
        let mut config = ClientConfig::new("STREAMLESS.TEST");
        config.pin_kdc("STREAMLESS.TEST", "udp://dc1.streamless.test:88").unwrap();
        config.transport_order = vec![TransportKind::Udp];

        let stack = TransportStack::new(&config).unwrap();
        let err = stack.exchange_stream("STREAMLESS.TEST", b"request").await.unwrap_err();

        assert_eq!(err.error_type, ErrorKind::NoEndpoints);
    }
}
