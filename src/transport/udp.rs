//! Datagram transport.
//!
//! UDP carries the bare DER message with no length prefix. One socket per
//! exchange; there is nothing to pool.

use tokio::net::UdpSocket;
use url::Url;

use crate::errors::{Error, ErrorKind, Result};
use crate::transport::codec::MAX_MESSAGE_LEN;
use crate::transport::endpoint_key;

#[derive(Debug, Default)]
pub struct UdpTransport;

impl UdpTransport {
    #[instrument(level = "debug", skip(self, request))]
    pub async fn exchange(&self, endpoint: &Url, request: &[u8]) -> Result<Vec<u8>> {
        let key = endpoint_key(endpoint)?;
        let target = tokio::net::lookup_host(&key)
            .await?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::NoEndpoints, format!("{} does not resolve", key)))?;

        let bind_addr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;

        socket.send(request).await?;

        let mut response = vec![0_u8; MAX_MESSAGE_LEN];
        let received = socket.recv(&mut response).await?;
        if received == 0 {
            return Err(Error::new(ErrorKind::ConnectionFailure, format!("{} sent an empty reply", key)));
        }
        response.truncate(received);

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_kdc() -> Url {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0_u8; MAX_MESSAGE_LEN];
            loop {
                let Ok((received, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                if socket.send_to(&buf[..received], peer).await.is_err() {
                    break;
                }
            }
        });

        Url::parse(&format!("udp://127.0.0.1:{}", addr.port())).unwrap()
    }

    #[tokio::test]
    async fn exchange_round_trip_without_framing() {
        let endpoint = echo_kdc().await;
        let transport = UdpTransport;

        let response = transport.exchange(&endpoint, b"bare der bytes").await.unwrap();
        assert_eq!(response, b"bare der bytes");
    }
}
