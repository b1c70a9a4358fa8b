//! Stream transport with a bounded connection pool per endpoint.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Url;

use crate::errors::{Error, ErrorKind, Result};
use crate::transport::codec::KrbStreamCodec;
use crate::transport::endpoint_key;

/// Connections kept per endpoint, idle and in-flight together.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

type KrbStream = Framed<TcpStream, KrbStreamCodec>;

#[derive(Default)]
struct EndpointPool {
    idle: Vec<KrbStream>,
    checked_out: usize,
}

/// One request/response exchange over TCP with the 4-byte length framing.
///
/// A healthy connection goes back into the pool after the response; a
/// connection that saw any I/O error is dropped on the floor. When every slot
/// for an endpoint is taken the caller gets an immediate
/// [`ErrorKind::InvalidOperation`] instead of queueing.
pub struct TcpTransport {
    max_per_endpoint: usize,
    pools: Mutex<HashMap<String, EndpointPool>>,
}

impl TcpTransport {
    pub fn new(max_per_endpoint: usize) -> Self {
        Self {
            max_per_endpoint,
            pools: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(level = "debug", skip(self, request))]
    pub async fn exchange(&self, endpoint: &Url, request: &[u8]) -> Result<Vec<u8>> {
        let key = endpoint_key(endpoint)?;
        let (slot, mut stream) = self.acquire(&key).await?;

        stream.send(request).await?;

        match stream.next().await {
            Some(Ok(frame)) => {
                slot.release(stream);
                Ok(frame.to_vec())
            }
            // The slot drop frees the claim; the connection is discarded.
            Some(Err(err)) => Err(err),
            None => Err(Error::new(
                ErrorKind::ConnectionFailure,
                "connection closed before the response arrived",
            )),
        }
    }

    async fn acquire(&self, key: &str) -> Result<(Slot<'_>, KrbStream)> {
        // Claim an idle connection or a slot for a new one; the connect
        // itself happens outside the lock.
        let reused = {
            let mut pools = self.lock();
            let pool = pools.entry(key.to_owned()).or_default();

            if let Some(stream) = pool.idle.pop() {
                pool.checked_out += 1;
                Some(stream)
            } else if pool.checked_out < self.max_per_endpoint {
                pool.checked_out += 1;
                None
            } else {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!(
                        "connection pool for {} is exhausted ({} connections in use)",
                        key, pool.checked_out
                    ),
                ));
            }
        };

        let slot = Slot {
            transport: self,
            key: key.to_owned(),
            pooled: false,
        };

        let stream = match reused {
            Some(stream) => stream,
            None => {
                let socket = TcpStream::connect(key).await?;
                Framed::new(socket, KrbStreamCodec::default())
            }
        };

        Ok((slot, stream))
    }

    fn forget(&self, key: &str) {
        let mut pools = self.lock();
        if let Some(pool) = pools.get_mut(key) {
            pool.checked_out = pool.checked_out.saturating_sub(1);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EndpointPool>> {
        self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn counts(&self, key: &str) -> (usize, usize) {
        let pools = self.lock();
        pools
            .get(key)
            .map(|pool| (pool.idle.len(), pool.checked_out))
            .unwrap_or((0, 0))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS)
    }
}

/// A claimed pool slot. Dropping it frees the claim without pooling the
/// connection; [`Slot::release`] pools the connection as well. Cancelled and
/// failed exchanges therefore never leak a slot.
struct Slot<'a> {
    transport: &'a TcpTransport,
    key: String,
    pooled: bool,
}

impl Slot<'_> {
    fn release(mut self, stream: KrbStream) {
        let mut pools = self.transport.lock();
        if let Some(pool) = pools.get_mut(&self.key) {
            pool.checked_out = pool.checked_out.saturating_sub(1);
            pool.idle.push(stream);
            self.pooled = true;
        }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.pooled {
            self.transport.forget(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;

    async fn echo_kdc() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
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

        (format!("127.0.0.1:{}", addr.port()), connections)
    }

    #[tokio::test]
    async fn exchange_reuses_pooled_connections() {
        let (key, connections) = echo_kdc().await;
        let endpoint = Url::parse(&format!("tcp://{}", key)).unwrap();
        let transport = TcpTransport::default();

        let first = transport.exchange(&endpoint, b"request one").await.unwrap();
        assert_eq!(first, b"request one");
        assert_eq!(transport.counts(&key), (1, 0));

        let second = transport.exchange(&endpoint, b"request two").await.unwrap();
        assert_eq!(second, b"request two");

        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(transport.counts(&key), (1, 0));
    }

    #[tokio::test]
    async fn pool_bound_fails_fast() {
        let (key, _connections) = echo_kdc().await;
        let transport = TcpTransport::new(2);

        let first = transport.acquire(&key).await.unwrap();
        let _second = transport.acquire(&key).await.unwrap();

        let err = transport.acquire(&key).await.unwrap_err();
        assert_eq!(err.error_type, ErrorKind::InvalidOperation);

        // Dropping a claim frees its slot for the next caller.
        drop(first);
        let _third = transport.acquire(&key).await.unwrap();
    }

    #[tokio::test]
    async fn failed_connection_is_not_pooled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = format!("127.0.0.1:{}", addr.port());
        let endpoint = Url::parse(&format!("tcp://{}", key)).unwrap();

        tokio::spawn(async move {
            loop {
                // Accept and hang up without answering.
                let (socket, _) = listener.accept().await.unwrap();
                drop(socket);
            }
        });

        let transport = TcpTransport::default();
        let err = transport.exchange(&endpoint, b"request").await.unwrap_err();
        assert_eq!(err.class(), crate::errors::ErrorClass::Transport);
        assert_eq!(transport.counts(&key), (0, 0));
    }

    #[tokio::test]
    async fn connect_failure_frees_the_claimed_slot() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let key = format!("127.0.0.1:{}", addr.port());
        let transport = TcpTransport::new(1);

        assert!(transport.acquire(&key).await.is_err());
        // The slot is free again, the bound was not leaked away.
        assert_eq!(transport.counts(&key), (0, 0));
    }
}
