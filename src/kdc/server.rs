//! TCP front end of the KDC.
//!
//! Messages arrive with the 4-byte length framing of RFC 4120 7.2.2; each
//! accepted connection runs on its own task and may carry any number of
//! requests in order. The acceptor and every connection task watch one
//! shutdown channel, and [`KdcServer::shutdown`] joins them all before
//! returning.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;

use super::Kdc;
use crate::transport::KrbStreamCodec;
use crate::Result;

/// A running KDC listener.
pub struct KdcServer {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

impl KdcServer {
    /// Binds `addr` and starts serving `kdc` on it.
    pub async fn bind(addr: SocketAddr, kdc: Kdc) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (stop, stopped) = watch::channel(false);

        let acceptor = tokio::spawn(accept_loop(listener, Arc::new(kdc), stopped));

        info!(%local_addr, "KDC listening");

        Ok(Self {
            local_addr,
            stop,
            acceptor,
        })
    }

    /// The bound address, with an ephemeral port resolved to the real one.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, signals every connection task, and waits for them.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.acceptor.await {
            warn!(%err, "KDC acceptor task failed");
        }
    }
}

async fn accept_loop(listener: TcpListener, kdc: Arc<Kdc>, mut stopped: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    connections.spawn(serve_connection(stream, Arc::clone(&kdc), stopped.clone()));
                }
                Err(err) => warn!(%err, "accept failed"),
            },
            // reap finished connection tasks as we go
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = finished {
                    warn!(%err, "connection task failed");
                }
            }
        }
    }

    drop(listener);
    while let Some(finished) = connections.join_next().await {
        if let Err(err) = finished {
            warn!(%err, "connection task failed");
        }
    }
}

async fn serve_connection(stream: TcpStream, kdc: Arc<Kdc>, mut stopped: watch::Receiver<bool>) {
    let peer = stream.peer_addr().ok();
    let mut framed = Framed::new(stream, KrbStreamCodec::default());

    loop {
        let frame = tokio::select! {
            _ = stopped.changed() => break,
            frame = framed.next() => frame,
        };

        let request = match frame {
            Some(Ok(request)) => request,
            Some(Err(err)) => {
                debug!(?peer, %err, "closing connection after framing error");
                break;
            }
            None => break,
        };

        // process() only fails when not even a KRB-ERROR could be encoded
        let reply = match kdc.process(&request) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(?peer, %err, "request could not be answered");
                break;
            }
        };

        if let Err(err) = framed.send(reply).await {
            debug!(?peer, %err, "reply send failed");
            break;
        }
    }
}
