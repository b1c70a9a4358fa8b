//! Kerberos client.
//!
//! [`KerberosClient`] drives the AS and TGS exchanges over the transport
//! stack and keeps the acquired tickets in a [`TicketCache`]; a service
//! ticket is only requested when the cache has nothing usable. Services that
//! receive AP-REQ tokens verify them with the [`acceptor`].

use std::sync::Arc;

pub mod acceptor;

mod as_exchange;
mod change_password;
mod extractors;
mod generators;
mod tgs_exchange;

pub use acceptor::{AcceptedContext, ApAcceptor};

use crate::cache::{CachedTicket, TicketCache};
use crate::config::ClientConfig;
use crate::errors::KrbErrorCode;
use crate::pkinit::PkCredentials;
use crate::principal::PrincipalName;
use crate::secret::Secret;
use crate::transport::TransportStack;
use crate::{Error, ErrorKind, Result};

/// Password credentials of one principal. The password is zeroed on drop.
pub struct Credentials {
    pub client: PrincipalName,
    password: Secret<Vec<u8>>,
}

impl Credentials {
    pub fn new(client: PrincipalName, password: impl Into<String>) -> Self {
        Self {
            client,
            password: Secret::new(password.into().into_bytes()),
        }
    }

    pub(super) fn password(&self) -> Result<&str> {
        std::str::from_utf8(self.password.as_slice())
            .map_err(|_| Error::new(ErrorKind::InvalidParameter, "password is not valid UTF-8"))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("client", &self.client).finish_non_exhaustive()
    }
}

/// One client instance per configuration. Cheap to share behind an `Arc`; the
/// transport pool and the ticket cache are internally synchronized.
pub struct KerberosClient {
    pub(super) config: ClientConfig,
    transport: TransportStack,
    cache: Arc<TicketCache>,
}

impl KerberosClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = TransportStack::new(&config)?;

        Ok(Self {
            config,
            transport,
            cache: Arc::new(TicketCache::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TicketCache> {
        &self.cache
    }

    /// Runs the AS exchange and caches the resulting TGT.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<CachedTicket> {
        let tgs = PrincipalName::tgs(credentials.client.realm())?;
        let tgt = as_exchange::request_initial_ticket(self, credentials, &tgs).await?;

        info!(client = %tgt.client, "initial authentication succeeded");
        self.cache.add(tgt.clone());

        Ok(tgt)
    }

    /// Runs the AS exchange with certificate credentials (PKINIT) and caches
    /// the resulting TGT.
    pub async fn authenticate_pkinit(
        &self,
        principal: &PrincipalName,
        pk_credentials: &PkCredentials,
    ) -> Result<CachedTicket> {
        let tgs = PrincipalName::tgs(principal.realm())?;
        let tgt = as_exchange::request_initial_ticket_pkinit(self, principal, pk_credentials, &tgs).await?;

        info!(client = %tgt.client, "PKINIT authentication succeeded");
        self.cache.add(tgt.clone());

        Ok(tgt)
    }

    /// A ticket for `service`, from the cache when possible, otherwise via a
    /// TGS exchange (authenticating first when no TGT is cached either).
    pub async fn service_ticket(&self, credentials: &Credentials, service: &PrincipalName) -> Result<CachedTicket> {
        if let Some(ticket) = self.cache.get(service) {
            debug!(service = %service, "serving ticket from the cache");
            return Ok(ticket);
        }

        let tgt = self.tgt(credentials).await?;
        let ticket = tgs_exchange::request_service_ticket(self, &tgt, service).await?;
        self.cache.add(ticket.clone());

        Ok(ticket)
    }

    /// S4U2Self: obtains a ticket to this service in the name of `user`. The
    /// result is not cached; it is evidence for a delegation hop.
    pub async fn impersonate(&self, credentials: &Credentials, user: &PrincipalName) -> Result<CachedTicket> {
        let tgt = self.tgt(credentials).await?;

        tgs_exchange::request_self_ticket(self, &tgt, user).await
    }

    /// S4U2Proxy: trades a forwardable evidence ticket for a ticket to
    /// `target` in the impersonated user's name.
    pub async fn delegate(
        &self,
        credentials: &Credentials,
        evidence: &CachedTicket,
        target: &PrincipalName,
    ) -> Result<CachedTicket> {
        let tgt = self.tgt(credentials).await?;

        tgs_exchange::request_proxy_ticket(self, &tgt, evidence, target).await
    }

    /// Renews a renewable ticket and replaces the cached copy.
    pub async fn renew(&self, ticket: &CachedTicket) -> Result<CachedTicket> {
        let renewed = tgs_exchange::renew_ticket(self, ticket).await?;
        self.cache.add(renewed.clone());

        Ok(renewed)
    }

    /// RFC 3244 password change against the realm's kpasswd service.
    pub async fn change_password(&self, credentials: &Credentials, new_password: &str) -> Result<()> {
        change_password::change_password(self, credentials, new_password).await
    }

    async fn tgt(&self, credentials: &Credentials) -> Result<CachedTicket> {
        let tgs = PrincipalName::tgs(credentials.client.realm())?;
        if let Some(tgt) = self.cache.get(&tgs) {
            return Ok(tgt);
        }

        self.authenticate(credentials).await
    }

    /// One request over the transport stack. A RESPONSE_TOO_BIG error on a
    /// datagram transport is retried once over a stream; every other error,
    /// protocol ones included, goes back to the caller.
    pub(super) async fn exchange(&self, realm: &str, request: &[u8]) -> Result<Vec<u8>> {
        let response = self.transport.exchange(realm, request).await?;
        if response.transport.is_stream() {
            return Ok(response.bytes);
        }

        if let Some(error) = extractors::krb_error(&response.bytes)? {
            if extractors::error_code(&error) == KrbErrorCode::KrbErrResponseTooBig {
                debug!(realm, "response too big for a datagram, retrying over a stream");
                return Ok(self.transport.exchange_stream(realm, request).await?.bytes);
            }
        }

        Ok(response.bytes)
    }
}
