//! KDC endpoint discovery.
//!
//! Sources are consulted in a fixed order: explicit pins on the client
//! configuration, the `KRB_KDC_URL_<REALM>`/`KRB_KDC_URL` environment
//! overrides, `kdc =` entries of `krb5.conf`, and finally DNS SRV records
//! (`_kerberos._tcp.<realm>`, then `_kerberos._udp.<realm>`). The first source
//! that yields endpoints wins. Everything except pins is memoized per realm
//! for the lifetime of the locator.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use url::Url;

use crate::config::{kdc_urls_from_env, ClientConfig, Krb5Conf};
use crate::errors::{Error, ErrorKind, Result};

pub struct KdcLocator {
    pins: HashMap<String, Vec<Url>>,
    conf: Option<Krb5Conf>,
    resolved: Mutex<HashMap<String, Vec<Url>>>,
}

impl KdcLocator {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            pins: config.kdc_urls.clone(),
            conf: config.krb5_conf().cloned(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Ordered endpoint list for a realm.
    ///
    /// Fails with [`ErrorKind::NoEndpoints`] when every source comes up
    /// empty; that outcome is not memoized, so a later call sees environment
    /// or DNS changes.
    #[instrument(level = "debug", skip(self))]
    pub async fn locate(&self, realm: &str) -> Result<Vec<Url>> {
        let realm_key = realm.to_uppercase();

        if let Some(pinned) = self.pins.get(&realm_key) {
            if !pinned.is_empty() {
                return Ok(pinned.clone());
            }
        }

        if let Some(cached) = self.lock().get(&realm_key) {
            return Ok(cached.clone());
        }

        let mut endpoints = kdc_urls_from_env(realm);

        if endpoints.is_empty() {
            if let Some(conf) = &self.conf {
                endpoints = conf.kdc_urls(realm);
            }
        }

        #[cfg(feature = "dns_resolver")]
        if endpoints.is_empty() {
            endpoints = dns::discover(realm).await;
        }

        if endpoints.is_empty() {
            return Err(Error::new(
                ErrorKind::NoEndpoints,
                format!("no KDC is configured or discoverable for realm {}", realm),
            ));
        }

        debug!(%realm, count = endpoints.len(), "KDC endpoints resolved");
        self.lock().insert(realm_key, endpoints.clone());

        Ok(endpoints)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Url>>> {
        self.resolved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(feature = "dns_resolver")]
mod dns {
    use std::cmp::Reverse;

    use hickory_resolver::TokioAsyncResolver;
    use url::Url;

    use crate::config::normalize_kdc_url;

    pub(super) async fn discover(realm: &str) -> Vec<Url> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(err) => {
                warn!(%err, "cannot build a DNS resolver from the system configuration");
                return Vec::new();
            }
        };

        let domain = realm.to_ascii_lowercase();

        let endpoints = srv_endpoints(&resolver, &format!("_kerberos._tcp.{}", domain), "tcp").await;
        if !endpoints.is_empty() {
            return endpoints;
        }

        srv_endpoints(&resolver, &format!("_kerberos._udp.{}", domain), "udp").await
    }

    async fn srv_endpoints(resolver: &TokioAsyncResolver, query: &str, scheme: &str) -> Vec<Url> {
        let lookup = match resolver.srv_lookup(query).await {
            Ok(lookup) => lookup,
            Err(err) => {
                debug!(query, %err, "SRV lookup came up empty");
                return Vec::new();
            }
        };

        let mut records: Vec<_> = lookup.iter().collect();
        records.sort_by_key(|record| (record.priority(), Reverse(record.weight())));

        records
            .into_iter()
            .filter_map(|record| {
                let target = record.target().to_string();
                let target = target.trim_end_matches('.');
                normalize_kdc_url(&format!("{}://{}:{}", scheme, target, record.port())).ok()
            })
            .collect()
    }
}
