//! Client-side configuration.
//!
//! Settings come from three places, in priority order: explicit pins on
//! [`ClientConfig`], `KRB_KDC_URL`-style environment variables, and the
//! `krb5.conf` file named by `KRB5_CONFIG` (falling back to
//! `/etc/krb5.conf`). DNS discovery, the last resort, lives in
//! [`crate::transport::discovery`].

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use time::Duration;
use url::Url;

use crate::crypto::EncryptionType;
use crate::principal::SaltStrategy;
use crate::transport::{TransportKind, DEFAULT_EXCHANGE_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
use crate::{Error, ErrorKind, Result, DEFAULT_KDC_PORT};

/// Environment variable naming the `krb5.conf` location.
pub const KRB5_CONFIG_ENV: &str = "KRB5_CONFIG";
/// Per-realm KDC override, e.g. `KRB_KDC_URL_EXAMPLE.COM=tcp://dc1:88`.
pub const KDC_URL_REALM_ENV_PREFIX: &str = "KRB_KDC_URL_";
/// Global KDC override consulted when no per-realm variable is set.
pub const KDC_URL_ENV: &str = "KRB_KDC_URL";

const DEFAULT_KRB5_CONF_PATH: &str = "/etc/krb5.conf";

/// Accepts `tcp://host:88`, `udp://host:88`, `https://proxy/KdcProxy`, or a
/// bare `host[:port]`, which is taken as TCP on the standard port.
pub fn normalize_kdc_url(input: &str) -> Result<Url> {
    let with_scheme = if input.contains("://") {
        input.to_owned()
    } else {
        format!("tcp://{}", input)
    };

    let mut url = Url::from_str(&with_scheme)
        .map_err(|err| Error::new(ErrorKind::InvalidConfiguration, format!("invalid KDC URL {:?}: {}", input, err)))?;

    match url.scheme() {
        "tcp" | "udp" => {
            if url.port().is_none() {
                url.set_port(Some(DEFAULT_KDC_PORT)).map_err(|_| {
                    Error::new(ErrorKind::InvalidConfiguration, format!("invalid KDC URL {:?}", input))
                })?;
            }

            Ok(url)
        }
        "https" => Ok(url),
        scheme => Err(Error::new(
            ErrorKind::InvalidConfiguration,
            format!("unsupported KDC URL scheme: {}", scheme),
        )),
    }
}

fn is_comment_or_blank(line: &str) -> bool {
    matches!(line.chars().next(), None | Some('#') | Some(';'))
}

fn section_name(line: &str) -> Option<&str> {
    line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']'))
}

/// A parsed `krb5.conf`.
///
/// Entries are kept as a flat list of `section|group|key` paths so that
/// repeated keys, `kdc =` lines in particular, survive parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Krb5Conf {
    entries: Vec<(String, String)>,
}

impl Krb5Conf {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            Error::new(
                ErrorKind::InvalidConfiguration,
                format!("cannot open {}: {}", path.display(), err),
            )
        })?;

        Ok(Self::from_reader(BufReader::new(file)))
    }

    pub fn from_data(data: &str) -> Self {
        Self::from_reader(BufReader::new(data.as_bytes()))
    }

    fn from_reader(reader: impl BufRead) -> Self {
        let mut entries = Vec::new();
        let mut path: Vec<String> = Vec::new();

        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            let line = line.trim();

            if is_comment_or_blank(line) {
                continue;
            }

            if let Some(name) = section_name(line) {
                path = vec![name.trim().to_owned()];
                continue;
            }

            if line == "}" {
                path.truncate(1);
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                if value == "{" {
                    path.truncate(1);
                    path.push(key.to_owned());
                } else if !path.is_empty() {
                    let mut entry_path = path.join("|");
                    entry_path.push('|');
                    entry_path.push_str(key);
                    entries.push((entry_path, value.to_owned()));
                }
            }
        }

        Self { entries }
    }

    /// First value under the given `section|group|key` path, matched without
    /// regard to case.
    pub fn value(&self, path: &[&str]) -> Option<&str> {
        let wanted = path.join("|");

        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(&wanted))
            .map(|(_, value)| value.as_str())
    }

    /// Every `(key, value)` under the given section or group, repeats
    /// included.
    pub fn section_values(&self, path: &[&str]) -> Vec<(&str, &str)> {
        let mut prefix = path.join("|").to_ascii_lowercase();
        prefix.push('|');

        self.entries
            .iter()
            .filter(|(key, _)| key.to_ascii_lowercase().starts_with(&prefix))
            .map(|(key, value)| (&key[prefix.len()..], value.as_str()))
            .collect()
    }

    pub fn default_realm(&self) -> Option<&str> {
        self.value(&["libdefaults", "default_realm"])
    }

    /// `kdc =` entries of `[realms]` for the given realm, normalized to URLs.
    /// Entries that do not parse are skipped.
    pub fn kdc_urls(&self, realm: &str) -> Vec<Url> {
        self.section_values(&["realms", realm])
            .into_iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("kdc"))
            .filter_map(|(_, value)| match normalize_kdc_url(value) {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(%realm, value, %err, "skipping unusable kdc entry");
                    None
                }
            })
            .collect()
    }

    /// Resolves a host name to a realm through `[domain_realm]`.
    ///
    /// An exact entry wins; otherwise the longest `.suffix` entry that the
    /// host name ends with.
    pub fn realm_for_host(&self, host: &str) -> Option<&str> {
        let host = host.to_ascii_lowercase();
        let mut best: Option<(&str, &str)> = None;

        for (pattern, realm) in self.section_values(&["domain_realm"]) {
            let pattern_lower = pattern.to_ascii_lowercase();

            if pattern_lower == host {
                return Some(realm);
            }

            if pattern_lower.starts_with('.') && host.ends_with(&pattern_lower) {
                match best {
                    Some((current, _)) if current.len() >= pattern.len() => {}
                    _ => best = Some((pattern, realm)),
                }
            }
        }

        best.map(|(_, realm)| realm)
    }
}

/// Per-realm KDC URLs from the environment: `KRB_KDC_URL_<REALM>` first, then
/// the global `KRB_KDC_URL`. Multiple URLs are comma-separated.
pub fn kdc_urls_from_env(realm: &str) -> Vec<Url> {
    let per_realm = env::var(format!("{}{}", KDC_URL_REALM_ENV_PREFIX, realm.to_uppercase()));
    let value = match per_realm.or_else(|_| env::var(KDC_URL_ENV)) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match normalize_kdc_url(entry) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(%realm, entry, %err, "skipping unusable KDC URL from the environment");
                None
            }
        })
        .collect()
}

/// Everything a [`crate::client::KerberosClient`] needs besides credentials.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub default_realm: Option<String>,
    /// Preference-ordered encryption types offered in requests.
    pub encryption_types: Vec<EncryptionType>,
    /// Salt convention assumed when the KDC does not send ETYPE-INFO2.
    pub salt_strategy: SaltStrategy,
    pub max_time_skew: Duration,
    /// Requested ticket lifetime; the KDC may shorten it.
    pub ticket_lifetime: Duration,
    /// Requested renewable lifetime; `None` asks for a non-renewable ticket.
    pub renewable_lifetime: Option<Duration>,
    /// Explicit KDC pins by realm, tried before any discovery.
    pub kdc_urls: HashMap<String, Vec<Url>>,
    /// Transports in the order they are tried; leaving one out disables it.
    pub transport_order: Vec<TransportKind>,
    /// Stream connections kept per KDC endpoint.
    pub max_pool_connections: usize,
    /// Budget for one request/response attempt against one endpoint.
    pub exchange_timeout: StdDuration,
    krb5_conf: Option<Krb5Conf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut transport_order = vec![TransportKind::Udp, TransportKind::Tcp];
        if cfg!(feature = "kdc_proxy") {
            transport_order.push(TransportKind::HttpsProxy);
        }

        Self {
            default_realm: None,
            encryption_types: EncryptionType::default_etypes(),
            salt_strategy: SaltStrategy::default(),
            max_time_skew: Duration::minutes(5),
            ticket_lifetime: Duration::hours(10),
            renewable_lifetime: None,
            kdc_urls: HashMap::new(),
            transport_order,
            max_pool_connections: DEFAULT_MAX_CONNECTIONS,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            krb5_conf: None,
        }
    }
}

impl ClientConfig {
    pub fn new(default_realm: impl Into<String>) -> Self {
        Self {
            default_realm: Some(default_realm.into()),
            ..Self::default()
        }
    }

    /// Loads `krb5.conf` from `KRB5_CONFIG` or the standard path. Missing
    /// files are not an error; an unset default realm is filled from
    /// `[libdefaults]`.
    pub fn load_krb5_conf(&mut self) -> Result<()> {
        let path = env::var(KRB5_CONFIG_ENV).unwrap_or_else(|_| DEFAULT_KRB5_CONF_PATH.to_owned());
        let path = Path::new(&path);

        if !path.exists() {
            debug!(path = %path.display(), "no krb5.conf");
            return Ok(());
        }

        let conf = Krb5Conf::from_file(path)?;

        if self.default_realm.is_none() {
            self.default_realm = conf.default_realm().map(str::to_owned);
        }
        self.krb5_conf = Some(conf);

        Ok(())
    }

    pub fn with_krb5_conf(mut self, conf: Krb5Conf) -> Self {
        if self.default_realm.is_none() {
            self.default_realm = conf.default_realm().map(str::to_owned);
        }
        self.krb5_conf = Some(conf);

        self
    }

    /// Pins the KDCs for a realm, bypassing discovery.
    pub fn pin_kdc(&mut self, realm: &str, url: &str) -> Result<()> {
        let url = normalize_kdc_url(url)?;
        self.kdc_urls.entry(realm.to_uppercase()).or_default().push(url);

        Ok(())
    }

    pub fn krb5_conf(&self) -> Option<&Krb5Conf> {
        self.krb5_conf.as_ref()
    }

    /// Maps a service host to its realm: `[domain_realm]` when present,
    /// otherwise the default realm.
    pub fn realm_for_host(&self, host: &str) -> Option<String> {
        self.krb5_conf
            .as_ref()
            .and_then(|conf| conf.realm_for_host(host))
            .map(str::to_owned)
            .or_else(|| self.default_realm.clone())
    }

    pub fn default_realm(&self) -> Result<&str> {
        self.default_realm
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidConfiguration, "no default realm is configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
# client defaults
[libdefaults]
\tdefault_realm = EXAMPLE.COM
\tudp_preference_limit = 1

[realms]
\tEXAMPLE.COM = {
\t\tkdc = dc1.example.com:88
\t\tkdc = dc2.example.com
\t\tadmin_server = dc1.example.com
\t}
; trailing section
[domain_realm]
\t.example.com = EXAMPLE.COM
\t.dev.example.com = DEV.EXAMPLE.COM
\tlegacy-host = LEGACY.EXAMPLE.COM
";

    #[test]
    fn parses_sections_and_groups() {
        let conf = Krb5Conf::from_data(SAMPLE);

        assert_eq!(conf.default_realm(), Some("EXAMPLE.COM"));
        assert_eq!(conf.value(&["realms", "example.com", "admin_server"]), Some("dc1.example.com"));
        assert_eq!(conf.value(&["realms", "EXAMPLE.COM", "missing"]), None);
    }

    #[test]
    fn repeated_kdc_entries_survive() {
        let conf = Krb5Conf::from_data(SAMPLE);

        let urls: Vec<String> = conf.kdc_urls("EXAMPLE.COM").iter().map(Url::to_string).collect();

        assert_eq!(urls, vec!["tcp://dc1.example.com:88", "tcp://dc2.example.com:88"]);
    }

    #[test]
    fn domain_realm_prefers_exact_then_longest_suffix() {
        let conf = Krb5Conf::from_data(SAMPLE);

        assert_eq!(conf.realm_for_host("legacy-host"), Some("LEGACY.EXAMPLE.COM"));
        assert_eq!(conf.realm_for_host("files.example.com"), Some("EXAMPLE.COM"));
        assert_eq!(conf.realm_for_host("build.dev.example.com"), Some("DEV.EXAMPLE.COM"));
        assert_eq!(conf.realm_for_host("other.org"), None);
    }

    #[test]
    fn kdc_url_forms() {
        assert_eq!(normalize_kdc_url("dc1.example.com").unwrap().as_str(), "tcp://dc1.example.com:88");
        assert_eq!(normalize_kdc_url("dc1.example.com:189").unwrap().as_str(), "tcp://dc1.example.com:189");
        assert_eq!(normalize_kdc_url("udp://dc1.example.com").unwrap().as_str(), "udp://dc1.example.com:88");
        assert_eq!(
            normalize_kdc_url("https://gateway.example.com/KdcProxy").unwrap().as_str(),
            "https://gateway.example.com/KdcProxy"
        );
        assert!(normalize_kdc_url("ftp://dc1.example.com").is_err());
    }

    #[test]
    fn config_realm_fallbacks() {
        let mut config = ClientConfig::new("EXAMPLE.COM");
        assert_eq!(config.realm_for_host("anything.other.org"), Some("EXAMPLE.COM".to_owned()));

        config = config.with_krb5_conf(Krb5Conf::from_data(SAMPLE));
        assert_eq!(config.realm_for_host("build.dev.example.com"), Some("DEV.EXAMPLE.COM".to_owned()));
        assert_eq!(config.realm_for_host("unmapped.org"), Some("EXAMPLE.COM".to_owned()));
    }

    #[test]
    fn default_realm_is_required_for_lookup() {
        let config = ClientConfig::default();
        assert!(config.default_realm().is_err());

        let config = ClientConfig::new("EXAMPLE.COM");
        assert_eq!(config.default_realm().unwrap(), "EXAMPLE.COM");
    }
}
