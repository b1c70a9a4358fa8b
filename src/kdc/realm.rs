//! Realm principal directory.
//!
//! The KDC authenticates against a directory of principals loaded from a TOML
//! document. Long-term keys are derived (or hex-decoded) once at load time, so
//! request handling never touches passwords.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::crypto::{EncryptionType, Key};
use crate::principal::{PrincipalName, SaltStrategy};
use crate::{Error, ErrorKind, Result};

fn default_clock_skew_seconds() -> u64 {
    300
}

fn default_ticket_lifetime_seconds() -> u64 {
    36_000
}

fn default_renewable_lifetime_seconds() -> u64 {
    604_800
}

fn default_requires_preauth() -> bool {
    true
}

/// On-disk shape of a realm definition.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealmDocument {
    pub realm: String,
    #[serde(default = "default_clock_skew_seconds")]
    pub max_clock_skew_seconds: u64,
    #[serde(default = "default_ticket_lifetime_seconds")]
    pub ticket_lifetime_seconds: u64,
    #[serde(default = "default_renewable_lifetime_seconds")]
    pub renewable_lifetime_seconds: u64,
    #[serde(default)]
    pub salt_strategy: SaltStrategy,
    #[serde(default)]
    pub principals: BTreeMap<String, PrincipalDocument>,
}

/// One principal entry of a [`RealmDocument`]. Exactly one of `password` and
/// `keys` must be present.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalDocument {
    pub password: Option<String>,
    /// Raw long-term keys, hex encoded, keyed by encryption type.
    pub keys: Option<HashMap<EncryptionType, String>>,
    /// Overrides the salt derived from the principal name.
    pub salt: Option<String>,
    /// Restricts which encryption types get keys derived from `password`.
    pub encryption_types: Option<Vec<EncryptionType>>,
    #[serde(default = "default_requires_preauth")]
    pub requires_preauth: bool,
    /// Services this principal may obtain delegated tickets for (S4U2Proxy).
    #[serde(default)]
    pub delegation_targets: Vec<String>,
}

/// Issuance limits applied to every ticket of the realm.
#[derive(Debug, Clone, Copy)]
pub struct RealmPolicy {
    pub max_clock_skew: time::Duration,
    pub ticket_lifetime: time::Duration,
    pub renewable_lifetime: time::Duration,
}

/// A registered principal with its derived long-term keys.
#[derive(Debug)]
pub struct PrincipalRecord {
    pub principal: PrincipalName,
    pub keys: Vec<Key>,
    pub salt: String,
    pub requires_preauth: bool,
    pub delegation_targets: Vec<PrincipalName>,
}

impl PrincipalRecord {
    pub fn key_of_type(&self, etype: EncryptionType) -> Option<&Key> {
        self.keys.iter().find(|key| key.key_type() == etype)
    }

    /// Picks the first key matching the client's preference-ordered offer.
    pub fn pick_key(&self, offered: &[EncryptionType]) -> Option<&Key> {
        offered.iter().find_map(|etype| self.key_of_type(*etype))
    }

    /// Whether constrained delegation to `target` is allowed for this record.
    pub fn can_delegate_to(&self, target: &PrincipalName) -> bool {
        self.delegation_targets.iter().any(|allowed| allowed == target)
    }
}

/// All principals of one realm plus the realm-wide issuance policy.
#[derive(Debug)]
pub struct RealmDirectory {
    name: String,
    policy: RealmPolicy,
    salt_strategy: SaltStrategy,
    principals: HashMap<String, Arc<PrincipalRecord>>,
    tgs: Arc<PrincipalRecord>,
}

impl RealmDirectory {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|err| {
            Error::new(
                ErrorKind::InvalidConfiguration,
                format!("cannot read realm document {:?}: {}", path, err),
            )
        })?;

        Self::from_data(&data)
    }

    pub fn from_data(data: &str) -> Result<Self> {
        let document: RealmDocument = toml::from_str(data)
            .map_err(|err| Error::new(ErrorKind::InvalidConfiguration, format!("invalid realm document: {}", err)))?;

        Self::from_document(document)
    }

    pub fn from_document(document: RealmDocument) -> Result<Self> {
        let name = document.realm;
        if name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidConfiguration, "realm name cannot be empty"));
        }

        let policy = RealmPolicy {
            max_clock_skew: time::Duration::seconds(document.max_clock_skew_seconds as i64),
            ticket_lifetime: time::Duration::seconds(document.ticket_lifetime_seconds as i64),
            renewable_lifetime: time::Duration::seconds(document.renewable_lifetime_seconds as i64),
        };

        let mut principals = HashMap::with_capacity(document.principals.len());
        for (spelled_name, entry) in document.principals {
            let principal = PrincipalName::parse(&spelled_name, &name)?;
            if !principal.realm().eq_ignore_ascii_case(&name) {
                return Err(Error::new(
                    ErrorKind::InvalidConfiguration,
                    format!("principal {} does not belong to realm {}", principal, name),
                ));
            }

            let record = build_record(principal, entry, document.salt_strategy, &name)?;
            principals.insert(record.principal.components().join("/"), Arc::new(record));
        }

        let tgs_name = PrincipalName::tgs(&name)?;
        let tgs = principals
            .get(&tgs_name.components().join("/"))
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidConfiguration,
                    format!("realm {} has no ticket-granting service principal {}", name, tgs_name),
                )
            })?;

        debug!(realm = %name, principals = principals.len(), "realm directory loaded");

        Ok(Self {
            name,
            policy,
            salt_strategy: document.salt_strategy,
            principals,
            tgs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RealmPolicy {
        &self.policy
    }

    pub fn salt_strategy(&self) -> SaltStrategy {
        self.salt_strategy
    }

    /// The `krbtgt/<REALM>` record. Present in every loaded directory.
    pub fn tgs_record(&self) -> Arc<PrincipalRecord> {
        Arc::clone(&self.tgs)
    }

    /// Looks up a principal by wire name. Enterprise (UPN-style) names whose
    /// suffix is this realm fall back to the plain user entry.
    pub fn lookup(&self, name: &PrincipalName) -> Option<Arc<PrincipalRecord>> {
        if let Some(record) = self.principals.get(&name.components().join("/")) {
            return Some(Arc::clone(record));
        }

        if let [single] = name.components() {
            if let Some((user, suffix)) = single.rsplit_once('@') {
                if suffix.eq_ignore_ascii_case(&self.name) {
                    return self.principals.get(user).map(Arc::clone);
                }
            }
        }

        None
    }
}

fn build_record(
    principal: PrincipalName,
    entry: PrincipalDocument,
    salt_strategy: SaltStrategy,
    realm: &str,
) -> Result<PrincipalRecord> {
    let salt = entry.salt.unwrap_or_else(|| principal.salt(salt_strategy));

    let keys = match (entry.password, entry.keys) {
        (Some(password), None) => {
            let etypes = entry.encryption_types.unwrap_or_else(EncryptionType::default_etypes);

            etypes
                .into_iter()
                .map(|etype| Key::from_password(etype, &password, &salt))
                .collect::<Result<Vec<_>>>()?
        }
        (None, Some(raw_keys)) => {
            let mut keys = Vec::with_capacity(raw_keys.len());
            for (etype, encoded) in raw_keys {
                let value = hex::decode(&encoded).map_err(|err| {
                    Error::new(
                        ErrorKind::InvalidConfiguration,
                        format!("invalid key material for {}: {}", principal, err),
                    )
                })?;
                keys.push(Key::new(etype, value)?);
            }
            keys
        }
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidConfiguration,
                format!("principal {} must define exactly one of password or keys", principal),
            ));
        }
    };

    if keys.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidConfiguration,
            format!("principal {} has no usable keys", principal),
        ));
    }

    let delegation_targets = entry
        .delegation_targets
        .iter()
        .map(|target| PrincipalName::parse(target, realm))
        .collect::<Result<Vec<_>>>()?;

    Ok(PrincipalRecord {
        principal,
        keys,
        salt,
        requires_preauth: entry.requires_preauth,
        delegation_targets,
    })
}

/// A set of realm directories served by one KDC process.
#[derive(Debug, Default)]
pub struct RealmStore {
    realms: HashMap<String, Arc<RealmDirectory>>,
    primary: Option<String>,
}

impl RealmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a directory. The first one added becomes the primary realm
    /// used when an error reply cannot be attributed to any request realm.
    pub fn add(&mut self, directory: RealmDirectory) {
        let key = directory.name().to_uppercase();
        if self.primary.is_none() {
            self.primary = Some(key.clone());
        }
        self.realms.insert(key, Arc::new(directory));
    }

    pub fn primary(&self) -> Option<Arc<RealmDirectory>> {
        self.primary
            .as_deref()
            .and_then(|name| self.realms.get(name))
            .map(Arc::clone)
    }
}

/// Realm resolution seam of the request pipeline. Deployments with an external
/// principal store implement this in place of [`RealmStore`].
pub trait RealmLookup: Send + Sync + 'static {
    fn realm(&self, name: &str) -> Option<Arc<RealmDirectory>>;
}

impl RealmLookup for RealmStore {
    fn realm(&self, name: &str) -> Option<Arc<RealmDirectory>> {
        self.realms.get(&name.to_uppercase()).map(Arc::clone)
    }
}
