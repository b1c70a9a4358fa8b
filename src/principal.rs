use std::fmt;
use std::hash::{Hash, Hasher};

use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, IntegerAsn1};
use picky_krb::constants::types::{NT_ENTERPRISE, NT_PRINCIPAL, NT_SRV_INST};
use picky_krb::data_types::{KerberosStringAsn1, PrincipalName as PrincipalNameAsn1, Realm};

use crate::{Error, ErrorKind, Result, CHANGE_PASSWORD_SERVICE_NAME, KADMIN, TGT_SERVICE_NAME};

/// How a password salt is composed from the principal identity when no
/// explicit salt was negotiated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub enum SaltStrategy {
    /// RFC 4120 default: the realm followed by every name component, concatenated.
    #[default]
    Mit,
    /// MS-KILE form: the upper-cased realm followed by the first name component.
    ActiveDirectory,
}

/// A Kerberos principal identity: realm, ordered name components, and the
/// name-type tag.
///
/// Immutable once constructed. Components compare case-sensitively, the realm
/// case-insensitively, and the name type does not participate in equality
/// (RFC 4120 6.2).
#[derive(Debug, Clone)]
pub struct PrincipalName {
    realm: String,
    components: Vec<String>,
    name_type: u8,
}

impl PrincipalName {
    pub fn new(name_type: u8, realm: impl Into<String>, components: Vec<String>) -> Result<Self> {
        let realm = realm.into();

        if realm.is_empty() {
            return Err(Error::new(ErrorKind::InvalidParameter, "principal realm cannot be empty"));
        }
        if components.is_empty() || components.iter().any(|component| component.is_empty()) {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                "principal name components cannot be empty",
            ));
        }

        Ok(Self {
            realm,
            components,
            name_type,
        })
    }

    /// Client identity for the AS exchange. A user name carrying an `@` is an
    /// enterprise (UPN-style) name and keeps its suffix as part of the single
    /// component.
    pub fn client(username: &str, realm: &str) -> Result<Self> {
        if username.contains('@') {
            Self::new(NT_ENTERPRISE, realm, vec![username.to_owned()])
        } else {
            Self::new(NT_PRINCIPAL, realm, vec![username.to_owned()])
        }
    }

    /// Two-component service identity, e.g. `HOST/server.example.com`.
    pub fn service(service: &str, host: &str, realm: &str) -> Result<Self> {
        Self::new(NT_SRV_INST, realm, vec![service.to_owned(), host.to_owned()])
    }

    /// The ticket-granting service of `realm`: `krbtgt/<REALM>@<REALM>`.
    pub fn tgs(realm: &str) -> Result<Self> {
        Self::new(NT_SRV_INST, realm, vec![TGT_SERVICE_NAME.to_owned(), realm.to_owned()])
    }

    /// The change-password service of `realm` (RFC 3244).
    pub fn kpasswd(realm: &str) -> Result<Self> {
        Self::new(
            NT_SRV_INST,
            realm,
            vec![KADMIN.to_owned(), CHANGE_PASSWORD_SERVICE_NAME.to_owned()],
        )
    }

    /// Parses `svc/instance@REALM` and `user@REALM` forms. Names without an
    /// explicit realm take `default_realm`.
    pub fn parse(text: &str, default_realm: &str) -> Result<Self> {
        let (name, realm) = match text.rsplit_once('@') {
            Some((name, realm)) if !realm.is_empty() => (name, realm),
            _ => (text, default_realm),
        };

        let components: Vec<String> = name.split('/').map(str::to_owned).collect();
        let name_type = if components.len() > 1 { NT_SRV_INST } else { NT_PRINCIPAL };

        Self::new(name_type, realm, components)
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn name_type(&self) -> u8 {
        self.name_type
    }

    /// First name component. Every valid principal has at least one.
    pub fn primary(&self) -> &str {
        &self.components[0]
    }

    /// Whether this is the ticket-granting service of `realm`.
    pub fn is_tgs_of(&self, realm: &str) -> bool {
        self.components.len() == 2
            && self.components[0] == TGT_SERVICE_NAME
            && self.components[1].eq_ignore_ascii_case(realm)
    }

    /// The default password salt for this principal.
    pub fn salt(&self, strategy: SaltStrategy) -> String {
        match strategy {
            SaltStrategy::Mit => {
                let mut salt = self.realm.clone();
                for component in &self.components {
                    salt.push_str(component);
                }
                salt
            }
            SaltStrategy::ActiveDirectory => format!("{}{}", self.realm.to_uppercase(), self.primary()),
        }
    }

    pub fn to_asn1(&self) -> Result<PrincipalNameAsn1> {
        let components = self
            .components
            .iter()
            .map(|component| {
                Ok(KerberosStringAsn1::from(IA5String::from_string(
                    component.clone(),
                )?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PrincipalNameAsn1 {
            name_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![self.name_type])),
            name_string: ExplicitContextTag1::from(Asn1SequenceOf::from(components)),
        })
    }

    pub fn realm_to_asn1(&self) -> Result<Realm> {
        Ok(Realm::from(IA5String::from_string(self.realm.clone())?))
    }

    pub fn from_asn1(name: &PrincipalNameAsn1, realm: &Realm) -> Result<Self> {
        let name_type = *name
            .name_type
            .0
             .0
            .first()
            .ok_or_else(|| Error::new(ErrorKind::MalformedMessage, "principal name-type is empty"))?;

        let components = name
            .name_string
            .0
             .0
            .iter()
            .map(|component| component.0.to_string())
            .collect::<Vec<_>>();

        Self::new(name_type, realm.0.to_string(), components)
            .map_err(|err| Error::new(ErrorKind::MalformedMessage, err.description))
    }
}

impl PartialEq for PrincipalName {
    fn eq(&self, other: &Self) -> bool {
        self.realm.eq_ignore_ascii_case(&other.realm) && self.components == other.components
    }
}

impl Eq for PrincipalName {}

impl Hash for PrincipalName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.realm.to_ascii_uppercase().hash(state);
        self.components.hash(state);
    }
}

impl fmt::Display for PrincipalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.components.join("/"), self.realm)
    }
}
