//! MIT credential-cache files, format version 4.
//!
//! Reading is lenient: a missing, truncated, or otherwise unparseable file
//! loads as an empty cache so a stale `KRB5CCNAME` can never take the caller
//! down. Writing always produces the v4 layout.

use std::env;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use binrw::helpers::until_eof;
use binrw::io::TakeSeekExt;
use binrw::{binread, binwrite, BinRead, BinWrite};
use picky_krb::data_types::Ticket;
use time::OffsetDateTime;

use super::CachedTicket;
use crate::crypto::{EncryptionType, Key};
use crate::principal::PrincipalName;
use crate::{Error, ErrorKind, Result};

/// Environment variable naming the credential cache, MIT style:
/// `FILE:/tmp/krb5cc_1000`.
pub const KRB5CCNAME_ENV: &str = "KRB5CCNAME";

/// Resolves a cache name to a file path. Only the `FILE:` type (and bare
/// paths) are supported.
pub fn resolve_ccache_path(name: Option<&str>) -> Result<PathBuf> {
    let name = match name {
        Some(name) => name.to_owned(),
        None => env::var(KRB5CCNAME_ENV).map_err(|_| {
            Error::new(
                ErrorKind::InvalidConfiguration,
                format!("no credential cache name; set {}", KRB5CCNAME_ENV),
            )
        })?,
    };

    match name.split_once(':') {
        Some(("FILE", path)) => Ok(PathBuf::from(path)),
        Some((cache_type, _)) => Err(Error::new(
            ErrorKind::InvalidConfiguration,
            format!("unsupported credential cache type: {}", cache_type),
        )),
        None => Ok(PathBuf::from(name)),
    }
}

#[binwrite]
#[bw(big)]
#[binread]
#[br(big)]
struct CountedOctets {
    #[bw(try_calc(u32::try_from(bytes.len())))]
    len: u32,
    #[br(count = len)]
    bytes: Vec<u8>,
}

#[binwrite]
#[bw(big)]
#[binread]
#[br(big)]
struct TaggedField {
    tag: u16,
    #[bw(try_calc(u16::try_from(value.len())))]
    len: u16,
    #[br(count = len)]
    value: Vec<u8>,
}

#[binwrite]
#[bw(big)]
#[binread]
#[br(big)]
struct CcacheHeader {
    #[bw(calc = fields.iter().map(|field| field.value.len() as u16 + 4).sum::<u16>())]
    len: u16,
    #[br(map_stream = |s| s.take_seek(len as u64), parse_with = until_eof)]
    fields: Vec<TaggedField>,
}

#[binwrite]
#[bw(big)]
#[binread]
#[br(big)]
struct CcachePrincipal {
    name_type: u32,
    #[bw(try_calc(u32::try_from(components.len())))]
    component_count: u32,
    realm: CountedOctets,
    #[br(count = component_count)]
    components: Vec<CountedOctets>,
}

#[binwrite]
#[bw(big)]
#[binread]
#[br(big)]
struct CcacheKeyBlock {
    enc_type: u16,
    key: CountedOctets,
}

#[binwrite]
#[bw(big)]
#[binread]
#[br(big)]
struct TypedOctets {
    data_type: u16,
    data: CountedOctets,
}

#[binwrite]
#[bw(big)]
#[binread]
#[br(big)]
struct TypedList {
    #[bw(try_calc(u32::try_from(items.len())))]
    count: u32,
    #[br(count = count)]
    items: Vec<TypedOctets>,
}

#[binwrite]
#[bw(big)]
#[binread]
#[br(big)]
struct CcacheCredential {
    client: CcachePrincipal,
    server: CcachePrincipal,
    key: CcacheKeyBlock,
    auth_time: u32,
    start_time: u32,
    end_time: u32,
    renew_till: u32,
    is_skey: u8,
    ticket_flags: u32,
    addresses: TypedList,
    authorization_data: TypedList,
    ticket: CountedOctets,
    second_ticket: CountedOctets,
}

#[binwrite]
#[bw(big, magic = 0x0504_u16)]
#[binread]
#[br(big, magic = 0x0504_u16)]
struct CcacheFile {
    header: CcacheHeader,
    default_principal: CcachePrincipal,
    #[br(parse_with = until_eof)]
    credentials: Vec<CcacheCredential>,
}

impl CcachePrincipal {
    fn from_name(name: &PrincipalName) -> Self {
        Self {
            name_type: u32::from(name.name_type()),
            realm: CountedOctets {
                bytes: name.realm().as_bytes().to_vec(),
            },
            components: name
                .components()
                .iter()
                .map(|component| CountedOctets {
                    bytes: component.as_bytes().to_vec(),
                })
                .collect(),
        }
    }

    fn to_name(&self) -> Result<PrincipalName> {
        let name_type = u8::try_from(self.name_type)
            .map_err(|_| Error::new(ErrorKind::MalformedMessage, format!("name-type out of range: {}", self.name_type)))?;
        let realm = String::from_utf8(self.realm.bytes.clone())?;
        let components = self
            .components
            .iter()
            .map(|component| Ok(String::from_utf8(component.bytes.clone())?))
            .collect::<Result<Vec<String>>>()?;

        PrincipalName::new(name_type, &realm, components)
    }
}

fn to_epoch(timestamp: OffsetDateTime) -> u32 {
    timestamp.unix_timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

fn from_epoch(seconds: u32) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(i64::from(seconds))
        .map_err(|err| Error::new(ErrorKind::MalformedMessage, format!("invalid timestamp: {}", err)))
}

impl CcacheCredential {
    fn from_ticket(ticket: &CachedTicket) -> Result<Self> {
        Ok(Self {
            client: CcachePrincipal::from_name(&ticket.client),
            server: CcachePrincipal::from_name(&ticket.service),
            key: CcacheKeyBlock {
                enc_type: u16::from(u8::from(ticket.session_key.key_type())),
                key: CountedOctets {
                    bytes: ticket.session_key.as_bytes().to_vec(),
                },
            },
            auth_time: to_epoch(ticket.auth_time),
            start_time: ticket.start_time.map(to_epoch).unwrap_or(0),
            end_time: to_epoch(ticket.end_time),
            renew_till: ticket.renew_till.map(to_epoch).unwrap_or(0),
            is_skey: 0,
            ticket_flags: ticket.flags,
            addresses: TypedList { items: Vec::new() },
            authorization_data: TypedList { items: Vec::new() },
            ticket: CountedOctets {
                bytes: picky_asn1_der::to_vec(&ticket.ticket)?,
            },
            second_ticket: CountedOctets { bytes: Vec::new() },
        })
    }

    fn to_ticket(&self) -> Result<CachedTicket> {
        let session_key = Key::new(
            EncryptionType::try_from(usize::from(self.key.enc_type))?,
            self.key.key.bytes.clone(),
        )?;

        Ok(CachedTicket {
            client: self.client.to_name()?,
            service: self.server.to_name()?,
            ticket: picky_asn1_der::from_bytes::<Ticket>(&self.ticket.bytes)?,
            session_key,
            flags: self.ticket_flags,
            auth_time: from_epoch(self.auth_time)?,
            start_time: if self.start_time == 0 {
                None
            } else {
                Some(from_epoch(self.start_time)?)
            },
            end_time: from_epoch(self.end_time)?,
            renew_till: if self.renew_till == 0 {
                None
            } else {
                Some(from_epoch(self.renew_till)?)
            },
        })
    }
}

/// Encodes a cache holding `tickets` for `client` as one v4 byte blob.
pub fn encode(client: &PrincipalName, tickets: &[CachedTicket]) -> Result<Vec<u8>> {
    let file = CcacheFile {
        header: CcacheHeader { fields: Vec::new() },
        default_principal: CcachePrincipal::from_name(client),
        credentials: tickets.iter().map(CcacheCredential::from_ticket).collect::<Result<_>>()?,
    };

    let mut out = Cursor::new(Vec::new());
    file.write(&mut out)
        .map_err(|err| Error::new(ErrorKind::InternalError, format!("cannot encode credential cache: {}", err)))?;

    Ok(out.into_inner())
}

/// Strict parse of a v4 byte blob: the default principal and every credential
/// must decode.
pub fn decode(bytes: &[u8]) -> Result<(PrincipalName, Vec<CachedTicket>)> {
    let file = CcacheFile::read(&mut Cursor::new(bytes))
        .map_err(|err| Error::new(ErrorKind::MalformedMessage, format!("invalid credential cache: {}", err)))?;

    let principal = file.default_principal.to_name()?;
    let tickets = file
        .credentials
        .iter()
        .map(CcacheCredential::to_ticket)
        .collect::<Result<Vec<_>>>()?;

    Ok((principal, tickets))
}

/// Loads every entry from a cache file. Fails closed: any read or parse
/// problem yields an empty list.
pub fn load(path: &Path) -> Vec<CachedTicket> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %path.display(), %err, "no readable credential cache");
            return Vec::new();
        }
    };

    match decode(&bytes) {
        Ok((_, tickets)) => tickets,
        Err(err) => {
            warn!(path = %path.display(), %err, "corrupt credential cache treated as empty");
            Vec::new()
        }
    }
}

/// Writes (or replaces) the cache file for `client`.
pub fn store(path: &Path, client: &PrincipalName, tickets: &[CachedTicket]) -> Result<()> {
    let bytes = encode(client, tickets)?;

    std::fs::write(path, bytes).map_err(|err| {
        Error::new(
            ErrorKind::InvalidConfiguration,
            format!("cannot write credential cache {}: {}", path.display(), err),
        )
    })
}
