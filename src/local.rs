//! Host-enumeration records and the local session correlator: matches
//! independently captured session and local-group records onto computer
//! objects with fuzzy hostname/domain heuristics, then attaches the
//! resulting edges.
//!
//! Records arrive as JSON Lines with a `kind` discriminator, one record
//! per line, as produced by the host-enumeration tooling. Each record
//! carries a `matched` flag the correlator sets so repeated captures of
//! the same session cannot be attributed twice.
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::engine::{Engine, IdentityMaps, ObjectStore};
use crate::ldap;
use crate::object::{DirectoryObject, TypedRef};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalRecord {
    Session(SessionRecord),
    PrivilegedSession(PrivilegedSessionRecord),
    RegistrySession(RegistrySessionRecord),
    LocalGroupMember(LocalGroupRecord),
}

/// A network session observed on a host (NetSessionEnum-style source).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionRecord {
    pub computer_name: String,
    #[serde(default)]
    pub ptr_record: Option<String>,
    #[serde(default)]
    pub computer_domain: Option<String>,
    #[serde(default)]
    pub computer_netbios_domain: Option<String>,
    pub username: String,
    #[serde(default)]
    pub matched: bool,
}

/// An interactive or service logon observed on a host (NetWkstaUserEnum).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrivilegedSessionRecord {
    #[serde(default)]
    pub host_fqdn: Option<String>,
    pub host_name: String,
    #[serde(default)]
    pub host_domain: Option<String>,
    pub user: String,
    #[serde(default)]
    pub matched: bool,
}

/// A logon derived from profile keys in the registry; carries the acting
/// principal's SID directly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistrySessionRecord {
    #[serde(default)]
    pub host_fqdn: Option<String>,
    pub host_name: String,
    #[serde(default)]
    pub host_domain: Option<String>,
    pub user_sid: String,
    #[serde(default)]
    pub matched: bool,
}

/// A domain principal found in a local group on a host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalGroupRecord {
    #[serde(default)]
    pub host_fqdn: Option<String>,
    pub host_name: String,
    #[serde(default)]
    pub host_domain: Option<String>,
    pub member_sid: String,
    pub member_sid_type: String,
    pub group: String,
    #[serde(default)]
    pub matched: bool,
}

/// Holds the session/local-group records until the correlator runs.
#[derive(Debug, Default)]
pub struct LocalBroker {
    pub sessions: Vec<SessionRecord>,
    pub privileged_sessions: Vec<PrivilegedSessionRecord>,
    pub registry_sessions: Vec<RegistrySessionRecord>,
    pub local_group_memberships: Vec<LocalGroupRecord>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distribute parsed records into per-kind lists, dropping exact
    /// duplicates from overlapping captures.
    pub fn import_records(&mut self, records: Vec<LocalRecord>) {
        for record in records {
            match record {
                LocalRecord::Session(r) => {
                    if !self.sessions.contains(&r) {
                        self.sessions.push(r);
                    }
                }
                LocalRecord::PrivilegedSession(r) => {
                    if !self.privileged_sessions.contains(&r) {
                        self.privileged_sessions.push(r);
                    }
                }
                LocalRecord::RegistrySession(r) => {
                    if !self.registry_sessions.contains(&r) {
                        self.registry_sessions.push(r);
                    }
                }
                LocalRecord::LocalGroupMember(r) => {
                    if !self.local_group_memberships.contains(&r) {
                        self.local_group_memberships.push(r);
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
            && self.privileged_sessions.is_empty()
            && self.registry_sessions.is_empty()
            && self.local_group_memberships.is_empty()
    }
}

/// Parse JSON Lines content into records. Malformed lines are logged and
/// skipped, never fatal.
pub fn parse_records(content: &str) -> Vec<LocalRecord> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("skipping malformed session record: {err}");
                None
            }
        })
        .collect()
}

pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Vec<LocalRecord>> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("read {}", path.as_ref().display()))?;
    Ok(parse_records(&content))
}

enum UserLookup {
    One(String),
    Missing,
    Ambiguous,
}

fn resolve_user_sid(users: &[DirectoryObject], username: &str) -> UserLookup {
    let mut matches = users.iter().filter(|u| {
        u.prop_str("samaccountname")
            .is_some_and(|sam| sam.eq_ignore_ascii_case(username))
    });
    match (matches.next(), matches.next()) {
        (Some(user), None) => match &user.object_identifier {
            Some(sid) => UserLookup::One(sid.clone()),
            None => UserLookup::Missing,
        },
        (Some(_), Some(_)) => UserLookup::Ambiguous,
        (None, _) => UserLookup::Missing,
    }
}

fn domain_sid_for(domain: &str, maps: &IdentityMaps) -> Option<String> {
    maps.domain_map.get(&ldap::domain_to_dn(domain)).cloned()
}

fn netbios_domain_sid(netbios: &str, maps: &IdentityMaps) -> Option<String> {
    let crossref = maps.crossref_map.get(netbios)?;
    maps.domain_map.get(crossref.nc_name.as_deref()?).cloned()
}

/// Domain-scoped host match: the short host name must match the machine
/// account name AND the computer must live under the domain's identifier.
fn matches_in_domain(computer: &DirectoryObject, host: &str, domain_sid: &str) -> bool {
    computer.matches_samaccountname(host)
        && computer
            .object_identifier
            .as_deref()
            .is_some_and(|id| id.starts_with(domain_sid))
}

impl Engine {
    /// Correlate session and local-group records onto computer objects and
    /// attach the resulting edges. Matched records are flagged so a second
    /// sighting of the same session yields no further edge.
    pub fn process_local_objects(&mut self, broker: &mut LocalBroker) {
        let Engine { maps, objects, .. } = self;
        let ObjectStore {
            computers, users, ..
        } = objects;
        let maps: &IdentityMaps = maps;
        let users: &[DirectoryObject] = users;

        for computer in computers.iter_mut() {
            correlate_privileged_sessions(computer, &mut broker.privileged_sessions, users, maps);
            correlate_registry_sessions(computer, &mut broker.registry_sessions, maps);
            correlate_sessions(computer, &mut broker.sessions, users, maps);
            correlate_local_groups(computer, &mut broker.local_group_memberships, maps);
        }

        if !broker.local_group_memberships.is_empty() {
            info!("resolved local group memberships");
        }
        if !broker.sessions.is_empty()
            || !broker.privileged_sessions.is_empty()
            || !broker.registry_sessions.is_empty()
        {
            info!("resolved sessions");
        }
    }
}

fn correlate_privileged_sessions(
    computer: &mut DirectoryObject,
    sessions: &mut [PrivilegedSessionRecord],
    users: &[DirectoryObject],
    maps: &IdentityMaps,
) {
    for session in sessions.iter_mut() {
        if session.matched {
            continue;
        }
        let mut found = session
            .host_fqdn
            .as_deref()
            .is_some_and(|fqdn| computer.matches_dnshostname(fqdn));
        if !found && let Some(domain) = &session.host_domain {
            found = domain_sid_for(domain, maps)
                .is_some_and(|sid| matches_in_domain(computer, &session.host_name, &sid));
        }
        if !found {
            continue;
        }
        match resolve_user_sid(users, &session.user) {
            UserLookup::One(sid) => {
                computer.privileged_sessions.push(sid);
                session.matched = true;
            }
            UserLookup::Ambiguous => {
                warn!(
                    "multiple users with sAMAccountName {}; skipping privileged session",
                    session.user
                );
            }
            UserLookup::Missing => {
                debug!("no user found for privileged session of {}", session.user);
            }
        }
    }
}

fn correlate_registry_sessions(
    computer: &mut DirectoryObject,
    sessions: &mut [RegistrySessionRecord],
    maps: &IdentityMaps,
) {
    for session in sessions.iter_mut() {
        if session.matched {
            continue;
        }
        let found = if session
            .host_fqdn
            .as_deref()
            .is_some_and(|fqdn| computer.matches_dnshostname(fqdn))
        {
            true
        } else if let Some(domain) = &session.host_domain {
            domain_sid_for(domain, maps)
                .is_some_and(|sid| matches_in_domain(computer, &session.host_name, &sid))
        } else if computer.matches_samaccountname(&session.host_name) {
            // No domain context at all from this source; accept the bare
            // account-name match as lower confidence.
            debug!(
                "fuzzy host match for registry session on {}",
                session.host_name
            );
            true
        } else {
            false
        };
        if found {
            computer.registry_sessions.push(session.user_sid.clone());
            session.matched = true;
        }
    }
}

fn correlate_sessions(
    computer: &mut DirectoryObject,
    sessions: &mut [SessionRecord],
    users: &[DirectoryObject],
    maps: &IdentityMaps,
) {
    for session in sessions.iter_mut() {
        if session.matched {
            continue;
        }
        let mut found = false;
        if let Some(ptr) = &session.ptr_record {
            found = computer.matches_dnshostname(ptr);
            if !found && let Some(domain) = &session.computer_domain {
                found = domain_sid_for(domain, maps)
                    .is_some_and(|sid| matches_in_domain(computer, &session.computer_name, &sid));
            }
        } else if let Some(netbios) = &session.computer_netbios_domain {
            found = netbios_domain_sid(netbios, maps)
                .is_some_and(|sid| matches_in_domain(computer, &session.computer_name, &sid));
        }
        if !found {
            continue;
        }
        match resolve_user_sid(users, &session.username) {
            UserLookup::One(sid) => {
                computer.sessions.push(sid);
                session.matched = true;
            }
            UserLookup::Ambiguous => {
                warn!(
                    "multiple users with sAMAccountName {}; skipping session",
                    session.username
                );
            }
            UserLookup::Missing => {
                debug!("no user found for session of {}", session.username);
            }
        }
    }
}

fn correlate_local_groups(
    computer: &mut DirectoryObject,
    memberships: &mut [LocalGroupRecord],
    maps: &IdentityMaps,
) {
    for member in memberships.iter_mut() {
        if member.matched {
            continue;
        }
        let mut found = member
            .host_fqdn
            .as_deref()
            .is_some_and(|fqdn| computer.matches_dnshostname(fqdn));
        if !found && let Some(domain) = &member.host_domain {
            found = domain_sid_for(domain, maps)
                .is_some_and(|sid| matches_in_domain(computer, &member.host_name, &sid));
        }
        if !found {
            continue;
        }
        let reference = TypedRef::new(member.member_sid.clone(), member.member_sid_type.clone());
        let target = match member.group.to_lowercase().as_str() {
            "administrators" => &mut computer.local_admins,
            "remote desktop users" => &mut computer.remote_desktop_users,
            "distributed com users" => &mut computer.dcom_users,
            "remote management users" => &mut computer.ps_remote_users,
            other => {
                debug!("ignoring membership in unmapped local group {other}");
                continue;
            }
        };
        target.push(reference);
        member.matched = true;
    }
}
