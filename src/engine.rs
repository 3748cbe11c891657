//! Engine: owns the identity maps and typed object collections, classifies
//! raw attribute records into them, merges repeated sightings of the same
//! object, and drives the fixed-order resolver pipeline over the final
//! merged set.
//!
//! Typical usage:
//!
//! ```no_run
//! use bofhound::engine::Engine;
//! # fn main() -> anyhow::Result<()> {
//! let records = bofhound::parser::parse_file("/path/to/beacon.log")?;
//! let mut engine = Engine::new();
//! engine.import_objects(records);
//! engine.process();
//! # Ok(())
//! # }
//! ```
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use log::{debug, info};
use regex::Regex;
use serde_json::json;

use crate::ldap;
use crate::object::{AttributeRecord, DirectoryObject, EntryType};
use crate::wellknown;

/// sAMAccountType values that classify as groups.
const GROUP_ACCOUNT_TYPES: &[i64] = &[268435456, 268435457, 536870912, 536870913];
const USER_ACCOUNT_TYPE: i64 = 805306368;
const COMPUTER_ACCOUNT_TYPE: i64 = 805306369;
const TRUST_ACCOUNT_TYPE: i64 = 805306370;

/// System sub-containers excluded from the generic container class.
static POLICIES_CONTAINER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\{.*\},CN=Policies,CN=System,").unwrap());

/// A cross-reference record mapping a short (NetBIOS) domain name to the
/// naming context it refers to.
#[derive(Debug, Clone)]
pub struct CrossRef {
    pub netbios_name: String,
    pub nc_name: Option<String>,
}

/// Location of a typed object inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub kind: EntryType,
    pub index: usize,
}

/// The identity maps of the correlation context. Passive key/value indexes:
/// populated during import, consulted by every resolver stage.
#[derive(Debug, Default)]
pub struct IdentityMaps {
    /// Object identifier (SID or GUID) to object slot.
    pub sid_map: HashMap<String, Slot>,
    /// Upper-cased distinguished name to object slot.
    pub dn_map: HashMap<String, Slot>,
    /// Domain-name-component (`DC=...`) to domain identifier.
    pub domain_map: BTreeMap<String, String>,
    /// Short (NetBIOS) domain name to cross-reference record.
    pub crossref_map: HashMap<String, CrossRef>,
    /// Lower-cased schema name to type GUID.
    pub schema_map: BTreeMap<String, String>,
}

/// Typed object collections, one per entry type that reaches the output.
#[derive(Debug, Default)]
pub struct ObjectStore {
    pub users: Vec<DirectoryObject>,
    pub computers: Vec<DirectoryObject>,
    pub groups: Vec<DirectoryObject>,
    pub domains: Vec<DirectoryObject>,
    pub ous: Vec<DirectoryObject>,
    pub containers: Vec<DirectoryObject>,
    pub gpos: Vec<DirectoryObject>,
    pub enterprise_cas: Vec<DirectoryObject>,
    pub aia_cas: Vec<DirectoryObject>,
    pub root_cas: Vec<DirectoryObject>,
    pub ntauth_stores: Vec<DirectoryObject>,
    pub issuance_policies: Vec<DirectoryObject>,
    pub cert_templates: Vec<DirectoryObject>,
    pub trusts: Vec<DirectoryObject>,
}

impl ObjectStore {
    pub fn collection(&self, kind: EntryType) -> Option<&Vec<DirectoryObject>> {
        match kind {
            EntryType::User => Some(&self.users),
            EntryType::Computer => Some(&self.computers),
            EntryType::Group => Some(&self.groups),
            EntryType::Domain => Some(&self.domains),
            EntryType::Ou => Some(&self.ous),
            EntryType::Container => Some(&self.containers),
            EntryType::Gpo => Some(&self.gpos),
            EntryType::EnterpriseCa => Some(&self.enterprise_cas),
            EntryType::AiaCa => Some(&self.aia_cas),
            EntryType::RootCa => Some(&self.root_cas),
            EntryType::NtAuthStore => Some(&self.ntauth_stores),
            EntryType::IssuancePolicy => Some(&self.issuance_policies),
            EntryType::CertTemplate => Some(&self.cert_templates),
            EntryType::Trust => Some(&self.trusts),
            EntryType::Unknown => None,
        }
    }

    pub fn collection_mut(&mut self, kind: EntryType) -> Option<&mut Vec<DirectoryObject>> {
        match kind {
            EntryType::User => Some(&mut self.users),
            EntryType::Computer => Some(&mut self.computers),
            EntryType::Group => Some(&mut self.groups),
            EntryType::Domain => Some(&mut self.domains),
            EntryType::Ou => Some(&mut self.ous),
            EntryType::Container => Some(&mut self.containers),
            EntryType::Gpo => Some(&mut self.gpos),
            EntryType::EnterpriseCa => Some(&mut self.enterprise_cas),
            EntryType::AiaCa => Some(&mut self.aia_cas),
            EntryType::RootCa => Some(&mut self.root_cas),
            EntryType::NtAuthStore => Some(&mut self.ntauth_stores),
            EntryType::IssuancePolicy => Some(&mut self.issuance_policies),
            EntryType::CertTemplate => Some(&mut self.cert_templates),
            EntryType::Trust => Some(&mut self.trusts),
            EntryType::Unknown => None,
        }
    }

    pub fn get(&self, slot: Slot) -> Option<&DirectoryObject> {
        self.collection(slot.kind)?.get(slot.index)
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut DirectoryObject> {
        self.collection_mut(slot.kind)?.get_mut(slot.index)
    }

    /// Every object the resolver pipeline enriches, in a fixed collection
    /// order. Trusts are excluded: they are resolved onto domains instead.
    pub fn iter_processable(&self) -> impl Iterator<Item = &DirectoryObject> {
        self.users
            .iter()
            .chain(&self.computers)
            .chain(&self.groups)
            .chain(&self.domains)
            .chain(&self.ous)
            .chain(&self.containers)
            .chain(&self.gpos)
            .chain(&self.enterprise_cas)
            .chain(&self.aia_cas)
            .chain(&self.root_cas)
            .chain(&self.ntauth_stores)
            .chain(&self.issuance_policies)
            .chain(&self.cert_templates)
    }

    pub fn iter_processable_mut(&mut self) -> impl Iterator<Item = &mut DirectoryObject> {
        self.users
            .iter_mut()
            .chain(&mut self.computers)
            .chain(&mut self.groups)
            .chain(&mut self.domains)
            .chain(&mut self.ous)
            .chain(&mut self.containers)
            .chain(&mut self.gpos)
            .chain(&mut self.enterprise_cas)
            .chain(&mut self.aia_cas)
            .chain(&mut self.root_cas)
            .chain(&mut self.ntauth_stores)
            .chain(&mut self.issuance_policies)
            .chain(&mut self.cert_templates)
    }
}

/// Aggregates the correlation context and exposes import and processing.
#[derive(Debug, Default)]
pub struct Engine {
    pub maps: IdentityMaps,
    pub objects: ObjectStore,
    /// Records classified as trust accounts; retained but never typed.
    pub trust_accounts: Vec<AttributeRecord>,
    /// Unclassifiable records, retained for containment lookups.
    pub unknown: Vec<AttributeRecord>,
    pub schema_count: usize,
}

enum Classified {
    Typed(EntryType),
    /// Recovered through the well-known principal tables; carries the
    /// display name to apply.
    WellKnown(EntryType, &'static str),
    TrustAccount,
    Unknown,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and import a batch of raw attribute records, merging
    /// repeated sightings. Nothing here is fatal: every unrecognized shape
    /// degrades to the unknown bucket.
    pub fn import_objects(&mut self, records: Vec<AttributeRecord>) {
        for record in records {
            self.import_record(record);
        }
    }

    fn import_record(&mut self, record: AttributeRecord) {
        // Schema records sidestep the usual required attributes and never
        // enter the typed graph.
        if record.contains_key("schemaidguid") {
            self.import_schema(&record);
            return;
        }
        let object_class = record.get("objectclass").map(String::as_str).unwrap_or("");
        if object_class.contains("top, crossRef") {
            self.import_crossref(&record);
            return;
        }

        let account_type = match record.get("samaccounttype") {
            None => 0,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(v) => v,
                Err(_) => {
                    self.unknown.push(record);
                    return;
                }
            },
        };

        let Some(dn) = record.get("distinguishedname").cloned() else {
            self.unknown.push(record);
            return;
        };
        if !record.contains_key("objectsid") && !record.contains_key("objectguid") {
            self.unknown.push(record);
            return;
        }

        let classified = classify(account_type, &record, &dn);
        let incoming = match &classified {
            Classified::Typed(kind) => Some(DirectoryObject::from_record(*kind, &record)),
            Classified::WellKnown(kind, name) => {
                let mut obj = DirectoryObject::from_record(*kind, &record);
                obj.set_prop("name", json!(name.to_uppercase()));
                Some(obj)
            }
            Classified::TrustAccount | Classified::Unknown => None,
        };

        let existing = self
            .maps
            .dn_map
            .get(&dn.to_uppercase())
            .or_else(|| record.get("objectsid").and_then(|sid| self.maps.sid_map.get(sid)))
            .copied();

        match (existing, incoming) {
            (Some(slot), incoming) => {
                // Repeated sighting. The original classification stands even
                // when the new record implies another type; attributes merge
                // regardless.
                let incoming = incoming.unwrap_or_else(|| generic_sighting(&record));
                if let Some(obj) = self.objects.get_mut(slot) {
                    obj.absorb(incoming);
                    if let Some(id) = obj.object_identifier.clone() {
                        self.maps.sid_map.entry(id).or_insert(slot);
                    }
                }
            }
            (None, Some(obj)) => self.insert_object(obj),
            (None, None) => match classified {
                Classified::TrustAccount => self.trust_accounts.push(record),
                _ => self.unknown.push(record),
            },
        }
    }

    fn import_schema(&mut self, record: &AttributeRecord) {
        let (Some(name), Some(guid)) = (record.get("name"), record.get("schemaidguid")) else {
            return;
        };
        self.schema_count += 1;
        self.maps
            .schema_map
            .entry(name.to_lowercase())
            .or_insert_with(|| guid.to_lowercase());
    }

    fn import_crossref(&mut self, record: &AttributeRecord) {
        let Some(netbios) = record.get("netbiosname") else {
            return;
        };
        self.maps
            .crossref_map
            .entry(netbios.clone())
            .or_insert_with(|| CrossRef {
                netbios_name: netbios.clone(),
                nc_name: record.get("ncname").map(|nc| nc.to_uppercase()),
            });
    }

    fn insert_object(&mut self, obj: DirectoryObject) {
        let kind = obj.entry_type();
        if kind == EntryType::Domain
            && let (Some(id), Some(dn)) = (&obj.object_identifier, obj.dn())
            && let Some(dc) = ldap::domain_component(dn)
        {
            self.maps
                .domain_map
                .entry(dc.to_string())
                .or_insert_with(|| id.clone());
        }

        let Some(collection) = self.objects.collection_mut(kind) else {
            return;
        };
        collection.push(obj);
        let slot = Slot {
            kind,
            index: collection.len() - 1,
        };

        // Trusts carry no identifier and resolve onto domains; they stay
        // out of the identity maps.
        if kind == EntryType::Trust {
            return;
        }
        let Some(inserted) = self.objects.get(slot) else {
            return;
        };
        let id = inserted.object_identifier.clone();
        let dn = inserted.dn().map(str::to_string);
        debug!(
            "imported {} {}",
            kind.as_str(),
            inserted.prop_str("name").unwrap_or("(unnamed)")
        );
        if let Some(id) = id {
            self.maps.sid_map.insert(id, slot);
        }
        if let Some(dn) = dn {
            self.maps.dn_map.insert(dn, slot);
        }
    }

    /// Run the resolver pipeline over the fully imported object set. Stage
    /// order is a hard sequencing requirement: each stage assumes the
    /// previous one's invariants hold globally.
    pub fn process(&mut self) {
        self.recalculate_identifiers();
        self.calculate_containment();
        self.attach_domain_sids();
        let edge_count = self.decode_acls();
        info!("decoded {edge_count} ACL relationships");
        self.synthesize_default_principals();
        self.resolve_group_members();
        self.resolve_delegation_targets();
        self.resolve_ou_members();
        self.link_gpos();
        self.resolve_domain_trusts();
        self.build_certificate_chains();
        self.resolve_published_templates();
    }
}

/// Base normalization applied when a repeated sighting cannot be
/// reclassified: common properties only, keeping the established type.
fn generic_sighting(record: &AttributeRecord) -> DirectoryObject {
    DirectoryObject::from_record(EntryType::Unknown, record)
}

/// The ordered classification cascade. Later rules assume earlier ones did
/// not match; the order is a contract, covered by tests.
fn classify(account_type: i64, record: &AttributeRecord, dn: &str) -> Classified {
    if GROUP_ACCOUNT_TYPES.contains(&account_type) {
        return Classified::Typed(EntryType::Group);
    }
    // Managed service accounts surface their group membership attribute
    // instead of a user account type.
    let has_msa_membership = record
        .get("msds-groupmsamembership")
        .is_some_and(|v| !v.is_empty());
    if has_msa_membership || account_type == USER_ACCOUNT_TYPE {
        return Classified::Typed(EntryType::User);
    }
    if account_type == COMPUTER_ACCOUNT_TYPE {
        return Classified::Typed(EntryType::Computer);
    }
    if account_type == TRUST_ACCOUNT_TYPE {
        return Classified::TrustAccount;
    }

    let object_class = record.get("objectclass").map(String::as_str).unwrap_or("");
    let dn_upper = dn.to_uppercase();
    if object_class.contains("top, domain") {
        if record.contains_key("objectsid") {
            return Classified::Typed(EntryType::Domain);
        }
        return Classified::Unknown;
    }
    if object_class.contains("trustedDomain") {
        return Classified::Typed(EntryType::Trust);
    }
    if object_class.contains("top, organizationalUnit") {
        return Classified::Typed(EntryType::Ou);
    }
    if object_class.contains("container, groupPolicyContainer") {
        return Classified::Typed(EntryType::Gpo);
    }
    if object_class.contains("top, certificationAuthority") {
        if dn_upper.contains("CN=AIA,") {
            return Classified::Typed(EntryType::AiaCa);
        }
        if dn_upper.contains("CN=CERTIFICATION AUTHORITIES,") {
            return Classified::Typed(EntryType::RootCa);
        }
        if dn_upper
            .starts_with("CN=NTAUTHCERTIFICATES,CN=PUBLIC KEY SERVICES,CN=SERVICES,CN=CONFIGURATION,")
        {
            return Classified::Typed(EntryType::NtAuthStore);
        }
        return Classified::Unknown;
    }
    if object_class.contains("top, msPKI-Enterprise-Oid") {
        if record.get("flags").map(String::as_str) == Some("2") {
            return Classified::Typed(EntryType::IssuancePolicy);
        }
        return Classified::Unknown;
    }
    if object_class.contains("top, pKIEnrollmentService") {
        return Classified::Typed(EntryType::EnterpriseCa);
    }
    if object_class.contains("top, pKICertificateTemplate") {
        return Classified::Typed(EntryType::CertTemplate);
    }
    if object_class.contains("top, container") {
        if !POLICIES_CONTAINER_RE.is_match(dn)
            && !dn_upper.contains("CN=OPERATIONS,CN=DOMAINUPDATES,CN=SYSTEM")
        {
            return Classified::Typed(EntryType::Container);
        }
        return Classified::Unknown;
    }

    // Some well-known principals come back without an account type at all;
    // their name or common name recovers the type.
    for key in ["name", "cn"] {
        if let Some(name) = record.get(key)
            && let Some((_, wk_name, kind)) = wellknown::WELLKNOWN_SIDS
                .iter()
                .find(|(_, n, _)| *n == name.as_str())
        {
            let entry_type = match *kind {
                "Computer" => EntryType::Computer,
                "Group" => EntryType::Group,
                _ => EntryType::User,
            };
            return Classified::WellKnown(entry_type, wk_name);
        }
    }

    Classified::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> AttributeRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn user_record(sam: &str, sid: &str) -> AttributeRecord {
        let dn = format!("CN={sam},CN=Users,DC=ad,DC=local");
        record(&[
            ("distinguishedname", dn.as_str()),
            ("objectsid", sid),
            ("samaccountname", sam),
            ("samaccounttype", "805306368"),
        ])
    }

    #[test]
    fn classification_cascade_orders_rules() {
        let mut e = Engine::new();
        e.import_objects(vec![
            user_record("bob", "S-1-5-21-1-2-3-1104"),
            record(&[
                ("distinguishedname", "CN=WS01,CN=Computers,DC=ad,DC=local"),
                ("objectsid", "S-1-5-21-1-2-3-1105"),
                ("samaccounttype", "805306369"),
            ]),
            record(&[
                ("distinguishedname", "CN=Ops,OU=Groups,DC=ad,DC=local"),
                ("objectsid", "S-1-5-21-1-2-3-2000"),
                ("samaccounttype", "268435456"),
            ]),
            record(&[
                ("distinguishedname", "DC=ad,DC=local"),
                ("objectsid", "S-1-5-21-1-2-3"),
                ("objectclass", "top, domain, domainDNS"),
            ]),
            record(&[
                ("distinguishedname", "OU=Workstations,DC=ad,DC=local"),
                ("objectguid", "aaaa-bbbb"),
                ("objectclass", "top, organizationalUnit"),
            ]),
        ]);
        assert_eq!(e.objects.users.len(), 1);
        assert_eq!(e.objects.computers.len(), 1);
        assert_eq!(e.objects.groups.len(), 1);
        assert_eq!(e.objects.domains.len(), 1);
        assert_eq!(e.objects.ous.len(), 1);
        assert_eq!(
            e.maps.domain_map.get("DC=AD,DC=LOCAL").map(String::as_str),
            Some("S-1-5-21-1-2-3")
        );
    }

    #[test]
    fn msa_membership_classifies_as_user_despite_account_type() {
        let mut e = Engine::new();
        e.import_objects(vec![record(&[
            ("distinguishedname", "CN=svc,CN=Managed,DC=ad,DC=local"),
            ("objectsid", "S-1-5-21-1-2-3-1200"),
            ("samaccounttype", "805306369"),
            ("msds-groupmsamembership", "AQID"),
        ])]);
        assert_eq!(e.objects.users.len(), 1);
        assert!(e.objects.computers.is_empty());
    }

    #[test]
    fn unparsable_account_type_and_missing_identity_go_unknown() {
        let mut e = Engine::new();
        e.import_objects(vec![
            record(&[
                ("distinguishedname", "CN=Broken,DC=ad,DC=local"),
                ("samaccounttype", "not-a-number"),
            ]),
            record(&[("samaccounttype", "805306368"), ("objectsid", "S-1-5-21-0")]),
            record(&[
                ("distinguishedname", "CN=NoSid,DC=ad,DC=local"),
                ("samaccounttype", "805306368"),
            ]),
        ]);
        assert_eq!(e.unknown.len(), 3);
        assert!(e.objects.users.is_empty());
    }

    #[test]
    fn repeated_sightings_merge_instead_of_duplicating() {
        let mut e = Engine::new();
        let mut second = user_record("bob", "S-1-5-21-1-2-3-1104");
        second.insert("description".to_string(), "helpdesk".to_string());
        second.remove("samaccountname");
        e.import_objects(vec![user_record("bob", "S-1-5-21-1-2-3-1104"), second]);
        assert_eq!(e.objects.users.len(), 1);
        let bob = &e.objects.users[0];
        assert_eq!(bob.prop_str("samaccountname"), Some("bob"));
        assert_eq!(bob.prop_str("description"), Some("helpdesk"));
    }

    #[test]
    fn reclassification_mismatch_merges_attributes_and_keeps_type() {
        let mut e = Engine::new();
        e.import_objects(vec![user_record("bob", "S-1-5-21-1-2-3-1104")]);
        e.import_objects(vec![record(&[
            ("distinguishedname", "CN=bob,CN=Users,DC=ad,DC=local"),
            ("objectsid", "S-1-5-21-1-2-3-1104"),
            ("samaccounttype", "805306369"),
            ("operatingsystem", "Windows 11"),
        ])]);
        assert_eq!(e.objects.users.len(), 1);
        assert!(e.objects.computers.is_empty());
        assert_eq!(
            e.objects.users[0].prop_str("operatingsystem"),
            Some("Windows 11")
        );
    }

    #[test]
    fn schema_and_crossref_records_populate_maps_first_writer_wins() {
        let mut e = Engine::new();
        e.import_objects(vec![
            record(&[
                ("name", "User"),
                ("schemaidguid", "BF967ABA-0DE6-11D0-A285-00AA003049E2"),
            ]),
            record(&[
                ("name", "user"),
                ("schemaidguid", "99999999-0000-0000-0000-000000000000"),
            ]),
            record(&[
                ("objectclass", "top, crossRef"),
                ("netbiosname", "AD"),
                ("ncname", "DC=ad,DC=local"),
            ]),
        ]);
        assert_eq!(e.schema_count, 2);
        assert_eq!(
            e.maps.schema_map.get("user").map(String::as_str),
            Some("bf967aba-0de6-11d0-a285-00aa003049e2")
        );
        let crossref = e.maps.crossref_map.get("AD").unwrap();
        assert_eq!(crossref.nc_name.as_deref(), Some("DC=AD,DC=LOCAL"));
    }

    #[test]
    fn policies_and_domainupdates_containers_are_excluded() {
        let mut e = Engine::new();
        e.import_objects(vec![
            record(&[
                (
                    "distinguishedname",
                    "CN={31B2F340-016D-11D2-945F-00C04FB984F9},CN=Policies,CN=System,DC=ad,DC=local",
                ),
                ("objectguid", "1111"),
                ("objectclass", "top, container"),
            ]),
            record(&[
                ("distinguishedname", "CN=Users,DC=ad,DC=local"),
                ("objectguid", "2222"),
                ("objectclass", "top, container"),
            ]),
        ]);
        assert_eq!(e.objects.containers.len(), 1);
        assert_eq!(e.unknown.len(), 1);
    }

    #[test]
    fn wellknown_name_recovers_type_without_account_type() {
        let mut e = Engine::new();
        e.import_objects(vec![record(&[
            (
                "distinguishedname",
                "CN=S-1-1-0,CN=ForeignSecurityPrincipals,DC=ad,DC=local",
            ),
            ("objectsid", "S-1-1-0"),
            ("name", "Everyone"),
        ])]);
        assert_eq!(e.objects.groups.len(), 1);
        assert_eq!(e.objects.groups[0].prop_str("name"), Some("EVERYONE"));
    }
}
