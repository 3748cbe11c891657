//! Directory object data model: the base entity shared by every entry
//! type, per-type normalization from raw attribute records, and the merge
//! applied when the same object is sighted more than once.
//!
//! Attribute records are sparse. An absent key means "not captured", so
//! normalization only sets a property when the source attribute is present
//! and merge only overwrites fields the incoming sighting carries.
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Value, json};

use crate::ldap;

/// One raw attribute record as produced by the log-parsing collaborator:
/// lower-cased attribute names, multi-valued attributes pre-joined with
/// `", "`.
pub type AttributeRecord = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    User,
    Computer,
    Group,
    Domain,
    Ou,
    Container,
    Gpo,
    Trust,
    RootCa,
    AiaCa,
    EnterpriseCa,
    NtAuthStore,
    CertTemplate,
    IssuancePolicy,
    Unknown,
}

impl EntryType {
    /// Display form used for `PrincipalType`/`ObjectType` fields in the
    /// output contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::User => "User",
            EntryType::Computer => "Computer",
            EntryType::Group => "Group",
            EntryType::Domain => "Domain",
            EntryType::Ou => "OU",
            EntryType::Container => "Container",
            EntryType::Gpo => "GPO",
            EntryType::Trust => "Trust",
            EntryType::RootCa => "RootCA",
            EntryType::AiaCa => "AIACA",
            EntryType::EnterpriseCa => "EnterpriseCA",
            EntryType::NtAuthStore => "NTAuthStore",
            EntryType::CertTemplate => "CertTemplate",
            EntryType::IssuancePolicy => "IssuancePolicy",
            EntryType::Unknown => "Unknown",
        }
    }

    /// Key used against the schema-derived GUID table when checking ACE
    /// applicability. Types without a schema class simply miss the table.
    pub fn schema_key(&self) -> String {
        self.as_str().to_lowercase()
    }
}

/// One permission edge attached to an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ace {
    #[serde(rename = "PrincipalSID")]
    pub principal_sid: String,
    #[serde(rename = "PrincipalType")]
    pub principal_type: String,
    #[serde(rename = "RightName")]
    pub right_name: String,
    #[serde(rename = "IsInherited")]
    pub is_inherited: bool,
}

/// A typed reference to another object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypedRef {
    #[serde(rename = "ObjectIdentifier")]
    pub object_identifier: String,
    #[serde(rename = "ObjectType")]
    pub object_type: String,
}

impl TypedRef {
    pub fn new(object_identifier: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            object_identifier: object_identifier.into(),
            object_type: object_type.into(),
        }
    }
}

/// A resolved GPO link on an OU or domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpoLink {
    #[serde(rename = "IsEnforced")]
    pub is_enforced: bool,
    #[serde(rename = "GUID")]
    pub guid: String,
}

/// A delegation target: resolved to a known object, or kept as a bare
/// FQDN when only the hostname form is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DelegationTarget {
    Resolved(TypedRef),
    Host(String),
}

/// Trust relationship data carried by a trust object and attached to the
/// origin domain once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustProperties {
    #[serde(rename = "TargetDomainName")]
    pub target_domain_name: String,
    #[serde(rename = "TargetDomainSid")]
    pub target_domain_sid: Option<String>,
    #[serde(rename = "TrustDirection")]
    pub trust_direction: i64,
    #[serde(rename = "TrustType")]
    pub trust_type: String,
    #[serde(rename = "IsTransitive")]
    pub is_transitive: bool,
    #[serde(rename = "SidFilteringEnabled")]
    pub sid_filtering_enabled: bool,
}

/// The base directory entity. Extension fields are only meaningful for the
/// entry types that use them and stay empty elsewhere.
#[derive(Debug, Clone, Default)]
pub struct DirectoryObject {
    pub entry_type: Option<EntryType>,
    pub object_identifier: Option<String>,
    pub properties: BTreeMap<String, Value>,
    pub aces: Vec<Ace>,
    pub contained_by: Option<TypedRef>,
    pub is_acl_protected: bool,
    /// Base64-encoded security descriptor, decoded by the ACL stage.
    pub raw_security_descriptor: Option<String>,

    pub primary_group_sid: Option<String>,
    pub member_dns: Vec<String>,
    pub member_of_dns: Vec<String>,
    pub allowed_to_delegate_raw: Vec<String>,
    pub allowed_to_delegate: Vec<DelegationTarget>,
    pub members: Vec<TypedRef>,
    pub child_objects: Vec<TypedRef>,
    pub affected_users: Vec<TypedRef>,
    pub affected_computers: Vec<TypedRef>,
    /// (link DN upper-cased, enforced) pairs parsed from gPLink.
    pub gplink_dns: Vec<(String, bool)>,
    pub gpo_links: Vec<GpoLink>,
    pub trusts: Vec<TrustProperties>,
    pub trust_properties: Option<TrustProperties>,
    /// Domain component of a trust object's own DN.
    pub local_domain_dn: Option<String>,
    pub published_templates: Vec<String>,
    pub enabled_templates: Vec<TypedRef>,

    pub sessions: Vec<String>,
    pub privileged_sessions: Vec<String>,
    pub registry_sessions: Vec<String>,
    pub local_admins: Vec<TypedRef>,
    pub remote_desktop_users: Vec<TypedRef>,
    pub dcom_users: Vec<TypedRef>,
    pub ps_remote_users: Vec<TypedRef>,
}

impl DirectoryObject {
    pub fn entry_type(&self) -> EntryType {
        self.entry_type.unwrap_or(EntryType::Unknown)
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn dn(&self) -> Option<&str> {
        self.prop_str("distinguishedname")
    }

    pub fn set_prop(&mut self, key: &str, value: Value) {
        self.properties.insert(key.to_string(), value);
    }

    /// Exact case-insensitive match against the captured dNSHostName.
    pub fn matches_dnshostname(&self, fqdn: &str) -> bool {
        self.prop_str("dnshostname")
            .is_some_and(|own| own.eq_ignore_ascii_case(fqdn))
    }

    /// Match a bare host name against the machine account name
    /// (`host` + `$`), case-insensitively.
    pub fn matches_samaccountname(&self, host: &str) -> bool {
        let account = format!("{host}$");
        self.prop_str("samaccountname")
            .is_some_and(|own| own.eq_ignore_ascii_case(&account))
    }

    /// Merge a later sighting of the same object into this one. Property
    /// values from the incoming record overwrite, but a field the incoming
    /// sighting did not capture is left untouched. Idempotent.
    pub fn absorb(&mut self, incoming: DirectoryObject) {
        for (key, value) in incoming.properties {
            self.properties.insert(key, value);
        }
        if incoming.object_identifier.is_some() {
            self.object_identifier = incoming.object_identifier;
        }
        if incoming.raw_security_descriptor.is_some() {
            self.raw_security_descriptor = incoming.raw_security_descriptor;
        }
        if incoming.primary_group_sid.is_some() {
            self.primary_group_sid = incoming.primary_group_sid;
        }
        if incoming.trust_properties.is_some() {
            self.trust_properties = incoming.trust_properties;
            self.local_domain_dn = incoming.local_domain_dn;
        }
        if !incoming.member_dns.is_empty() {
            self.member_dns = incoming.member_dns;
        }
        if !incoming.member_of_dns.is_empty() {
            self.member_of_dns = incoming.member_of_dns;
        }
        if !incoming.allowed_to_delegate_raw.is_empty() {
            self.allowed_to_delegate_raw = incoming.allowed_to_delegate_raw;
        }
        if !incoming.gplink_dns.is_empty() {
            self.gplink_dns = incoming.gplink_dns;
        }
        if !incoming.published_templates.is_empty() {
            self.published_templates = incoming.published_templates;
        }
    }

    /// Normalize a raw attribute record into a typed object. The caller has
    /// already classified the record and verified it carries a DN plus an
    /// identifier (SID or GUID).
    pub fn from_record(entry_type: EntryType, record: &AttributeRecord) -> DirectoryObject {
        let mut obj = DirectoryObject {
            entry_type: Some(entry_type),
            ..Default::default()
        };

        let dn = record
            .get("distinguishedname")
            .map(|d| d.to_uppercase())
            .unwrap_or_default();
        let domain = ldap::dn_to_domain(&dn).to_uppercase();
        obj.set_prop("distinguishedname", json!(dn));
        if !domain.is_empty() {
            obj.set_prop("domain", json!(domain));
        }

        obj.object_identifier = record
            .get("objectsid")
            .cloned()
            .or_else(|| record.get("objectguid").map(|g| g.to_uppercase()));

        if let Some(sd) = record.get("ntsecuritydescriptor") {
            obj.raw_security_descriptor = Some(sd.clone());
        }
        if let Some(created) = record.get("whencreated")
            && let Some(epoch) = ldap::generalized_time_to_unix(created)
        {
            obj.set_prop("whencreated", json!(epoch));
        }
        if let Some(desc) = record.get("description") {
            obj.set_prop("description", json!(desc));
        }

        if let Some(name) = display_name(entry_type, record, &domain) {
            obj.set_prop("name", json!(name));
        }

        match entry_type {
            EntryType::User => normalize_account(&mut obj, record, false),
            EntryType::Computer => normalize_account(&mut obj, record, true),
            EntryType::Group => normalize_group(&mut obj, record),
            EntryType::Domain => normalize_domain(&mut obj, record),
            EntryType::Ou => normalize_ou(&mut obj, record),
            EntryType::Gpo => normalize_gpo(&mut obj, record),
            EntryType::Trust => normalize_trust(&mut obj, record, &dn),
            EntryType::EnterpriseCa => normalize_enterprise_ca(&mut obj, record),
            EntryType::RootCa | EntryType::AiaCa | EntryType::NtAuthStore => {
                normalize_certificate(&mut obj, record)
            }
            EntryType::CertTemplate => normalize_cert_template(&mut obj, record),
            EntryType::IssuancePolicy => {
                copy_string_props(&mut obj, record, &["displayname", "mspki-cert-template-oid"]);
            }
            EntryType::Container | EntryType::Unknown => {}
        }

        obj
    }

    /// Render the object in the downstream graph format. Shared fields are
    /// emitted for every type; list fields only where the type carries them.
    pub fn to_value(&self) -> Value {
        let mut props = self.properties.clone();
        props.insert("isaclprotected".to_string(), json!(self.is_acl_protected));

        let mut out = serde_json::Map::new();
        out.insert(
            "ObjectIdentifier".to_string(),
            json!(self.object_identifier.clone().unwrap_or_default()),
        );
        out.insert("Properties".to_string(), json!(props));
        out.insert("Aces".to_string(), json!(self.aces));
        out.insert("ContainedBy".to_string(), json!(self.contained_by));
        out.insert("IsACLProtected".to_string(), json!(self.is_acl_protected));
        out.insert("IsDeleted".to_string(), json!(false));

        match self.entry_type() {
            EntryType::User => {
                out.insert("PrimaryGroupSID".to_string(), json!(self.primary_group_sid));
                out.insert("AllowedToDelegate".to_string(), json!(self.allowed_to_delegate));
                out.insert("SPNTargets".to_string(), json!([]));
                out.insert("HasSIDHistory".to_string(), json!([]));
            }
            EntryType::Computer => {
                out.insert("PrimaryGroupSID".to_string(), json!(self.primary_group_sid));
                out.insert("AllowedToDelegate".to_string(), json!(self.allowed_to_delegate));
                out.insert("Sessions".to_string(), session_list(&self.sessions));
                out.insert(
                    "PrivilegedSessions".to_string(),
                    session_list(&self.privileged_sessions),
                );
                out.insert(
                    "RegistrySessions".to_string(),
                    session_list(&self.registry_sessions),
                );
                out.insert("LocalAdmins".to_string(), member_list(&self.local_admins));
                out.insert(
                    "RemoteDesktopUsers".to_string(),
                    member_list(&self.remote_desktop_users),
                );
                out.insert("DcomUsers".to_string(), member_list(&self.dcom_users));
                out.insert("PSRemoteUsers".to_string(), member_list(&self.ps_remote_users));
            }
            EntryType::Group => {
                out.insert("Members".to_string(), json!(self.members));
            }
            EntryType::Domain => {
                out.insert("ChildObjects".to_string(), json!(self.child_objects));
                out.insert("AffectedUsers".to_string(), json!(self.affected_users));
                out.insert("AffectedComputers".to_string(), json!(self.affected_computers));
                out.insert("GPLinks".to_string(), json!(self.gpo_links));
                out.insert("Trusts".to_string(), json!(self.trusts));
            }
            EntryType::Ou => {
                out.insert("ChildObjects".to_string(), json!(self.child_objects));
                out.insert("AffectedUsers".to_string(), json!(self.affected_users));
                out.insert("AffectedComputers".to_string(), json!(self.affected_computers));
                out.insert("GPLinks".to_string(), json!(self.gpo_links));
            }
            EntryType::Container => {
                out.insert("ChildObjects".to_string(), json!(self.child_objects));
            }
            EntryType::EnterpriseCa => {
                out.insert(
                    "EnabledCertTemplates".to_string(),
                    json!(self.enabled_templates),
                );
            }
            _ => {}
        }

        Value::Object(out)
    }
}

fn session_list(sids: &[String]) -> Value {
    let results: Vec<Value> = sids.iter().map(|sid| json!({ "UserSID": sid })).collect();
    json!({ "Collected": true, "FailureReason": null, "Results": results })
}

fn member_list(members: &[TypedRef]) -> Value {
    json!({ "Collected": true, "FailureReason": null, "Results": members })
}

/// Upper-cased display name in the convention the graph consumer expects:
/// accounts and groups as `SAM@DOMAIN`, computers by DNS host name, domains
/// by their own name, everything else as `CN@DOMAIN`. Returns `None` when
/// the record carries no name-bearing attribute, so a partial sighting
/// cannot clobber an established name on merge.
fn display_name(entry_type: EntryType, record: &AttributeRecord, domain: &str) -> Option<String> {
    let at = |keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|k| record.get(*k)).cloned()
    };
    let qualified = |local: String| -> String {
        if domain.is_empty() {
            local.to_uppercase()
        } else {
            format!("{local}@{domain}").to_uppercase()
        }
    };
    match entry_type {
        EntryType::User | EntryType::Group => {
            at(&["samaccountname", "cn", "name"]).map(qualified)
        }
        EntryType::Computer => match record.get("dnshostname") {
            Some(fqdn) => Some(fqdn.to_uppercase()),
            // Reconstruct the FQDN form from the machine account name.
            None => at(&["samaccountname"])
                .map(|sam| sam.trim_end_matches('$').to_string())
                .or_else(|| at(&["cn", "name"]))
                .map(|local| {
                    if domain.is_empty() {
                        local.to_uppercase()
                    } else {
                        format!("{local}.{domain}").to_uppercase()
                    }
                }),
        },
        EntryType::Domain => (!domain.is_empty()).then(|| domain.to_string()),
        EntryType::Trust => at(&["trustpartner", "cn", "name"]).map(|n| n.to_uppercase()),
        EntryType::Ou => at(&["ou", "name", "cn"]).map(qualified),
        _ => at(&["displayname", "cn", "name"]).map(qualified),
    }
}

fn copy_string_props(obj: &mut DirectoryObject, record: &AttributeRecord, keys: &[&str]) {
    for key in keys {
        if let Some(value) = record.get(*key) {
            obj.set_prop(key, json!(value));
        }
    }
}

fn normalize_account(obj: &mut DirectoryObject, record: &AttributeRecord, is_computer: bool) {
    copy_string_props(obj, record, &["samaccountname", "displayname", "title", "homedirectory"]);
    if let Some(mail) = record.get("mail") {
        obj.set_prop("email", json!(mail));
    }
    if let Some(admincount) = record.get("admincount") {
        obj.set_prop("admincount", json!(admincount.trim() == "1"));
    }
    if let Some(uac) = record.get("useraccountcontrol").and_then(|v| v.parse::<i64>().ok()) {
        obj.set_prop("enabled", json!(uac & 0x0002 == 0));
        obj.set_prop("passwordnotreqd", json!(uac & 0x0020 != 0));
        obj.set_prop("pwdneverexpires", json!(uac & 0x0001_0000 != 0));
        obj.set_prop("unconstraineddelegation", json!(uac & 0x0008_0000 != 0));
        obj.set_prop("sensitive", json!(uac & 0x0010_0000 != 0));
        obj.set_prop("dontreqpreauth", json!(uac & 0x0040_0000 != 0));
        obj.set_prop("trustedtoauth", json!(uac & 0x0100_0000 != 0));
    }
    for key in ["lastlogon", "lastlogontimestamp", "pwdlastset"] {
        if let Some(ts) = record.get(key).and_then(|v| v.parse::<i64>().ok()) {
            obj.set_prop(key, json!(ldap::win_timestamp_to_unix(ts)));
        }
    }
    if let Some(spns) = record.get("serviceprincipalname") {
        let values: Vec<&str> = spns.split(", ").filter(|s| !s.is_empty()).collect();
        obj.set_prop("hasspn", json!(!values.is_empty()));
        obj.set_prop("serviceprincipalnames", json!(values));
    }
    if let (Some(rid), Some(sid)) = (record.get("primarygroupid"), record.get("objectsid")) {
        obj.primary_group_sid = Some(format!("{}-{}", ldap::sid_domain_part(sid), rid.trim()));
    }
    if let Some(targets) = record.get("msds-allowedtodelegateto") {
        obj.allowed_to_delegate_raw = targets
            .split(", ")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(member_of) = record.get("memberof") {
        obj.member_of_dns = ldap::parse_dn_list(member_of);
    }
    if is_computer {
        copy_string_props(obj, record, &["operatingsystem"]);
        if let Some(fqdn) = record.get("dnshostname") {
            obj.set_prop("dnshostname", json!(fqdn));
        }
        obj.set_prop("haslaps", json!(record.contains_key("ms-mcs-admpwdexpirationtime")));
    }
}

fn normalize_group(obj: &mut DirectoryObject, record: &AttributeRecord) {
    copy_string_props(obj, record, &["samaccountname"]);
    if let Some(admincount) = record.get("admincount") {
        obj.set_prop("admincount", json!(admincount.trim() == "1"));
    }
    if let Some(members) = record.get("member") {
        obj.member_dns = ldap::parse_dn_list(members);
    }
    if let Some(member_of) = record.get("memberof") {
        obj.member_of_dns = ldap::parse_dn_list(member_of);
    }
}

fn normalize_domain(obj: &mut DirectoryObject, record: &AttributeRecord) {
    if let Some(level) = record.get("msds-behavior-version").and_then(|v| v.parse::<i64>().ok()) {
        let label = match level {
            0 => "2000 Mixed/Native",
            1 => "2003 Interim",
            2 => "2003",
            3 => "2008",
            4 => "2008 R2",
            5 => "2012",
            6 => "2012 R2",
            7 => "2016",
            _ => "Unknown",
        };
        obj.set_prop("functionallevel", json!(label));
    }
    if let Some(gplink) = record.get("gplink") {
        obj.gplink_dns = parse_gplink(gplink);
    }
}

fn normalize_ou(obj: &mut DirectoryObject, record: &AttributeRecord) {
    if let Some(options) = record.get("gpoptions") {
        obj.set_prop("blocksinheritance", json!(options.trim() == "1"));
    }
    if let Some(gplink) = record.get("gplink") {
        obj.gplink_dns = parse_gplink(gplink);
    }
}

fn normalize_gpo(obj: &mut DirectoryObject, record: &AttributeRecord) {
    if let Some(path) = record.get("gpcfilesyspath") {
        obj.set_prop("gpcpath", json!(path.to_uppercase()));
    }
}

fn normalize_certificate(obj: &mut DirectoryObject, record: &AttributeRecord) {
    copy_string_props(
        obj,
        record,
        &["certthumbprint", "certname", "certsubject", "certissuer"],
    );
    if let Some(chain) = record.get("certthumbprint") {
        // Seed the chain with the leaf; the resolver extends it.
        obj.set_prop("certchain", json!([chain]));
    }
}

fn normalize_enterprise_ca(obj: &mut DirectoryObject, record: &AttributeRecord) {
    normalize_certificate(obj, record);
    copy_string_props(obj, record, &["caname", "dnshostname"]);
    if let Some(templates) = record.get("certificatetemplates") {
        obj.published_templates = templates
            .split(", ")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
}

fn normalize_cert_template(obj: &mut DirectoryObject, record: &AttributeRecord) {
    copy_string_props(obj, record, &["displayname", "oid"]);
    if let Some(flags) = record.get("mspki-enrollment-flag").and_then(|v| v.parse::<i64>().ok()) {
        obj.set_prop("enrollmentflag", json!(flags));
        obj.set_prop("requiresmanagerapproval", json!(flags & 0x02 != 0));
    }
    if let Some(flags) = record
        .get("mspki-certificate-name-flag")
        .and_then(|v| v.parse::<i64>().ok())
    {
        obj.set_prop("certificatenameflag", json!(flags));
        obj.set_prop("enrolleesuppliessubject", json!(flags & 0x1 != 0));
    }
    if let Some(ekus) = record.get("pkiextendedkeyusage") {
        let values: Vec<&str> = ekus.split(", ").filter(|s| !s.is_empty()).collect();
        obj.set_prop("ekus", json!(values));
    }
    if let Some(signatures) = record.get("mspki-ra-signature").and_then(|v| v.parse::<i64>().ok()) {
        obj.set_prop("authorizedsignatures", json!(signatures));
    }
}

fn normalize_trust(obj: &mut DirectoryObject, record: &AttributeRecord, dn: &str) {
    let attributes = record
        .get("trustattributes")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let trust_type = if attributes & 0x20 != 0 {
        "ParentChild"
    } else if attributes & 0x08 != 0 {
        "Forest"
    } else if attributes & (0x40 | 0x04) != 0 {
        "External"
    } else {
        "Unknown"
    };
    obj.trust_properties = Some(TrustProperties {
        target_domain_name: record
            .get("trustpartner")
            .map(|p| p.to_uppercase())
            .unwrap_or_default(),
        target_domain_sid: record.get("securityidentifier").cloned(),
        trust_direction: record
            .get("trustdirection")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0),
        trust_type: trust_type.to_string(),
        is_transitive: attributes & 0x01 == 0,
        sid_filtering_enabled: attributes & 0x04 != 0,
    });
    obj.local_domain_dn = ldap::domain_component(dn).map(str::to_string);
}

/// Parse a raw gPLink value (`[LDAP://cn={GUID},...;flag]` sequences) into
/// (upper-cased DN, enforced) pairs. Links flagged disabled are dropped.
pub fn parse_gplink(value: &str) -> Vec<(String, bool)> {
    let mut links = Vec::new();
    for part in value.split('[') {
        let Some(body) = part.strip_prefix("LDAP://") else {
            continue;
        };
        let Some((dn, rest)) = body.split_once(';') else {
            continue;
        };
        let flag: i64 = rest
            .trim_end_matches(']')
            .trim()
            .parse()
            .unwrap_or_default();
        // 1 = link disabled, 3 = disabled + enforced; neither applies.
        if flag & 0x1 != 0 {
            continue;
        }
        links.push((dn.to_uppercase(), flag & 0x2 != 0));
    }
    links
}
