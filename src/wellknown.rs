//! Fixed tables for well-known security principals and directory rights
//! GUIDs. Well-known SIDs are domain-relative: before they are used as edge
//! targets or map keys they are rewritten to a domain-qualified form via
//! [`qualify_sid`].

use crate::ldap;

/// Owner/principal SIDs that never produce edges (creator-owner, local
/// system and self placeholders).
pub const IGNORED_SIDS: &[&str] = &["S-1-3-0", "S-1-5-18", "S-1-5-10"];

/// BUILTIN\Administrators.
pub const BUILTIN_ADMINISTRATORS: &str = "S-1-5-32-544";
/// Trailing RID of the Domain Admins group.
pub const DOMAIN_ADMINS_RID_SUFFIX: &str = "-512";
/// Trailing RID of the Domain Controllers group.
pub const DOMAIN_CONTROLLERS_RID_SUFFIX: &str = "-516";

// Extended-right and validated-write GUIDs, lower-cased.
pub const GUID_WRITE_MEMBER: &str = "bf9679c0-0de6-11d0-a285-00aa003049e2";
pub const GUID_ALLOWED_TO_ACT: &str = "3f78c3e5-f79a-46bd-a0b8-9d18116ddc79";
pub const GUID_ACCOUNT_RESTRICTIONS: &str = "4c164200-20c0-11d0-a768-00aa006e0529";
pub const GUID_SERVICE_PRINCIPAL_NAME: &str = "f3a64788-5306-11d1-a9c5-0000f80367c1";
pub const GUID_PKI_NAME_FLAG: &str = "ea1dddc4-60ff-416e-8cc0-17cee534bce7";
pub const GUID_PKI_ENROLLMENT_FLAG: &str = "d15ef7d8-f226-46db-ae79-b34e560bd12c";
pub const GUID_GET_CHANGES: &str = "1131f6aa-9c07-11d1-f79f-00c04fc2dcd2";
pub const GUID_GET_CHANGES_ALL: &str = "1131f6ad-9c07-11d1-f79f-00c04fc2dcd2";
pub const GUID_GET_CHANGES_FILTERED: &str = "89e95b76-444d-4c62-991a-0facbeda640c";
pub const GUID_FORCE_CHANGE_PASSWORD: &str = "00299570-246d-11d0-a768-00aa006e0529";
pub const GUID_ENROLL: &str = "0e10c968-78fb-11d2-90d4-00c04f79dc55";

// Schema-map keys consulted at decode time; present only when the matching
// schema records were captured.
pub const SCHEMA_KEY_LAPS_PASSWORD: &str = "ms-mcs-admpwd";
pub const SCHEMA_KEY_KEY_CREDENTIAL_LINK: &str = "ms-ds-key-credential-link";

/// Universal and domain-relative well-known principals: SID, display name,
/// principal type.
pub const WELLKNOWN_SIDS: &[(&str, &str, &str)] = &[
    ("S-1-0", "Null Authority", "User"),
    ("S-1-0-0", "Nobody", "User"),
    ("S-1-1", "World Authority", "User"),
    ("S-1-1-0", "Everyone", "Group"),
    ("S-1-2", "Local Authority", "User"),
    ("S-1-2-0", "Local", "Group"),
    ("S-1-2-1", "Console Logon", "Group"),
    ("S-1-3", "Creator Authority", "User"),
    ("S-1-3-0", "Creator Owner", "User"),
    ("S-1-3-1", "Creator Group", "Group"),
    ("S-1-3-2", "Creator Owner Server", "Computer"),
    ("S-1-3-3", "Creator Group Server", "Computer"),
    ("S-1-3-4", "Owner Rights", "Group"),
    ("S-1-4", "Non-unique Authority", "User"),
    ("S-1-5", "NT Authority", "User"),
    ("S-1-5-1", "Dialup", "Group"),
    ("S-1-5-2", "Network", "Group"),
    ("S-1-5-3", "Batch", "Group"),
    ("S-1-5-4", "Interactive", "Group"),
    ("S-1-5-6", "Service", "Group"),
    ("S-1-5-7", "Anonymous", "Group"),
    ("S-1-5-8", "Proxy", "Group"),
    ("S-1-5-9", "Enterprise Domain Controllers", "Group"),
    ("S-1-5-10", "Principal Self", "User"),
    ("S-1-5-11", "Authenticated Users", "Group"),
    ("S-1-5-12", "Restricted Code", "Group"),
    ("S-1-5-13", "Terminal Server Users", "Group"),
    ("S-1-5-14", "Remote Interactive Logon", "Group"),
    ("S-1-5-15", "This Organization", "Group"),
    ("S-1-5-17", "IUSR", "User"),
    ("S-1-5-18", "Local System", "User"),
    ("S-1-5-19", "NT Authority", "User"),
    ("S-1-5-20", "NT Authority", "User"),
    ("S-1-5-32-544", "Administrators", "Group"),
    ("S-1-5-32-545", "Users", "Group"),
    ("S-1-5-32-546", "Guests", "Group"),
    ("S-1-5-32-547", "Power Users", "Group"),
    ("S-1-5-32-548", "Account Operators", "Group"),
    ("S-1-5-32-549", "Server Operators", "Group"),
    ("S-1-5-32-550", "Print Operators", "Group"),
    ("S-1-5-32-551", "Backup Operators", "Group"),
    ("S-1-5-32-552", "Replicators", "Group"),
    ("S-1-5-32-554", "Pre-Windows 2000 Compatible Access", "Group"),
    ("S-1-5-32-555", "Remote Desktop Users", "Group"),
    ("S-1-5-32-556", "Network Configuration Operators", "Group"),
    ("S-1-5-32-557", "Incoming Forest Trust Builders", "Group"),
    ("S-1-5-32-558", "Performance Monitor Users", "Group"),
    ("S-1-5-32-559", "Performance Log Users", "Group"),
    ("S-1-5-32-560", "Windows Authorization Access Group", "Group"),
    ("S-1-5-32-561", "Terminal Server License Servers", "Group"),
    ("S-1-5-32-562", "Distributed COM Users", "Group"),
    ("S-1-5-32-568", "IIS_IUSRS", "Group"),
    ("S-1-5-32-569", "Cryptographic Operators", "Group"),
    ("S-1-5-32-573", "Event Log Readers", "Group"),
    ("S-1-5-32-574", "Certificate Service DCOM Access", "Group"),
    ("S-1-5-32-575", "RDS Remote Access Servers", "Group"),
    ("S-1-5-32-576", "RDS Endpoint Servers", "Group"),
    ("S-1-5-32-577", "RDS Management Servers", "Group"),
    ("S-1-5-32-578", "Hyper-V Administrators", "Group"),
    ("S-1-5-32-579", "Access Control Assistance Operators", "Group"),
    ("S-1-5-32-580", "Remote Management Users", "Group"),
    ("S-1-5-80-0", "All Services", "Group"),
];

/// Look up a well-known principal by SID.
pub fn lookup_sid(sid: &str) -> Option<(&'static str, &'static str)> {
    WELLKNOWN_SIDS
        .iter()
        .find(|(s, _, _)| *s == sid)
        .map(|(_, name, kind)| (*name, *kind))
}

/// Look up a well-known principal by display name (exact match).
pub fn lookup_name(name: &str) -> Option<(&'static str, &'static str)> {
    WELLKNOWN_SIDS
        .iter()
        .find(|(_, n, _)| *n == name)
        .map(|(sid, _, kind)| (*sid, *kind))
}

pub fn is_wellknown(sid: &str) -> bool {
    lookup_sid(sid).is_some()
}

/// Rewrite a well-known relative SID to its domain-qualified form using the
/// owning object's DN: `S-1-5-11` on `...,DC=AD,DC=LOCAL` becomes
/// `AD.LOCAL-S-1-5-11`. Non-well-known SIDs pass through untouched.
pub fn qualify_sid(sid: &str, dn: &str) -> String {
    if is_wellknown(sid) {
        let domain = ldap::dn_to_domain(dn).to_uppercase();
        if !domain.is_empty() {
            return format!("{domain}-{sid}");
        }
    }
    sid.to_string()
}
