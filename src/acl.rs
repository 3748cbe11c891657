//! Binary security-descriptor decoding and permission-edge derivation.
//!
//! Descriptors arrive base64-encoded on the object (self-relative layout,
//! little-endian fields, big-endian SID authority). Only access-allowed and
//! object-specific access-allowed ACEs produce edges; the access mask is
//! evaluated in a strict precedence so higher rights suppress the lower
//! rights they imply. A malformed descriptor costs that object its edges,
//! never the batch.
use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::warn;
use serde_json::json;

use crate::object::{Ace, DirectoryObject, EntryType};
use crate::wellknown;

const SE_DACL_PROTECTED: u16 = 0x1000;

const ACE_TYPE_ACCESS_ALLOWED: u8 = 0x00;
const ACE_TYPE_ACCESS_ALLOWED_OBJECT: u8 = 0x05;
const ACE_FLAG_INHERIT_ONLY: u8 = 0x08;
const ACE_FLAG_INHERITED: u8 = 0x10;
const OBJECT_TYPE_PRESENT: u32 = 0x01;
const INHERITED_OBJECT_TYPE_PRESENT: u32 = 0x02;

const GENERIC_ALL: u32 = 0x1000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;
const WRITE_OWNER: u32 = 0x0008_0000;
const WRITE_DACL: u32 = 0x0004_0000;
const ADS_RIGHT_DS_SELF: u32 = 0x0000_0008;
const ADS_RIGHT_DS_READ_PROP: u32 = 0x0000_0010;
const ADS_RIGHT_DS_WRITE_PROP: u32 = 0x0000_0020;
const ADS_RIGHT_DS_CONTROL_ACCESS: u32 = 0x0000_0100;

#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("descriptor truncated at offset {0}")]
    Truncated(usize),
    #[error("invalid base64 security descriptor: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Lookup state the decoder needs from the correlation context.
pub struct AclContext<'a> {
    /// Lower-cased schema name to type GUID.
    pub schema_map: &'a BTreeMap<String, String>,
    /// Resolved principal identifier to entry-type display string.
    pub principal_types: &'a HashMap<String, &'static str>,
}

#[derive(Debug, Clone, Default)]
struct ObjectAceData {
    object_type: Option<String>,
    inherited_object_type: Option<String>,
}

#[derive(Debug, Clone)]
struct RawAce {
    ace_flags: u8,
    mask: u32,
    sid: String,
    object_data: Option<ObjectAceData>,
}

impl RawAce {
    fn has_flag(&self, flag: u8) -> bool {
        self.ace_flags & flag != 0
    }

    fn object_type(&self) -> Option<&str> {
        self.object_data.as_ref()?.object_type.as_deref()
    }

    /// No object-type restriction at all: a plain ACE, or an
    /// object-specific ACE without the object-type field.
    fn untyped(&self) -> bool {
        self.object_type().is_none()
    }

    /// The `can_write_property`/`has_extended_right` gate: only meaningful
    /// on object-specific ACEs, where a missing object type means the right
    /// is unrestricted.
    fn object_type_allows(&self, guid: &str) -> bool {
        match &self.object_data {
            Some(data) => data.object_type.as_deref().is_none_or(|g| g == guid),
            None => false,
        }
    }

    /// Strict gate: the object-type GUID must be present and equal.
    fn object_type_is(&self, guid: &str) -> bool {
        self.object_type() == Some(guid)
    }
}

#[derive(Debug)]
struct SecurityDescriptor {
    control: u16,
    owner_sid: Option<String>,
    dacl: Vec<RawAce>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], AclError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(AclError::Truncated(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, AclError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AclError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, AclError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Structured SID: revision, sub-authority count, 48-bit big-endian
    /// authority, then little-endian sub-authorities.
    fn sid(&mut self) -> Result<String, AclError> {
        let revision = self.u8()?;
        let count = self.u8()? as usize;
        let auth_bytes = self.take(6)?;
        let mut authority: u64 = 0;
        for byte in auth_bytes {
            authority = authority << 8 | u64::from(*byte);
        }
        let mut sid = format!("S-{revision}-{authority}");
        for _ in 0..count {
            let sub = self.u32()?;
            sid.push('-');
            sid.push_str(&sub.to_string());
        }
        Ok(sid)
    }

    /// GUID with the first three fields little-endian, rendered lower-case.
    fn guid(&mut self) -> Result<String, AclError> {
        let d1 = self.u32()?;
        let d2 = self.u16()?;
        let d3 = self.u16()?;
        let tail = self.take(8)?;
        Ok(format!(
            "{d1:08x}-{d2:04x}-{d3:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            tail[0], tail[1], tail[2], tail[3], tail[4], tail[5], tail[6], tail[7]
        ))
    }
}

fn parse_security_descriptor(buf: &[u8]) -> Result<SecurityDescriptor, AclError> {
    let mut header = Reader::new(buf);
    let _revision = header.u8()?;
    let _sbz1 = header.u8()?;
    let control = header.u16()?;
    let offset_owner = header.u32()? as usize;
    let _offset_group = header.u32()?;
    let _offset_sacl = header.u32()?;
    let offset_dacl = header.u32()? as usize;

    let owner_sid = if offset_owner != 0 {
        Some(Reader::at(buf, offset_owner).sid()?)
    } else {
        None
    };

    let mut dacl = Vec::new();
    if offset_dacl != 0 {
        let mut acl = Reader::at(buf, offset_dacl);
        let _acl_revision = acl.u8()?;
        let _sbz1 = acl.u8()?;
        let _acl_size = acl.u16()?;
        let ace_count = acl.u16()?;
        let _sbz2 = acl.u16()?;
        for _ in 0..ace_count {
            let ace_start = acl.pos;
            let ace_type = acl.u8()?;
            let ace_flags = acl.u8()?;
            let ace_size = acl.u16()? as usize;
            let ace = match ace_type {
                ACE_TYPE_ACCESS_ALLOWED => {
                    let mask = acl.u32()?;
                    let sid = acl.sid()?;
                    Some(RawAce {
                        ace_flags,
                        mask,
                        sid,
                        object_data: None,
                    })
                }
                ACE_TYPE_ACCESS_ALLOWED_OBJECT => {
                    let mask = acl.u32()?;
                    let object_flags = acl.u32()?;
                    let mut data = ObjectAceData::default();
                    if object_flags & OBJECT_TYPE_PRESENT != 0 {
                        data.object_type = Some(acl.guid()?);
                    }
                    if object_flags & INHERITED_OBJECT_TYPE_PRESENT != 0 {
                        data.inherited_object_type = Some(acl.guid()?);
                    }
                    let sid = acl.sid()?;
                    Some(RawAce {
                        ace_flags,
                        mask,
                        sid,
                        object_data: Some(data),
                    })
                }
                _ => None,
            };
            if let Some(ace) = ace {
                dacl.push(ace);
            }
            // Advance by the declared ACE size so unknown or padded ACE
            // bodies cannot desynchronize the walk.
            if ace_size < 4 {
                return Err(AclError::Truncated(ace_start));
            }
            let next = ace_start
                .checked_add(ace_size)
                .filter(|next| *next <= buf.len())
                .ok_or(AclError::Truncated(ace_start))?;
            acl.pos = next;
        }
    }

    Ok(SecurityDescriptor {
        control,
        owner_sid,
        dacl,
    })
}

/// Decode one object's security descriptor into its edge list and
/// protected-DACL flag. Returns the number of edges produced; a missing or
/// malformed descriptor yields zero edges and never fails the batch.
pub fn decode_object_acl(obj: &mut DirectoryObject, ctx: &AclContext) -> usize {
    let Some(raw) = obj.raw_security_descriptor.clone() else {
        return 0;
    };
    let descriptor = match BASE64
        .decode(raw.trim())
        .map_err(AclError::from)
        .and_then(|bytes| parse_security_descriptor(&bytes))
    {
        Ok(sd) => sd,
        Err(err) => {
            warn!(
                "failed to decode security descriptor on {}: {err}",
                obj.prop_str("name").unwrap_or("(unnamed)")
            );
            return 0;
        }
    };

    obj.is_acl_protected = descriptor.control & SE_DACL_PROTECTED != 0;
    let entry_type = obj.entry_type();
    let dn = obj.dn().unwrap_or_default().to_string();
    let has_laps = obj.properties.get("haslaps") == Some(&json!(true));

    let mut edges: Vec<Ace> = Vec::new();
    if let Some(owner) = &descriptor.owner_sid
        && !wellknown::IGNORED_SIDS.contains(&owner.as_str())
    {
        edges.push(build_edge(owner, "Owns", false, &dn, ctx));
    }

    for ace in &descriptor.dacl {
        if wellknown::IGNORED_SIDS.contains(&ace.sid.as_str()) {
            continue;
        }
        // Set here for inheritance further down the tree only; does not
        // apply to this object.
        if !ace.has_flag(ACE_FLAG_INHERITED) && ace.has_flag(ACE_FLAG_INHERIT_ONLY) {
            continue;
        }
        if ace.has_flag(ACE_FLAG_INHERITED)
            && let Some(inherited_type) = ace
                .object_data
                .as_ref()
                .and_then(|d| d.inherited_object_type.as_deref())
            && !type_applies(inherited_type, entry_type, ctx)
        {
            continue;
        }
        evaluate_mask(ace, entry_type, has_laps, &dn, ctx, &mut edges);
    }

    let count = edges.len();
    obj.aces = edges;
    count
}

/// True when the GUID restriction names this entry type in the
/// schema-derived table. An entry type the table does not know cannot
/// match, so the restriction excludes it.
fn type_applies(guid: &str, entry_type: EntryType, ctx: &AclContext) -> bool {
    ctx.schema_map
        .get(&entry_type.schema_key())
        .is_some_and(|own| own == guid)
}

/// Walk the access mask in precedence order, appending edges. Branches
/// gated on a specific object-type GUID can only fire for object-specific
/// ACEs; "unrestricted" branches fire whenever no object-type GUID is
/// present.
fn evaluate_mask(
    ace: &RawAce,
    entry_type: EntryType,
    has_laps: bool,
    dn: &str,
    ctx: &AclContext,
    edges: &mut Vec<Ace>,
) {
    use EntryType::*;
    let inherited = ace.has_flag(ACE_FLAG_INHERITED);
    let mut push = |sid: &str, right: &str| edges.push(build_edge(sid, right, inherited, dn, ctx));
    let has = |bit: u32| ace.mask & bit == bit;
    let laps_scoped = ctx
        .schema_map
        .get(wellknown::SCHEMA_KEY_LAPS_PASSWORD)
        .is_some_and(|guid| ace.object_type_is(guid));

    if has(GENERIC_ALL) {
        if entry_type == Computer && has_laps && laps_scoped {
            push(&ace.sid, "ReadLAPSPassword");
        } else {
            push(&ace.sid, "GenericAll");
        }
        // GenericAll implies every other right; evaluating further bits
        // would only produce redundant edges.
        return;
    }

    if has(GENERIC_WRITE) {
        push(&ace.sid, "GenericWrite");
        // Duplicate lower rights are still reported on domains and
        // computers, mirroring the downstream consumer's expectations.
        if !matches!(entry_type, Domain | Computer) {
            return;
        }
    }

    if has(WRITE_DACL) {
        push(&ace.sid, "WriteDacl");
    }
    if has(WRITE_OWNER) {
        push(&ace.sid, "WriteOwner");
    }

    if has(ADS_RIGHT_DS_WRITE_PROP) {
        if ace.untyped() && matches!(entry_type, User | Group | Computer | Gpo) {
            push(&ace.sid, "GenericWrite");
        }
        if entry_type == Group && ace.object_type_allows(wellknown::GUID_WRITE_MEMBER) {
            push(&ace.sid, "AddMember");
        }
        if entry_type == Computer && ace.object_type_allows(wellknown::GUID_ALLOWED_TO_ACT) {
            push(&ace.sid, "AddAllowedToAct");
        }
        if entry_type == Computer
            && ace.object_type_allows(wellknown::GUID_ACCOUNT_RESTRICTIONS)
            && !ace.sid.ends_with(wellknown::DOMAIN_ADMINS_RID_SUFFIX)
        {
            push(&ace.sid, "WriteAccountRestrictions");
        }
        if matches!(entry_type, User | Computer)
            && ctx
                .schema_map
                .get(wellknown::SCHEMA_KEY_KEY_CREDENTIAL_LINK)
                .is_some_and(|guid| ace.object_type_is(guid))
        {
            push(&ace.sid, "AddKeyCredentialLink");
        }
        if entry_type == User && ace.object_type_is(wellknown::GUID_SERVICE_PRINCIPAL_NAME) {
            push(&ace.sid, "WriteSPN");
        }
        if entry_type == CertTemplate && ace.object_type_is(wellknown::GUID_PKI_NAME_FLAG) {
            push(&ace.sid, "WritePKINameFlag");
        }
        if entry_type == CertTemplate && ace.object_type_is(wellknown::GUID_PKI_ENROLLMENT_FLAG) {
            push(&ace.sid, "WritePKIEnrollmentFlag");
        }
    } else if has(ADS_RIGHT_DS_SELF)
        && entry_type == Group
        && ace.object_type_is(wellknown::GUID_WRITE_MEMBER)
    {
        push(&ace.sid, "AddSelf");
    }

    if has(ADS_RIGHT_DS_READ_PROP) && entry_type == Computer && has_laps && laps_scoped {
        push(&ace.sid, "ReadLAPSPassword");
    }

    if has(ADS_RIGHT_DS_CONTROL_ACCESS) {
        if ace.untyped() && matches!(entry_type, User | Domain) {
            push(&ace.sid, "AllExtendedRights");
        }
        if ace.untyped() && entry_type == Computer {
            // On plain ACEs, administrators-tier principals already hold
            // this through group membership; skip the redundant edge.
            let privileged_principal = ace.object_data.is_none()
                && (ace.sid == wellknown::BUILTIN_ADMINISTRATORS
                    || ace.sid.ends_with(wellknown::DOMAIN_ADMINS_RID_SUFFIX));
            if !privileged_principal {
                push(&ace.sid, "AllExtendedRights");
            }
        }
        if entry_type == Domain {
            if ace.object_type_allows(wellknown::GUID_GET_CHANGES) {
                push(&ace.sid, "GetChanges");
            }
            if ace.object_type_allows(wellknown::GUID_GET_CHANGES_ALL) {
                push(&ace.sid, "GetChangesAll");
            }
            if ace.object_type_allows(wellknown::GUID_GET_CHANGES_FILTERED) {
                push(&ace.sid, "GetChangesInFilteredSet");
            }
        }
        if entry_type == User && ace.object_type_allows(wellknown::GUID_FORCE_CHANGE_PASSWORD) {
            push(&ace.sid, "ForceChangePassword");
        }
        if matches!(entry_type, CertTemplate | EnterpriseCa)
            && ace.object_type_allows(wellknown::GUID_ENROLL)
        {
            push(&ace.sid, "Enroll");
        }
    }
}

fn build_edge(sid: &str, right: &str, inherited: bool, dn: &str, ctx: &AclContext) -> Ace {
    let principal_type = ctx
        .principal_types
        .get(sid)
        .copied()
        .or_else(|| wellknown::lookup_sid(sid).map(|(_, kind)| kind))
        .unwrap_or("Unknown");
    Ace {
        principal_sid: wellknown::qualify_sid(sid, dn),
        principal_type: principal_type.to_string(),
        right_name: right.to_string(),
        is_inherited: inherited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::AttributeRecord;
    use serde_json::json;

    fn encode_sid(sid: &str) -> Vec<u8> {
        let parts: Vec<&str> = sid.split('-').collect();
        let revision: u8 = parts[1].parse().unwrap();
        let authority: u64 = parts[2].parse().unwrap();
        let subs: Vec<u32> = parts[3..].iter().map(|p| p.parse().unwrap()).collect();
        let mut out = vec![revision, subs.len() as u8];
        out.extend_from_slice(&authority.to_be_bytes()[2..]);
        for sub in subs {
            out.extend_from_slice(&sub.to_le_bytes());
        }
        out
    }

    fn encode_guid(guid: &str) -> Vec<u8> {
        let hex: String = guid.chars().filter(|c| *c != '-').collect();
        let bytes: Vec<u8> = (0..16)
            .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap())
            .collect();
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&[bytes[3], bytes[2], bytes[1], bytes[0]]);
        out.extend_from_slice(&[bytes[5], bytes[4]]);
        out.extend_from_slice(&[bytes[7], bytes[6]]);
        out.extend_from_slice(&bytes[8..16]);
        out
    }

    struct TestAce {
        ace_type: u8,
        flags: u8,
        mask: u32,
        sid: &'static str,
        object_type: Option<&'static str>,
        inherited_object_type: Option<&'static str>,
    }

    impl TestAce {
        fn plain(mask: u32, sid: &'static str) -> Self {
            Self {
                ace_type: ACE_TYPE_ACCESS_ALLOWED,
                flags: 0,
                mask,
                sid,
                object_type: None,
                inherited_object_type: None,
            }
        }

        fn object(mask: u32, sid: &'static str, object_type: Option<&'static str>) -> Self {
            Self {
                ace_type: ACE_TYPE_ACCESS_ALLOWED_OBJECT,
                flags: 0,
                mask,
                sid,
                object_type,
                inherited_object_type: None,
            }
        }

        fn encode(&self) -> Vec<u8> {
            let mut body = self.mask.to_le_bytes().to_vec();
            if self.ace_type == ACE_TYPE_ACCESS_ALLOWED_OBJECT {
                let mut obj_flags = 0u32;
                if self.object_type.is_some() {
                    obj_flags |= OBJECT_TYPE_PRESENT;
                }
                if self.inherited_object_type.is_some() {
                    obj_flags |= INHERITED_OBJECT_TYPE_PRESENT;
                }
                body.extend_from_slice(&obj_flags.to_le_bytes());
                if let Some(guid) = self.object_type {
                    body.extend_from_slice(&encode_guid(guid));
                }
                if let Some(guid) = self.inherited_object_type {
                    body.extend_from_slice(&encode_guid(guid));
                }
            }
            body.extend_from_slice(&encode_sid(self.sid));
            let size = (body.len() + 4) as u16;
            let mut out = vec![self.ace_type, self.flags];
            out.extend_from_slice(&size.to_le_bytes());
            out.extend(body);
            out
        }
    }

    fn encode_descriptor(owner: Option<&str>, aces: &[TestAce]) -> String {
        let owner_bytes = owner.map(encode_sid);
        let ace_bytes: Vec<Vec<u8>> = aces.iter().map(TestAce::encode).collect();
        let acl_body_len: usize = ace_bytes.iter().map(Vec::len).sum();

        let mut buf = Vec::new();
        buf.extend_from_slice(&[1, 0]); // revision, sbz1
        buf.extend_from_slice(&0x8004u16.to_le_bytes()); // self-relative + DACL present
        let owner_offset = if owner_bytes.is_some() { 20u32 } else { 0 };
        let dacl_offset = 20 + owner_bytes.as_ref().map_or(0, |b| b.len()) as u32;
        buf.extend_from_slice(&owner_offset.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // group
        buf.extend_from_slice(&0u32.to_le_bytes()); // sacl
        buf.extend_from_slice(&dacl_offset.to_le_bytes());
        if let Some(bytes) = owner_bytes {
            buf.extend(bytes);
        }
        buf.extend_from_slice(&[2, 0]); // acl revision, sbz1
        buf.extend_from_slice(&((8 + acl_body_len) as u16).to_le_bytes());
        buf.extend_from_slice(&(aces.len() as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        for bytes in ace_bytes {
            buf.extend(bytes);
        }
        BASE64.encode(buf)
    }

    fn target(entry_type: EntryType) -> DirectoryObject {
        let mut record = AttributeRecord::new();
        record.insert(
            "distinguishedname".to_string(),
            "CN=Target,CN=Users,DC=ad,DC=local".to_string(),
        );
        record.insert("objectsid".to_string(), "S-1-5-21-9-9-9-1000".to_string());
        DirectoryObject::from_record(entry_type, &record)
    }

    fn ctx_maps() -> (BTreeMap<String, String>, HashMap<String, &'static str>) {
        let mut schema = BTreeMap::new();
        schema.insert(
            "ms-mcs-admpwd".to_string(),
            "11111111-2222-3333-4444-555555555555".to_string(),
        );
        (schema, HashMap::new())
    }

    const ATTACKER: &str = "S-1-5-21-1-2-3-5555";

    #[test]
    fn generic_all_yields_single_edge_without_lower_rights() {
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut user = target(EntryType::User);
        user.raw_security_descriptor = Some(encode_descriptor(
            None,
            &[TestAce::plain(
                GENERIC_ALL | WRITE_DACL | ADS_RIGHT_DS_WRITE_PROP,
                ATTACKER,
            )],
        ));
        let count = decode_object_acl(&mut user, &ctx);
        assert_eq!(count, 1);
        assert_eq!(user.aces[0].right_name, "GenericAll");
        assert_eq!(user.aces[0].principal_sid, ATTACKER);
        assert!(!user.aces[0].is_inherited);
    }

    #[test]
    fn laps_scoped_generic_all_becomes_read_laps_password() {
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut computer = target(EntryType::Computer);
        computer.set_prop("haslaps", json!(true));
        computer.raw_security_descriptor = Some(encode_descriptor(
            None,
            &[TestAce::object(
                GENERIC_ALL,
                ATTACKER,
                Some("11111111-2222-3333-4444-555555555555"),
            )],
        ));
        decode_object_acl(&mut computer, &ctx);
        assert_eq!(computer.aces.len(), 1);
        assert_eq!(computer.aces[0].right_name, "ReadLAPSPassword");

        // Without LAPS deployed the same ACE is plain full control.
        let mut computer = target(EntryType::Computer);
        computer.set_prop("haslaps", json!(false));
        computer.raw_security_descriptor = Some(encode_descriptor(
            None,
            &[TestAce::object(
                GENERIC_ALL,
                ATTACKER,
                Some("11111111-2222-3333-4444-555555555555"),
            )],
        ));
        decode_object_acl(&mut computer, &ctx);
        assert_eq!(computer.aces[0].right_name, "GenericAll");
    }

    #[test]
    fn owner_edge_skips_ignored_sids() {
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut user = target(EntryType::User);
        user.raw_security_descriptor = Some(encode_descriptor(Some("S-1-5-18"), &[]));
        assert_eq!(decode_object_acl(&mut user, &ctx), 0);

        let mut user = target(EntryType::User);
        user.raw_security_descriptor = Some(encode_descriptor(Some(ATTACKER), &[]));
        assert_eq!(decode_object_acl(&mut user, &ctx), 1);
        assert_eq!(user.aces[0].right_name, "Owns");
    }

    #[test]
    fn member_write_guid_gates_add_member() {
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut group = target(EntryType::Group);
        group.raw_security_descriptor = Some(encode_descriptor(
            None,
            &[
                TestAce::object(
                    ADS_RIGHT_DS_WRITE_PROP,
                    ATTACKER,
                    Some(wellknown::GUID_WRITE_MEMBER),
                ),
                TestAce::object(
                    ADS_RIGHT_DS_WRITE_PROP,
                    "S-1-5-21-1-2-3-5556",
                    Some(wellknown::GUID_SERVICE_PRINCIPAL_NAME),
                ),
            ],
        ));
        decode_object_acl(&mut group, &ctx);
        assert_eq!(group.aces.len(), 1);
        assert_eq!(group.aces[0].right_name, "AddMember");
    }

    #[test]
    fn untyped_object_ace_is_unrestricted_for_gated_rights() {
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut group = target(EntryType::Group);
        group.raw_security_descriptor = Some(encode_descriptor(
            None,
            &[TestAce::object(ADS_RIGHT_DS_WRITE_PROP, ATTACKER, None)],
        ));
        decode_object_acl(&mut group, &ctx);
        let rights: Vec<&str> = group.aces.iter().map(|a| a.right_name.as_str()).collect();
        assert_eq!(rights, vec!["GenericWrite", "AddMember"]);
    }

    #[test]
    fn plain_control_access_on_computer_guards_privileged_principals() {
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut computer = target(EntryType::Computer);
        computer.raw_security_descriptor = Some(encode_descriptor(
            None,
            &[
                TestAce::plain(ADS_RIGHT_DS_CONTROL_ACCESS, "S-1-5-32-544"),
                TestAce::plain(ADS_RIGHT_DS_CONTROL_ACCESS, "S-1-5-21-1-2-3-512"),
                TestAce::plain(ADS_RIGHT_DS_CONTROL_ACCESS, ATTACKER),
            ],
        ));
        decode_object_acl(&mut computer, &ctx);
        assert_eq!(computer.aces.len(), 1);
        assert_eq!(computer.aces[0].principal_sid, ATTACKER);
        assert_eq!(computer.aces[0].right_name, "AllExtendedRights");
    }

    #[test]
    fn domain_replication_rights_from_scoped_extended_aces() {
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut domain = target(EntryType::Domain);
        domain.raw_security_descriptor = Some(encode_descriptor(
            None,
            &[
                TestAce::object(
                    ADS_RIGHT_DS_CONTROL_ACCESS,
                    ATTACKER,
                    Some(wellknown::GUID_GET_CHANGES),
                ),
                TestAce::object(
                    ADS_RIGHT_DS_CONTROL_ACCESS,
                    ATTACKER,
                    Some(wellknown::GUID_GET_CHANGES_ALL),
                ),
            ],
        ));
        decode_object_acl(&mut domain, &ctx);
        let rights: Vec<&str> = domain.aces.iter().map(|a| a.right_name.as_str()).collect();
        assert_eq!(rights, vec!["GetChanges", "GetChangesAll"]);
    }

    #[test]
    fn malformed_descriptor_degrades_to_zero_edges() {
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut user = target(EntryType::User);
        user.raw_security_descriptor = Some("not-base64!!!".to_string());
        assert_eq!(decode_object_acl(&mut user, &ctx), 0);
        assert!(user.aces.is_empty());

        let mut user = target(EntryType::User);
        user.raw_security_descriptor = Some(BASE64.encode([1u8, 2, 3]));
        assert_eq!(decode_object_acl(&mut user, &ctx), 0);
    }

    #[test]
    fn inherit_only_and_inapplicable_inherited_aces_are_skipped() {
        let (schema, principals) = ctx_maps();
        let mut schema = schema;
        schema.insert(
            "user".to_string(),
            "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string(),
        );
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };

        // Inherit-only without inherited: applies to children, not here.
        let mut user = target(EntryType::User);
        let mut ace = TestAce::plain(GENERIC_ALL, ATTACKER);
        ace.flags = ACE_FLAG_INHERIT_ONLY;
        user.raw_security_descriptor = Some(encode_descriptor(None, &[ace]));
        assert_eq!(decode_object_acl(&mut user, &ctx), 0);

        // Inherited ACE restricted to a different object class.
        let mut user = target(EntryType::User);
        let mut ace = TestAce::object(GENERIC_ALL, ATTACKER, None);
        ace.flags = ACE_FLAG_INHERITED;
        ace.inherited_object_type = Some("99999999-9999-9999-9999-999999999999");
        user.raw_security_descriptor = Some(encode_descriptor(None, &[ace]));
        assert_eq!(decode_object_acl(&mut user, &ctx), 0);

        // Same ACE scoped to the user class applies.
        let mut user = target(EntryType::User);
        let mut ace = TestAce::object(GENERIC_ALL, ATTACKER, None);
        ace.flags = ACE_FLAG_INHERITED;
        ace.inherited_object_type = Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
        user.raw_security_descriptor = Some(encode_descriptor(None, &[ace]));
        assert_eq!(decode_object_acl(&mut user, &ctx), 1);
        assert!(user.aces[0].is_inherited);
    }

    #[test]
    fn sid_and_guid_wire_decoding() {
        let bytes = encode_sid("S-1-5-21-1004336348-1177238915-682003330-512");
        let sid = Reader::new(&bytes).sid().unwrap();
        assert_eq!(sid, "S-1-5-21-1004336348-1177238915-682003330-512");

        let bytes = encode_guid(wellknown::GUID_GET_CHANGES);
        let guid = Reader::new(&bytes).guid().unwrap();
        assert_eq!(guid, wellknown::GUID_GET_CHANGES);
    }

    #[test]
    fn unused_create_child_bit_produces_no_edges() {
        // ADS_RIGHT_DS_CREATE_CHILD grants no modeled right.
        let (schema, principals) = ctx_maps();
        let ctx = AclContext {
            schema_map: &schema,
            principal_types: &principals,
        };
        let mut user = target(EntryType::User);
        user.raw_security_descriptor = Some(encode_descriptor(
            None,
            &[TestAce::plain(0x0000_0001, ATTACKER)],
        ));
        assert_eq!(decode_object_acl(&mut user, &ctx), 0);
    }
}
