//! Relationship resolvers: the enrichment passes run, in a fixed order,
//! over the fully classified and merged object set. Each stage recomputes
//! its relationships from scratch as a pure function of the current state;
//! nothing is incrementally patched.
use std::collections::HashMap;

use log::warn;
use serde_json::json;

use crate::acl::{AclContext, decode_object_acl};
use crate::engine::Engine;
use crate::ldap;
use crate::object::{DirectoryObject, EntryType, GpoLink, DelegationTarget, TrustProperties, TypedRef};
use crate::wellknown;

impl Engine {
    /// Stage 1: rewrite well-known relative identifiers to their
    /// domain-qualified form. Must run before any stage that uses
    /// identifiers as edge targets or map keys.
    pub(crate) fn recalculate_identifiers(&mut self) {
        let domain_map = &self.maps.domain_map;
        for obj in self.objects.iter_processable_mut() {
            let Some(id) = obj.object_identifier.clone() else {
                continue;
            };
            if !wellknown::is_wellknown(&id) {
                continue;
            }
            let Some(dn) = obj.dn().map(str::to_string) else {
                continue;
            };
            if let Some(dc) = ldap::domain_component(&dn)
                && let Some(domain_sid) = domain_map.get(dc)
            {
                obj.set_prop("domainsid", json!(domain_sid));
            }
            obj.object_identifier = Some(wellknown::qualify_sid(&id, &dn));
        }
    }

    /// Stage 2: derive each object's immediate parent from the DN remainder
    /// after its first component.
    pub(crate) fn calculate_containment(&mut self) {
        // Containers win over unknown-bucket records for the same DN.
        let mut cn_index: HashMap<String, TypedRef> = HashMap::new();
        for record in &self.unknown {
            let (Some(dn), Some(guid)) = (record.get("distinguishedname"), record.get("objectguid"))
            else {
                continue;
            };
            let kind = match record.get("objectclass").map(String::as_str) {
                Some("top, NTDSService") => "Base",
                Some("top, container") => "Container",
                Some("top, configuration") => "Configuration",
                _ => continue,
            };
            cn_index.insert(dn.to_uppercase(), TypedRef::new(guid.to_uppercase(), kind));
        }
        for container in &self.objects.containers {
            if let (Some(dn), Some(id)) = (container.dn(), &container.object_identifier) {
                cn_index.insert(dn.to_string(), TypedRef::new(id.clone(), "Container"));
            }
        }
        let ou_index: HashMap<String, String> = index_by_dn(&self.objects.ous);
        let dc_index: HashMap<String, String> = index_by_dn(&self.objects.domains);

        for obj in self.objects.iter_processable_mut() {
            // Domains are roots; nothing contains them.
            if obj.entry_type() == EntryType::Domain {
                continue;
            }
            let Some(dn) = obj.dn() else {
                continue;
            };
            let Some((_, parent_dn)) = dn.split_once(',') else {
                continue;
            };
            let parent = if parent_dn.starts_with("CN=BUILTIN") {
                Some(TypedRef::new("S-1-5-32", "Domain"))
            } else {
                match parent_dn.get(..2) {
                    Some("CN") => cn_index.get(parent_dn).cloned(),
                    Some("OU") => ou_index
                        .get(parent_dn)
                        .map(|id| TypedRef::new(id.clone(), "OU")),
                    Some("DC") => dc_index
                        .get(parent_dn)
                        .map(|id| TypedRef::new(id.clone(), "Domain")),
                    _ => None,
                }
            };
            if parent.is_some() {
                obj.contained_by = parent;
            }
        }
    }

    /// Stage 3: attach each object's domain identifier from its DN.
    pub(crate) fn attach_domain_sids(&mut self) {
        let domain_map = &self.maps.domain_map;
        for obj in self.objects.iter_processable_mut() {
            let Some(dc) = obj.dn().and_then(ldap::domain_component) else {
                continue;
            };
            if let Some(domain_sid) = domain_map.get(dc).cloned() {
                obj.set_prop("domainsid", json!(domain_sid));
            }
        }
    }

    /// Stage 4: decode every object's security descriptor into permission
    /// edges, now that final types and containment are in place. Returns
    /// the number of edges produced, for progress accounting only.
    pub(crate) fn decode_acls(&mut self) -> usize {
        let mut principal_types: HashMap<String, &'static str> = HashMap::new();
        for (sid, slot) in &self.maps.sid_map {
            if let Some(obj) = self.objects.get(*slot) {
                principal_types.insert(sid.clone(), obj.entry_type().as_str());
            }
        }
        let ctx = AclContext {
            schema_map: &self.maps.schema_map,
            principal_types: &principal_types,
        };
        let mut total = 0;
        for obj in self.objects.iter_processable_mut() {
            total += decode_object_acl(obj, &ctx);
        }
        total
    }

    /// Stage 5: synthesize the built-in security principals every domain
    /// implies but a capture rarely contains.
    pub(crate) fn synthesize_default_principals(&mut self) {
        let domains: Vec<(String, String)> = self
            .objects
            .domains
            .iter()
            .filter_map(|d| {
                Some((
                    d.object_identifier.clone()?,
                    d.prop_str("name")?.to_uppercase(),
                ))
            })
            .collect();
        // Domain controllers announce themselves through their primary
        // group, regardless of which vantage point captured them.
        let domain_controllers: Vec<TypedRef> = self
            .objects
            .computers
            .iter()
            .filter(|c| {
                c.primary_group_sid
                    .as_deref()
                    .is_some_and(|sid| sid.ends_with(wellknown::DOMAIN_CONTROLLERS_RID_SUFFIX))
            })
            .filter_map(|c| c.object_identifier.clone())
            .map(|id| TypedRef::new(id, "Computer"))
            .collect();

        for (domain_sid, domain_name) in domains {
            let nt_authority = synthesized_principal(
                EntryType::User,
                "S-1-5-20",
                &format!("NT AUTHORITY@{domain_name}"),
                &domain_name,
                &domain_sid,
            );
            self.objects.users.push(nt_authority);

            let mut edc = synthesized_principal(
                EntryType::Group,
                "S-1-5-9",
                &format!("ENTERPRISE DOMAIN CONTROLLERS@{domain_name}"),
                &domain_name,
                &domain_sid,
            );
            edc.members = domain_controllers.clone();
            self.objects.groups.push(edc);

            for (sid, label) in [
                ("S-1-1-0", "EVERYONE"),
                ("S-1-5-11", "AUTHENTICATED USERS"),
                ("S-1-5-4", "INTERACTIVE"),
            ] {
                self.objects.groups.push(synthesized_principal(
                    EntryType::Group,
                    sid,
                    &format!("{label}@{domain_name}"),
                    &domain_name,
                    &domain_sid,
                ));
            }
        }
    }

    /// Stage 6: resolve group membership with the three-way test — member
    /// DN recorded on the group, group DN recorded on the member, or the
    /// member's primary group identifier.
    pub(crate) fn resolve_group_members(&mut self) {
        let mut updates: Vec<(usize, Vec<TypedRef>)> = Vec::new();
        for (gi, group) in self.objects.groups.iter().enumerate() {
            // Synthesized groups arrive with members already attached.
            let mut members = group.members.clone();
            let mut add = |candidate: &DirectoryObject, kind: &str| {
                let Some(id) = &candidate.object_identifier else {
                    return;
                };
                if !members.iter().any(|m| &m.object_identifier == id) {
                    members.push(TypedRef::new(id.clone(), kind));
                }
            };
            for user in &self.objects.users {
                if is_member_of(user, group) {
                    add(user, "User");
                }
            }
            for computer in &self.objects.computers {
                if is_member_of(computer, group) {
                    add(computer, "Computer");
                }
            }
            for subgroup in &self.objects.groups {
                if is_nested_group(subgroup, group) {
                    add(subgroup, "Group");
                }
            }
            updates.push((gi, members));
        }
        for (gi, members) in updates {
            self.objects.groups[gi].members = members;
        }
    }

    /// Stage 7: resolve "allowed to delegate to" service strings against
    /// known object names.
    pub(crate) fn resolve_delegation_targets(&mut self) {
        let mut name_index: HashMap<String, (String, &'static str)> = HashMap::new();
        for obj in self.objects.iter_processable() {
            if let (Some(id), Some(name)) = (&obj.object_identifier, obj.prop_str("name")) {
                name_index
                    .entry(name.to_lowercase())
                    .or_insert_with(|| (id.clone(), obj.entry_type().as_str()));
            }
        }

        for obj in self
            .objects
            .computers
            .iter_mut()
            .chain(self.objects.users.iter_mut())
        {
            if obj.allowed_to_delegate_raw.is_empty() {
                continue;
            }
            let mut resolved = Vec::new();
            for host in &obj.allowed_to_delegate_raw {
                let Some(target) = host.split('/').nth(1) else {
                    warn!("invalid delegation target: {host}");
                    continue;
                };
                match name_index.get(&target.to_lowercase()) {
                    Some((sid, kind)) => {
                        resolved.push(DelegationTarget::Resolved(TypedRef::new(sid.clone(), *kind)));
                    }
                    // Unresolvable but FQDN-shaped: keep the reference so
                    // the consumer can still draw the edge.
                    None if target.contains('.') => {
                        resolved.push(DelegationTarget::Host(target.to_uppercase()));
                    }
                    None => {}
                }
            }
            let raw = obj.allowed_to_delegate_raw.clone();
            obj.set_prop("allowedtodelegate", json!(raw));
            obj.allowed_to_delegate = resolved;
        }
    }

    /// Stage 8: attach users/groups/computers to their containing OU, nest
    /// OUs under parent OUs or domains, then aggregate affected users and
    /// computers bottom-up (deepest DN first).
    pub(crate) fn resolve_ou_members(&mut self) {
        let ou_dn_index: HashMap<String, usize> = dn_position_index(&self.objects.ous);
        let domain_dn_index: HashMap<String, usize> = dn_position_index(&self.objects.domains);

        let mut ou_children: Vec<Vec<TypedRef>> = vec![Vec::new(); self.objects.ous.len()];
        let mut domain_children: Vec<Vec<TypedRef>> = vec![Vec::new(); self.objects.domains.len()];

        let direct_members = self
            .objects
            .users
            .iter()
            .chain(&self.objects.groups)
            .chain(&self.objects.computers);
        for obj in direct_members {
            let (Some(dn), Some(id)) = (obj.dn(), &obj.object_identifier) else {
                continue;
            };
            let Some((_, rest)) = dn.split_once("OU=") else {
                continue;
            };
            if let Some(&oi) = ou_dn_index.get(&format!("OU={rest}")) {
                ou_children[oi].push(TypedRef::new(id.clone(), obj.entry_type().as_str()));
            }
        }

        for ou in &self.objects.ous {
            let (Some(dn), Some(id)) = (ou.dn(), &ou.object_identifier) else {
                continue;
            };
            let mut pieces = dn.splitn(3, "OU=");
            let _before = pieces.next();
            let _own = pieces.next();
            if let Some(rest) = pieces.next() {
                // Nested OU: attach to the OU named by the remainder.
                if let Some(&pi) = ou_dn_index.get(&format!("OU={rest}")) {
                    ou_children[pi].push(TypedRef::new(id.clone(), "OU"));
                }
            } else if let Some(&di) = ldap::domain_component(dn)
                .and_then(|dc| domain_dn_index.get(dc))
            {
                // Top-level OU: attach to its domain.
                domain_children[di].push(TypedRef::new(id.clone(), "OU"));
            }
        }

        for (oi, children) in ou_children.into_iter().enumerate() {
            self.objects.ous[oi].child_objects = children;
        }
        for (di, children) in domain_children.into_iter().enumerate() {
            self.objects.domains[di].child_objects = children;
        }

        // Deepest-first, so every child OU's aggregate exists before its
        // parent reads it.
        let ou_id_index: HashMap<String, usize> = id_position_index(&self.objects.ous);
        let mut order: Vec<usize> = (0..self.objects.ous.len()).collect();
        order.sort_by_key(|&i| {
            std::cmp::Reverse(self.objects.ous[i].dn().map_or(0, str::len))
        });
        for i in order {
            let (users, computers) =
                aggregate_children(&self.objects.ous[i].child_objects, &self.objects.ous, &ou_id_index);
            self.objects.ous[i].affected_users = users;
            self.objects.ous[i].affected_computers = computers;
        }
        for i in 0..self.objects.domains.len() {
            let (users, computers) = aggregate_children(
                &self.objects.domains[i].child_objects,
                &self.objects.ous,
                &ou_id_index,
            );
            self.objects.domains[i].affected_users = users;
            self.objects.domains[i].affected_computers = computers;
        }
    }

    /// Stage 9: resolve each OU's and domain's gPLink pairs into GPO
    /// references.
    pub(crate) fn link_gpos(&mut self) {
        let mut resolved: Vec<(EntryType, usize, Vec<GpoLink>)> = Vec::new();
        for (kind, collection) in [
            (EntryType::Ou, &self.objects.ous),
            (EntryType::Domain, &self.objects.domains),
        ] {
            for (i, obj) in collection.iter().enumerate() {
                if obj.gplink_dns.is_empty() {
                    continue;
                }
                let mut links = Vec::new();
                for (dn, enforced) in &obj.gplink_dns {
                    if let Some(slot) = self.maps.dn_map.get(dn)
                        && let Some(target) = self.objects.get(*slot)
                        && let Some(id) = &target.object_identifier
                    {
                        links.push(GpoLink {
                            is_enforced: *enforced,
                            guid: id.to_uppercase(),
                        });
                    }
                }
                resolved.push((kind, i, links));
            }
        }
        for (kind, i, links) in resolved {
            if let Some(collection) = self.objects.collection_mut(kind) {
                collection[i].gpo_links = links;
            }
        }
    }

    /// Stage 10: recover trust target identifiers and attach each trust to
    /// its origin domain, deduplicated by target domain name.
    pub(crate) fn resolve_domain_trusts(&mut self) {
        let mut attach: Vec<(usize, TrustProperties)> = Vec::new();
        for trust in &self.objects.trusts {
            let Some(props) = &trust.trust_properties else {
                continue;
            };
            let mut props = props.clone();
            let target_dn = ldap::domain_to_dn(&props.target_domain_name);
            if let Some(sid) = self.maps.domain_map.get(&target_dn) {
                props.target_domain_sid = Some(sid.clone());
            }
            let Some(local_dn) = trust.local_domain_dn.as_deref() else {
                continue;
            };
            if let Some(di) = self
                .objects
                .domains
                .iter()
                .position(|d| d.dn() == Some(local_dn))
            {
                attach.push((di, props));
            }
        }
        for (di, props) in attach {
            let domain = &mut self.objects.domains[di];
            if !domain
                .trusts
                .iter()
                .any(|prior| prior.target_domain_name == props.target_domain_name)
            {
                domain.trusts.push(props);
            }
        }
    }

    /// Stage 11: walk issuer relationships to an ordered leaf-to-root chain
    /// of certificate thumbprints, per CA collection.
    pub(crate) fn build_certificate_chains(&mut self) {
        build_chains_for(&mut self.objects.enterprise_cas);
        build_chains_for(&mut self.objects.aia_cas);
    }

    /// Stage 12: match each enterprise CA's published template names
    /// against known templates in the same domain.
    pub(crate) fn resolve_published_templates(&mut self) {
        let templates: Vec<(String, String, String)> = self
            .objects
            .cert_templates
            .iter()
            .filter_map(|t| {
                let name = t.prop_str("name")?;
                let local = name.split('@').next().unwrap_or(name);
                Some((
                    local.to_lowercase(),
                    t.prop_str("domain").unwrap_or_default().to_string(),
                    t.object_identifier.clone()?,
                ))
            })
            .collect();
        for ca in &mut self.objects.enterprise_cas {
            let ca_domain = ca.prop_str("domain").unwrap_or_default().to_string();
            let mut enabled = Vec::new();
            for published in &ca.published_templates {
                let published = published.to_lowercase();
                for (name, domain, id) in &templates {
                    if *name == published && *domain == ca_domain {
                        enabled.push(TypedRef::new(id.to_uppercase(), "CertTemplate"));
                    }
                }
            }
            ca.enabled_templates = enabled;
        }
    }
}

fn index_by_dn(objects: &[DirectoryObject]) -> HashMap<String, String> {
    objects
        .iter()
        .filter_map(|o| Some((o.dn()?.to_string(), o.object_identifier.clone()?)))
        .collect()
}

fn dn_position_index(objects: &[DirectoryObject]) -> HashMap<String, usize> {
    objects
        .iter()
        .enumerate()
        .filter_map(|(i, o)| Some((o.dn()?.to_string(), i)))
        .collect()
}

fn id_position_index(objects: &[DirectoryObject]) -> HashMap<String, usize> {
    objects
        .iter()
        .enumerate()
        .filter_map(|(i, o)| Some((o.object_identifier.clone()?, i)))
        .collect()
}

fn synthesized_principal(
    entry_type: EntryType,
    relative_sid: &str,
    name: &str,
    domain_name: &str,
    domain_sid: &str,
) -> DirectoryObject {
    let mut obj = DirectoryObject {
        entry_type: Some(entry_type),
        object_identifier: Some(format!("{domain_name}-{relative_sid}")),
        ..Default::default()
    };
    obj.set_prop("name", json!(name));
    obj.set_prop("domain", json!(domain_name));
    obj.set_prop("domainsid", json!(domain_sid));
    obj.set_prop(
        "distinguishedname",
        json!(format!(
            "CN={relative_sid},CN=FOREIGNSECURITYPRINCIPALS,{}",
            ldap::domain_to_dn(domain_name)
        )),
    );
    obj
}

/// The three-way membership test. Sources differ in which side of the
/// relationship they record, so both directions are consulted, plus the
/// primary group shortcut that never appears in member lists.
fn is_member_of(member: &DirectoryObject, group: &DirectoryObject) -> bool {
    if let Some(dn) = member.dn()
        && group.member_dns.iter().any(|d| d == dn)
    {
        return true;
    }
    if let Some(group_dn) = group.dn()
        && member.member_of_dns.iter().any(|d| d == group_dn)
    {
        return true;
    }
    member.primary_group_sid.is_some() && member.primary_group_sid == group.object_identifier
}

fn is_nested_group(subgroup: &DirectoryObject, group: &DirectoryObject) -> bool {
    if let Some(dn) = subgroup.dn()
        && group.member_dns.iter().any(|d| d == dn)
    {
        return true;
    }
    if let Some(group_dn) = group.dn()
        && subgroup.member_of_dns.iter().any(|d| d == group_dn)
    {
        return true;
    }
    false
}

fn aggregate_children(
    children: &[TypedRef],
    ous: &[DirectoryObject],
    ou_id_index: &HashMap<String, usize>,
) -> (Vec<TypedRef>, Vec<TypedRef>) {
    let mut users = Vec::new();
    let mut computers = Vec::new();
    for child in children {
        match child.object_type.as_str() {
            "User" => users.push(child.clone()),
            "Computer" => computers.push(child.clone()),
            "OU" => {
                if let Some(&ci) = ou_id_index.get(&child.object_identifier) {
                    users.extend(ous[ci].affected_users.iter().cloned());
                    computers.extend(ous[ci].affected_computers.iter().cloned());
                }
            }
            _ => {}
        }
    }
    (users, computers)
}

fn build_chains_for(cas: &mut [DirectoryObject]) {
    let chains: Vec<Vec<String>> = (0..cas.len())
        .map(|i| certificate_chain(i, cas))
        .collect();
    for (ca, chain) in cas.iter_mut().zip(chains) {
        ca.set_prop("certchain", json!(chain));
    }
}

/// Follow subject/issuer string equality from a leaf CA upward. Terminates
/// at a self-signed certificate, a missing issuer, or a revisited node;
/// bounded by the collection size, it never loops on cyclic issuer data.
fn certificate_chain(start: usize, cas: &[DirectoryObject]) -> Vec<String> {
    let mut chain = Vec::new();
    if let Some(thumbprint) = cas[start].prop_str("certthumbprint") {
        chain.push(thumbprint.to_string());
    }
    let mut visited = vec![start];
    let mut current = start;
    loop {
        let (Some(subject), Some(issuer)) = (
            cas[current].prop_str("certsubject"),
            cas[current].prop_str("certissuer"),
        ) else {
            break;
        };
        if subject == issuer {
            break;
        }
        let Some(next) = cas
            .iter()
            .position(|ca| ca.prop_str("certsubject") == Some(issuer))
        else {
            break;
        };
        if visited.contains(&next) {
            break;
        }
        visited.push(next);
        if let Some(thumbprint) = cas[next].prop_str("certthumbprint") {
            chain.push(thumbprint.to_string());
        }
        current = next;
    }
    chain
}
