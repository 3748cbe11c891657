//! Terminal summary of what an import produced, rendered after parsing so
//! the operator can spot thin captures before the output is consumed.
use colored::Colorize;

use crate::engine::Engine;

pub fn render_summary(engine: &Engine) -> String {
    let title = "BOFHound Import Summary";
    let mut out = String::new();
    out.push_str(&title.bold().cyan().to_string());
    out.push('\n');
    out.push_str(&"─".repeat(title.chars().count()));
    out.push_str("\n\n");

    let rows = [
        ("Users", engine.objects.users.len()),
        ("Groups", engine.objects.groups.len()),
        ("Computers", engine.objects.computers.len()),
        ("Domains", engine.objects.domains.len()),
        ("Trusts", engine.objects.trusts.len()),
        ("OUs", engine.objects.ous.len()),
        ("Containers", engine.objects.containers.len()),
        ("GPOs", engine.objects.gpos.len()),
        ("Enterprise CAs", engine.objects.enterprise_cas.len()),
        ("AIA CAs", engine.objects.aia_cas.len()),
        ("Root CAs", engine.objects.root_cas.len()),
        ("NTAuth Stores", engine.objects.ntauth_stores.len()),
        ("Issuance Policies", engine.objects.issuance_policies.len()),
        ("Cert Templates", engine.objects.cert_templates.len()),
        ("Schemas", engine.schema_count),
        ("Referrals", engine.maps.crossref_map.len()),
        ("Trust Accounts", engine.trust_accounts.len()),
        ("Unknown Objects", engine.unknown.len()),
    ];
    let mut any = false;
    for (label, count) in rows {
        if count == 0 {
            continue;
        }
        any = true;
        out.push_str(&format!("  {label:<20}{count}\n"));
    }
    if !any {
        out.push_str("  (no objects imported)\n");
    }
    out
}
