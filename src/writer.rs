//! Output writer: renders the enriched typed collections into the graph
//! consumer's JSON file format, one timestamped file per entry type with
//! the `data`/`meta` wrapper the ingestor expects.
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde_json::json;

use crate::engine::Engine;
use crate::object::DirectoryObject;

/// Graph file format version emitted in every `meta` block.
const FORMAT_VERSION: u32 = 6;

/// Write every non-empty collection to `output_dir`, named
/// `<timestamp>_<type>.json`. Returns the paths written.
pub fn write_all(engine: &Engine, output_dir: &Path) -> Result<Vec<PathBuf>> {
    let prefix = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    write_all_with_prefix(engine, output_dir, &prefix)
}

pub fn write_all_with_prefix(
    engine: &Engine,
    output_dir: &Path,
    prefix: &str,
) -> Result<Vec<PathBuf>> {
    let collections: [(&str, &Vec<DirectoryObject>); 13] = [
        ("users", &engine.objects.users),
        ("computers", &engine.objects.computers),
        ("groups", &engine.objects.groups),
        ("domains", &engine.objects.domains),
        ("ous", &engine.objects.ous),
        ("containers", &engine.objects.containers),
        ("gpos", &engine.objects.gpos),
        ("enterprisecas", &engine.objects.enterprise_cas),
        ("aiacas", &engine.objects.aia_cas),
        ("rootcas", &engine.objects.root_cas),
        ("ntauthstores", &engine.objects.ntauth_stores),
        ("issuancepolicies", &engine.objects.issuance_policies),
        ("certtemplates", &engine.objects.cert_templates),
    ];

    let mut written = Vec::new();
    for (label, objects) in collections {
        if objects.is_empty() {
            continue;
        }
        let path = output_dir.join(format!("{prefix}_{label}.json"));
        write_collection(label, objects, &path)?;
        written.push(path);
    }
    info!("wrote {} output files", written.len());
    Ok(written)
}

fn write_collection(label: &str, objects: &[DirectoryObject], path: &Path) -> Result<()> {
    let data: Vec<serde_json::Value> = objects.iter().map(DirectoryObject::to_value).collect();
    let document = json!({
        "data": data,
        "meta": {
            "methods": 0,
            "type": label,
            "count": data.len(),
            "version": FORMAT_VERSION,
        },
    });
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), &document)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::AttributeRecord;
    use tempfile::tempdir;

    fn record(pairs: &[(&str, &str)]) -> AttributeRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn writes_wrapped_collections_with_contract_field_names() {
        let mut e = Engine::new();
        e.import_objects(vec![
            record(&[
                ("distinguishedname", "DC=ad,DC=local"),
                ("objectsid", "S-1-5-21-1-2-3"),
                ("objectclass", "top, domain, domainDNS"),
            ]),
            record(&[
                ("distinguishedname", "CN=bob,CN=Users,DC=ad,DC=local"),
                ("objectsid", "S-1-5-21-1-2-3-1104"),
                ("samaccounttype", "805306368"),
                ("samaccountname", "bob"),
                ("primarygroupid", "513"),
            ]),
        ]);
        e.process();

        let dir = tempdir().unwrap();
        let written = write_all_with_prefix(&e, dir.path(), "test").unwrap();
        // users (imported + synthesized default), groups (default), domains
        assert_eq!(written.len(), 3);

        let users_path = dir.path().join("test_users.json");
        let content = std::fs::read_to_string(&users_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["meta"]["type"], "users");
        assert_eq!(parsed["meta"]["version"], 6);
        assert_eq!(parsed["meta"]["count"], 2);

        let bob = parsed["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|u| u["ObjectIdentifier"] == "S-1-5-21-1-2-3-1104")
            .unwrap();
        assert_eq!(bob["PrimaryGroupSID"], "S-1-5-21-1-2-3-513");
        assert_eq!(bob["Properties"]["name"], "BOB@AD.LOCAL");
        assert_eq!(bob["IsACLProtected"], false);
        assert!(bob["Aces"].as_array().unwrap().is_empty());

        let groups_path = dir.path().join("test_groups.json");
        let groups: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&groups_path).unwrap()).unwrap();
        assert!(groups["data"]
            .as_array()
            .unwrap()
            .iter()
            .all(|g| g.get("Members").is_some()));
    }
}
