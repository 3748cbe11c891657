//! Distinguished-name and directory-value utilities shared across the
//! importer and resolvers: DN/domain conversions, DN-list splitting for
//! pre-joined multi-valued attributes, and Windows timestamp handling.

use chrono::NaiveDateTime;

/// Seconds between the Windows FILETIME epoch (1601) and the Unix epoch.
const WIN_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// Return the domain component of a DN, i.e. the substring starting at the
/// first `DC=`. `CN=X,OU=Y,DC=A,DC=B` yields `DC=A,DC=B`.
pub fn domain_component(dn: &str) -> Option<&str> {
    dn.find("DC=").map(|idx| &dn[idx..])
}

/// Convert a DN into its dotted domain name: `CN=X,DC=AD,DC=LOCAL` yields
/// `AD.LOCAL`. Returns an empty string when the DN carries no DC components.
pub fn dn_to_domain(dn: &str) -> String {
    dn.split(',')
        .filter_map(|part| part.trim().strip_prefix("DC="))
        .collect::<Vec<_>>()
        .join(".")
}

/// Convert a dotted domain name into an upper-cased DN:
/// `ad.local` yields `DC=AD,DC=LOCAL`.
pub fn domain_to_dn(domain: &str) -> String {
    domain
        .split('.')
        .map(|label| format!("DC={}", label.to_uppercase()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a pre-joined multi-valued DN attribute into individual upper-cased
/// DNs. The collaborator joins values with `", "`, which also occurs inside
/// every DN, so the split key is the `", CN="` boundary between entries.
pub fn parse_dn_list(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value
        .split(", CN=")
        .enumerate()
        .map(|(i, part)| {
            let part = part.to_uppercase();
            if i == 0 {
                part
            } else {
                format!("CN={part}")
            }
        })
        .collect()
}

/// Convert a Windows FILETIME-style integer (100ns ticks since 1601) to
/// Unix epoch seconds. Zero and the "never" sentinel map to 0.
pub fn win_timestamp_to_unix(value: i64) -> i64 {
    if value <= 0 || value == i64::MAX {
        return 0;
    }
    value / 10_000_000 - WIN_EPOCH_OFFSET_SECS
}

/// Convert an LDAP generalized-time string (`20230401120000.0Z`) to Unix
/// epoch seconds. Returns `None` for values that do not parse.
pub fn generalized_time_to_unix(value: &str) -> Option<i64> {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() < 14 {
        return None;
    }
    NaiveDateTime::parse_from_str(&digits[..14], "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Strip the trailing RID from a SID, yielding the domain portion:
/// `S-1-5-21-A-B-C-1104` yields `S-1-5-21-A-B-C`.
pub fn sid_domain_part(sid: &str) -> &str {
    match sid.rfind('-') {
        Some(idx) => &sid[..idx],
        None => sid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_component_from_dn() {
        assert_eq!(
            domain_component("CN=BOB,CN=USERS,DC=AD,DC=LOCAL"),
            Some("DC=AD,DC=LOCAL")
        );
        assert_eq!(domain_component("CN=NO,CN=DOMAIN"), None);
    }

    #[test]
    fn dn_domain_round_trip() {
        assert_eq!(dn_to_domain("CN=X,DC=AD,DC=LOCAL"), "AD.LOCAL");
        assert_eq!(domain_to_dn("ad.local"), "DC=AD,DC=LOCAL");
    }

    #[test]
    fn splits_joined_dn_lists_on_entry_boundaries() {
        let joined = "CN=Admins,CN=Users,DC=ad,DC=local, CN=Ops,OU=Groups,DC=ad,DC=local";
        let dns = parse_dn_list(joined);
        assert_eq!(
            dns,
            vec![
                "CN=ADMINS,CN=USERS,DC=AD,DC=LOCAL",
                "CN=OPS,OU=GROUPS,DC=AD,DC=LOCAL"
            ]
        );
        assert!(parse_dn_list("").is_empty());
    }

    #[test]
    fn windows_timestamps() {
        assert_eq!(win_timestamp_to_unix(0), 0);
        assert_eq!(win_timestamp_to_unix(i64::MAX), 0);
        // 2023-01-01T00:00:00Z in FILETIME ticks
        assert_eq!(win_timestamp_to_unix(133170048000000000), 1672531200);
    }

    #[test]
    fn generalized_time() {
        assert_eq!(generalized_time_to_unix("20230101000000.0Z"), Some(1672531200));
        assert_eq!(generalized_time_to_unix("bogus"), None);
    }

    #[test]
    fn sid_domain_prefix() {
        assert_eq!(
            sid_domain_part("S-1-5-21-1004336348-1177238915-682003330-1104"),
            "S-1-5-21-1004336348-1177238915-682003330"
        );
    }
}
