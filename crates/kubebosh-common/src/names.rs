//! Deterministic naming of generated objects
//!
//! Every generated name is a pure function of the deployment, instance group,
//! job and variable names. Names longer than the Kubernetes limit are
//! truncated and suffixed with a hash of the full name, so two inputs that
//! share a long prefix still get distinct names.

use crate::kube_utils::deterministic_hash;

/// Maximum length of a Secret or Service name
pub const MAX_NAME_LEN: usize = 63;

/// Length of the hash suffix appended to truncated names
pub const HASH_SUFFIX_LEN: usize = 16;

/// Room reserved for a `-v<version>` suffix on versioned secret names
const VERSION_SUFFIX_RESERVE: usize = 7;

/// Maximum length of a versioned secret name prefix
pub const MAX_VERSIONED_PREFIX_LEN: usize = MAX_NAME_LEN - VERSION_SUFFIX_RESERVE;

/// Infix between deployment and variable name
pub const VARIABLE_INFIX: &str = ".var-";

/// Lowercase a name part and keep only `[a-z0-9.-]`
///
/// Underscores become dashes. Leading and trailing dots and dashes are
/// trimmed so composed names never contain `-.` or `..` at part boundaries.
pub fn sanitize(part: &str) -> String {
    let kept: String = part
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    kept.trim_matches(|c| c == '-' || c == '.').to_string()
}

/// Like [`sanitize`] but also replaces dots, producing a DNS label part
pub fn sanitize_label(part: &str) -> String {
    sanitize(&part.replace('.', "-"))
}

/// Cap a name at `max` characters
///
/// Over-long names keep their first `max - 16` characters and get the
/// 16-character hash of the complete name appended.
pub fn limit_length(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let keep = max.saturating_sub(HASH_SUFFIX_LEN);
    let mut prefix: String = name.chars().take(keep).collect();
    prefix.push_str(&deterministic_hash(name));
    prefix
}

/// Secret name of a generated variable: `<deployment>.var-<variable>`
pub fn variable_secret_name(deployment: &str, variable: &str) -> String {
    let name = format!(
        "{}{}{}",
        sanitize(deployment),
        VARIABLE_INFIX,
        sanitize(variable)
    );
    limit_length(&name, MAX_NAME_LEN)
}

/// Versioned prefix of the manifest with ops applied
pub fn with_ops_prefix(deployment: &str) -> String {
    versioned_prefix(&format!("{}.with-ops", sanitize(deployment)))
}

/// Versioned prefix of the fully interpolated manifest
pub fn desired_manifest_prefix(deployment: &str) -> String {
    versioned_prefix(&format!("{}.desired-manifest", sanitize(deployment)))
}

/// Versioned prefix of an instance group's resolved properties
pub fn ig_resolved_prefix(deployment: &str, instance_group: &str) -> String {
    versioned_prefix(&format!(
        "{}.ig-resolved.{}",
        sanitize(deployment),
        sanitize(instance_group)
    ))
}

/// Versioned prefix of an instance group's BPM configs
pub fn bpm_prefix(deployment: &str, instance_group: &str) -> String {
    versioned_prefix(&format!(
        "{}.bpm.{}",
        sanitize(deployment),
        sanitize(instance_group)
    ))
}

fn versioned_prefix(name: &str) -> String {
    limit_length(name, MAX_VERSIONED_PREFIX_LEN)
}

/// Full secret name of one version: `<prefix>-v<version>`
pub fn versioned_name(prefix: &str, version: u64) -> String {
    format!("{prefix}-v{version}")
}

/// Name of the secret recording the highest version ever written for `prefix`
///
/// `-vmax` is not a version suffix, so the mark never lists as a version.
pub fn version_mark_name(prefix: &str) -> String {
    format!("{prefix}-vmax")
}

/// Split a versioned secret name into prefix and version
pub fn split_versioned_name(name: &str) -> Option<(&str, u64)> {
    let (prefix, version) = name.rsplit_once("-v")?;
    if prefix.is_empty() || version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    version.parse().ok().map(|v| (prefix, v))
}

/// Prefix of a versioned secret name, the inverse of [`versioned_name`]
pub fn prefix_of(name: &str) -> Option<&str> {
    split_versioned_name(name).map(|(prefix, _)| prefix)
}

/// DNS label built from parts joined by `-`, capped at 63 characters
pub fn dns_label(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| sanitize_label(p))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    limit_length(&joined, MAX_NAME_LEN)
}

/// Name of the workload (StatefulSet or ExtendedJob) of an instance group
pub fn instance_group_workload_name(deployment: &str, instance_group: &str) -> String {
    dns_label(&[deployment, instance_group])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_disallowed_characters_and_trims_separators() {
        assert_eq!(
            variable_secret_name("-abc_123.?!\"§$&/()=?", "def-456.?!\"§$&/()=?-"),
            "abc-123.var-def-456"
        );
    }

    #[test]
    fn uppercase_is_lowered() {
        assert_eq!(variable_secret_name("NATS", "Nats_Password"), "nats.var-nats-password");
    }

    #[test]
    fn long_names_are_truncated_with_hash() {
        let long = "a".repeat(70);
        let name = variable_secret_name(&long, "password");
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.starts_with(&"a".repeat(MAX_NAME_LEN - HASH_SUFFIX_LEN)));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-'));
    }

    #[test]
    fn names_colliding_after_truncation_differ_by_hash() {
        let long = "d".repeat(70);
        let a = variable_secret_name(&long, "first");
        let b = variable_secret_name(&long, "second");
        assert_eq!(a.len(), MAX_NAME_LEN);
        assert_eq!(b.len(), MAX_NAME_LEN);
        assert_eq!(
            a[..MAX_NAME_LEN - HASH_SUFFIX_LEN],
            b[..MAX_NAME_LEN - HASH_SUFFIX_LEN]
        );
        assert_ne!(a, b);
    }

    #[test]
    fn versioned_prefixes_leave_room_for_version() {
        let prefix = ig_resolved_prefix(&"x".repeat(60), "nats");
        assert_eq!(prefix.len(), MAX_VERSIONED_PREFIX_LEN);
        assert!(versioned_name(&prefix, 99999).len() <= MAX_NAME_LEN);
    }

    #[test]
    fn artifact_names_follow_convention() {
        assert_eq!(with_ops_prefix("nats"), "nats.with-ops");
        assert_eq!(desired_manifest_prefix("nats"), "nats.desired-manifest");
        assert_eq!(ig_resolved_prefix("nats", "nats_z1"), "nats.ig-resolved.nats-z1");
        assert_eq!(bpm_prefix("nats", "nats"), "nats.bpm.nats");
        assert_eq!(
            versioned_name(&ig_resolved_prefix("nats", "nats"), 3),
            "nats.ig-resolved.nats-v3"
        );
    }

    #[test]
    fn version_mark_is_not_a_version() {
        let prefix = with_ops_prefix(&"d".repeat(100));
        let mark = version_mark_name(&prefix);
        assert!(mark.len() <= MAX_NAME_LEN);
        assert_eq!(prefix_of(&mark), None);
    }

    #[test]
    fn prefix_of_inverts_versioned_name() {
        assert_eq!(prefix_of("nats.with-ops-v12"), Some("nats.with-ops"));
        assert_eq!(
            split_versioned_name("nats.ig-resolved.nats-v1"),
            Some(("nats.ig-resolved.nats", 1))
        );
        assert_eq!(prefix_of("nats.var-password"), None);
        assert_eq!(prefix_of("-v3"), None);
        assert_eq!(prefix_of("nats-vx"), None);
    }

    #[test]
    fn workload_names_are_dns_labels() {
        assert_eq!(instance_group_workload_name("my.dep", "nats_ig"), "my-dep-nats-ig");
        assert_eq!(dns_label(&["nats", "", "0"]), "nats-0");
    }
}
