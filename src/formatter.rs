//! `format`/`validate`/`migrate`: re-serialise catalogue files into a
//! canonical shape, check a catalogue parses and renders cleanly without
//! touching the network, and migrate a legacy per-architecture
//! `fetch.sha256` map onto the current `matrix.architectures` shape
//! (`ops2deb/formatter.py`, `ops2deb/migrate.py`).

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use semver::Version;
use tracing::instrument;

use crate::blueprint::{self, Architecture, Blueprint};
use crate::config::{ConfigurationFile, Resources};
use crate::error::Ops2debError;
use crate::fs as ofs;
use crate::lockfile::UrlAndHash;

const DESCRIPTION_WIDTH: usize = 79;

fn key(name: &str) -> serde_yaml::Value {
    serde_yaml::Value::String(name.to_string())
}

/// Re-serialise every configuration file with blueprints sorted by
/// `(name, version, revision)`, descriptions wrapped, and default-valued
/// or empty-list fields dropped. Returns the paths actually rewritten.
#[instrument(skip(resources))]
pub async fn format(resources: &Resources) -> crate::error::Result<Vec<std::path::PathBuf>> {
    let mut changed = Vec::new();
    for file in &resources.config_files {
        let formatted = format_document(file).map_err(Ops2debError::formatter)?;
        let original = ofs::read_buffered(&file.path)
            .await
            .map_err(Ops2debError::formatter)?
            .unwrap_or_default();
        if formatted.as_bytes() != original.as_slice() {
            ofs::write(&file.path, &formatted).await.map_err(Ops2debError::formatter)?;
            changed.push(file.path.clone());
        }
    }
    Ok(changed)
}

/// Build the canonical document text for one configuration file, without
/// touching disk.
fn format_document(file: &ConfigurationFile) -> Result<String> {
    let mut blueprints = file.blueprints.clone();
    blueprints.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    let nodes: Vec<serde_yaml::Value> = blueprints
        .iter()
        .map(format_blueprint_node)
        .collect::<Result<_>>()?;

    let root = if nodes.len() == 1 {
        nodes.into_iter().next().unwrap()
    } else {
        serde_yaml::Value::Sequence(nodes)
    };

    let dump = serde_yaml::to_string(&root).context("serialize formatted configuration")?;
    let mut lines: Vec<&str> = Vec::new();
    for (i, line) in dump.lines().enumerate() {
        if i > 0 && line.starts_with("- ") {
            lines.push("");
        }
        lines.push(line);
    }
    let mut text = lines.join("\n");
    text.push('\n');

    let default_lockfile = crate::config::default_lockfile_path(&file.path);
    if file.lockfile_path != default_lockfile {
        let relative = file
            .lockfile_path
            .strip_prefix(file.path.parent().unwrap_or_else(|| std::path::Path::new(".")))
            .unwrap_or(&file.lockfile_path);
        text = format!("# lockfile={}\n\n{text}", relative.display());
    }

    Ok(text)
}

fn sort_key(blueprint: &Blueprint) -> (String, Version, i64) {
    let version = Version::parse(blueprint.base_version()).unwrap_or_else(|_| Version::new(0, 0, 0));
    let revision = blueprint.revision.parse::<i64>().unwrap_or(1);
    (blueprint.name.clone(), version, revision)
}

/// Re-dump one blueprint through its (already-validated) [`Blueprint`]
/// model, wrapping its description and dropping default-valued or
/// empty-list fields, the way `format_blueprint` does in the original.
fn format_blueprint_node(blueprint: &Blueprint) -> Result<serde_yaml::Value> {
    let mut value = serde_yaml::to_value(blueprint).context("serialize blueprint")?;
    let mapping = value
        .as_mapping_mut()
        .ok_or_else(|| eyre!("blueprint did not serialize to a mapping"))?;

    if let Some(serde_yaml::Value::String(description)) = mapping.get(&key("description")).cloned() {
        mapping.insert(key("description"), serde_yaml::Value::String(wrap_description(&description)));
    }

    collapse_fetch_to_url(mapping);

    if mapping.get(&key("revision")).and_then(|v| v.as_str()) == Some("1") {
        mapping.remove(&key("revision"));
    }
    if mapping.get(&key("epoch")).and_then(|v| v.as_u64()) == Some(0) {
        mapping.remove(&key("epoch"));
    }

    let empty_keys: Vec<serde_yaml::Value> = mapping
        .iter()
        .filter(|(_, v)| is_empty_value(v))
        .map(|(k, _)| k.clone())
        .collect();
    for k in empty_keys {
        mapping.remove(&k);
    }

    Ok(value)
}

fn is_empty_value(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Null => true,
        serde_yaml::Value::Sequence(seq) => seq.is_empty(),
        serde_yaml::Value::Mapping(m) => m.is_empty(),
        _ => false,
    }
}

/// Collapse a `fetch: {url: ..., targets: {}}` node down to a bare url
/// string when there is no actual per-architecture remapping.
fn collapse_fetch_to_url(mapping: &mut serde_yaml::Mapping) {
    let Some(fetch) = mapping.get(&key("fetch")).cloned() else {
        return;
    };
    let Some(fetch_mapping) = fetch.as_mapping() else {
        return;
    };
    let has_targets = fetch_mapping
        .get(&key("targets"))
        .is_some_and(|t| t.as_mapping().is_some_and(|m| m.values().any(|v| !v.is_null())));
    if has_targets {
        return;
    }
    if let Some(url) = fetch_mapping.get(&key("url")).cloned() {
        mapping.insert(key("fetch"), url);
    }
}

fn wrap_description(description: &str) -> String {
    let trimmed = description.trim_matches(|c: char| c == '\n' || c == ' ');
    let mut out = Vec::new();
    for line in trimmed.split('\n') {
        let wrapped = wrap_line(line, DESCRIPTION_WIDTH);
        if wrapped.is_empty() {
            out.push(String::new());
        } else {
            out.extend(wrapped);
        }
    }
    out.join("\n")
}

fn wrap_line(line: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in line.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
        } else if current.len() + 1 + word.len() <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Load, resolve templates, and re-expand every blueprint's matrix
/// without fetching or materialising anything.
#[instrument(skip(resources))]
pub fn validate(resources: &Resources) -> crate::error::Result<()> {
    for blueprint in resources.blueprints() {
        for descriptor in blueprint::expand(blueprint) {
            descriptor.fetch_url().map_err(Ops2debError::parser)?;
        }
    }
    Ok(())
}

fn parse_architecture(name: &str) -> Option<Architecture> {
    match name {
        "all" => Some(Architecture::All),
        "amd64" => Some(Architecture::Amd64),
        "arm64" => Some(Architecture::Arm64),
        "armhf" => Some(Architecture::Armhf),
        _ => None,
    }
}

fn node_mapping_mut(file: &mut ConfigurationFile, index_in_file: usize) -> Result<&mut serde_yaml::Mapping> {
    let node = match &mut file.raw {
        serde_yaml::Value::Sequence(seq) => seq
            .get_mut(index_in_file)
            .ok_or_else(|| eyre!("blueprint index {index_in_file} out of range"))?,
        mapping @ serde_yaml::Value::Mapping(_) => mapping,
        other => return Err(eyre!("unexpected configuration document shape: {other:?}")),
    };
    node.as_mapping_mut()
        .ok_or_else(|| eyre!("blueprint node at index {index_in_file} is not a mapping"))
}

/// Rewrite one blueprint node's legacy `fetch.sha256` per-architecture
/// map onto `matrix.architectures`, returning the digests to seed into
/// the lockfile (keyed by their freshly rendered URL), or `None` if the
/// node has no legacy shape to migrate.
fn migrate_node(node: &mut serde_yaml::Mapping, blueprint: &Blueprint) -> Result<Option<Vec<UrlAndHash>>> {
    let Some(fetch) = node.get(&key("fetch")).cloned() else {
        return Ok(None);
    };
    let Some(fetch_mapping) = fetch.as_mapping() else {
        return Ok(None);
    };
    let Some(sha256_map) = fetch_mapping.get(&key("sha256")).and_then(|v| v.as_mapping()) else {
        return Ok(None);
    };

    let mut architectures = Vec::new();
    let mut pinned = Vec::new();
    for (arch_key, digest_value) in sha256_map {
        let (Some(arch_name), Some(digest)) = (arch_key.as_str(), digest_value.as_str()) else {
            continue;
        };
        let Some(architecture) = parse_architecture(arch_name) else {
            continue;
        };
        if let Ok(Some(url)) = blueprint.render_fetch_url(blueprint.base_version(), architecture) {
            pinned.push(UrlAndHash { url, sha256: digest.to_string() });
        }
        architectures.push(serde_yaml::Value::String(arch_name.to_string()));
    }

    let mut new_fetch_mapping = fetch_mapping.clone();
    new_fetch_mapping.remove(&key("sha256"));
    let has_targets = new_fetch_mapping
        .get(&key("targets"))
        .is_some_and(|t| t.as_mapping().is_some_and(|m| !m.is_empty()));
    let new_fetch = if has_targets {
        serde_yaml::Value::Mapping(new_fetch_mapping)
    } else {
        new_fetch_mapping
            .get(&key("url"))
            .cloned()
            .unwrap_or(serde_yaml::Value::Mapping(new_fetch_mapping))
    };
    node.insert(key("fetch"), new_fetch);

    let mut matrix = node
        .get(&key("matrix"))
        .and_then(|m| m.as_mapping().cloned())
        .unwrap_or_default();
    matrix.insert(key("architectures"), serde_yaml::Value::Sequence(architectures));
    node.insert(key("matrix"), serde_yaml::Value::Mapping(matrix));

    Ok(Some(pinned))
}

/// Migrate every blueprint with a legacy `fetch.sha256` map, seeding the
/// lockfile from the old inline digests, and persist the result. Returns
/// the number of blueprints migrated.
#[instrument(skip(resources))]
pub async fn migrate(resources: &mut Resources) -> crate::error::Result<usize> {
    let migrated = migrate_inner(resources).map_err(Ops2debError::formatter)?;
    if migrated > 0 {
        resources.save().await?;
    }
    Ok(migrated)
}

fn migrate_inner(resources: &mut Resources) -> Result<usize> {
    let uids: Vec<u64> = resources.blueprints().map(|b| b.uid).collect();
    let mut migrated = 0usize;

    for uid in uids {
        let Some(blueprint) = resources.blueprints().find(|b| b.uid == uid).cloned() else {
            continue;
        };

        let outcome = {
            let file = resources
                .config_file_for_uid_mut(uid)
                .ok_or_else(|| eyre!("no configuration file for blueprint {}", blueprint.name))?;
            let mapping = node_mapping_mut(file, blueprint.index_in_file)?;
            let outcome = migrate_node(mapping, &blueprint)?;
            if outcome.is_some() {
                file.tainted = true;
            }
            outcome
        };

        let Some(pinned) = outcome else {
            continue;
        };
        if let Some(lock) = resources.lock_for_uid_mut(uid) {
            lock.add(pinned);
        }
        migrated += 1;
    }

    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blueprint_from(yaml: &str) -> Blueprint {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        blueprint::from_value(value, 0).unwrap()
    }

    #[test]
    fn wrap_description_preserves_blank_lines() {
        let text = wrap_description("line one\n\nline two");
        assert_eq!(text, "line one\n\nline two");
    }

    #[test]
    fn wrap_description_wraps_long_lines() {
        let long = "word ".repeat(30);
        let wrapped = wrap_description(long.trim());
        assert!(wrapped.lines().all(|l| l.len() <= DESCRIPTION_WIDTH));
    }

    #[test]
    fn format_blueprint_node_drops_default_revision_and_empty_lists() {
        let bp = blueprint_from("name: x\nversion: '1.0'\nsummary: s\n");
        let node = format_blueprint_node(&bp).unwrap();
        let mapping = node.as_mapping().unwrap();
        assert!(!mapping.contains_key(key("revision")));
        assert!(!mapping.contains_key(key("depends")));
        assert_eq!(mapping.get(key("name")).and_then(|v| v.as_str()), Some("x"));
    }

    #[test]
    fn format_blueprint_node_collapses_targetless_fetch() {
        let bp = blueprint_from("name: x\nversion: '1.0'\nsummary: s\nfetch:\n  url: http://h/{{version}}\n");
        let node = format_blueprint_node(&bp).unwrap();
        let mapping = node.as_mapping().unwrap();
        assert_eq!(
            mapping.get(key("fetch")).and_then(|v| v.as_str()),
            Some("http://h/{{version}}")
        );
    }

    #[test]
    fn sort_key_falls_back_to_zero_version_for_non_semver() {
        let bp = blueprint_from("name: x\nversion: not-semver\nsummary: s\n");
        let (name, version, revision) = sort_key(&bp);
        assert_eq!(name, "x");
        assert_eq!(version, Version::new(0, 0, 0));
        assert_eq!(revision, 1);
    }

    #[test]
    fn migrate_node_extracts_legacy_sha256_map() {
        let bp = blueprint_from(
            "name: x\nversion: '1.0'\nsummary: s\nfetch:\n  url: http://h/{{version}}_{{target}}\n",
        );
        let yaml = "name: x\nversion: '1.0'\nsummary: s\nfetch:\n  url: http://h/{{version}}_{{target}}\n  sha256:\n    amd64: aaaa\n    arm64: bbbb\n";
        let mut value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let mapping = value.as_mapping_mut().unwrap();

        let pinned = migrate_node(mapping, &bp).unwrap().unwrap();
        assert_eq!(pinned.len(), 2);

        let matrix = mapping.get(key("matrix")).unwrap().as_mapping().unwrap();
        let architectures: Vec<&str> = matrix
            .get(key("architectures"))
            .unwrap()
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(architectures.len(), 2);

        let fetch = mapping.get(key("fetch")).unwrap();
        assert!(fetch.as_mapping().is_some());
        assert!(!fetch.as_mapping().unwrap().contains_key(key("sha256")));
    }

    #[test]
    fn migrate_node_is_a_noop_without_legacy_sha256() {
        let bp = blueprint_from("name: x\nversion: '1.0'\nsummary: s\nfetch:\n  url: http://h/x\n");
        let yaml = "name: x\nversion: '1.0'\nsummary: s\nfetch:\n  url: http://h/x\n";
        let mut value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let mapping = value.as_mapping_mut().unwrap();
        assert!(migrate_node(mapping, &bp).unwrap().is_none());
    }
}
