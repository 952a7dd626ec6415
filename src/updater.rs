//! The updater: probes upstreams for newer versions and, for each
//! blueprint that moved, re-pins the lockfile and rewrites the raw
//! catalogue document in place (§4.H).

use std::collections::HashMap;
use std::time::Duration;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use lazy_regex::regex_captures;
use semver::Version;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::blueprint::Blueprint;
use crate::config::{ConfigurationFile, Resources};
use crate::error::Ops2debError;
use crate::fetch::Fetcher;
use crate::lockfile::UrlAndHash;
use crate::progress::TransferBar;

/// Options controlling which blueprints are probed and how aggressively
/// the catalogue keeps old versions around.
#[derive(Clone, Debug)]
pub struct UpdateOptions {
    pub skip: Vec<String>,
    pub only: Vec<String>,
    pub max_versions: usize,
    pub dry_run: bool,
}

/// One line of the updater's summary, emitted to `--output-file` or
/// stdout by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Updated { name: String, from: String, to: String },
    Added { name: String, version: String },
    Removed { name: String, version: String },
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::Updated { name, from, to } => write!(f, "Update {name} from {from} to {to}"),
            Change::Added { name, version } => write!(f, "Add {name} {version}"),
            Change::Removed { name, version } => write!(f, "Remove {name} {version}"),
        }
    }
}

/// Run the full `update` pipeline, returning the summary of catalogue
/// changes. Per-blueprint probing/fetch failures are logged and skip that
/// blueprint; they do not abort the run.
#[instrument(skip(resources))]
pub async fn update(
    resources: &mut Resources,
    cache_dir: &std::path::Path,
    concurrency: usize,
    options: &UpdateOptions,
) -> crate::error::Result<Vec<Change>> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("build HTTP client")
        .map_err(Ops2debError::updater)?;

    let candidates = select_candidates(resources, options);

    let mut new_versions: HashMap<u64, (Blueprint, String)> = HashMap::new();
    for blueprint in candidates {
        match probe(&http, &blueprint).await {
            Ok(new_version) if new_version != blueprint.base_version() => {
                new_versions.insert(blueprint.uid, (blueprint, new_version));
            }
            Ok(_) => debug!(name = %blueprint.name, "already at latest version"),
            Err(err) => warn!(name = %blueprint.name, error = %err, "update probe failed"),
        }
    }

    if new_versions.is_empty() {
        return Ok(Vec::new());
    }

    let mut fetcher: Fetcher<u64> =
        Fetcher::new(cache_dir.to_path_buf(), concurrency).map_err(Ops2debError::fetcher)?;
    for (uid, (blueprint, new_version)) in &new_versions {
        let urls = blueprint
            .render_fetch_urls_for_version(new_version)
            .map_err(Ops2debError::updater)?;
        for url in urls {
            fetcher.add_task(url, *uid, None);
        }
    }
    let progress = (fetcher.task_count() > 0).then(|| TransferBar::new(fetcher.task_count() as u64, "Probing new versions"));
    let (results, failures) = fetcher.run_tasks_with_progress(progress.as_ref()).await;

    let mut failed_uids = std::collections::HashSet::new();
    for failure in &failures {
        warn!(url = %failure.url, error = %failure.error, "failed to fetch new version, skipping blueprint");
        failed_uids.insert(failure.task_data);
    }

    let mut results_by_uid: HashMap<u64, Vec<UrlAndHash>> = HashMap::new();
    for result in results {
        results_by_uid.entry(result.task_data).or_default().push(UrlAndHash {
            url: result.url,
            sha256: result.sha256,
        });
    }

    let mut changes = Vec::new();
    for (uid, (blueprint, new_version)) in new_versions {
        if failed_uids.contains(&uid) {
            continue;
        }
        let Some(fetched) = results_by_uid.remove(&uid) else {
            continue;
        };

        if let Some(lock) = resources.lock_for_uid_mut(uid) {
            lock.add(fetched);
        }

        let removed_versions = match rewrite_configuration(resources, uid, &blueprint, &new_version, options.max_versions) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(name = %blueprint.name, error = %err, "failed to rewrite catalogue entry");
                continue;
            }
        };

        for removed_version in &removed_versions {
            if let Ok(urls) = blueprint.render_fetch_urls_for_version(removed_version) {
                if let Some(lock) = resources.lock_for_uid_mut(uid) {
                    lock.remove(urls);
                }
            }
        }

        if options.max_versions <= 1 {
            changes.push(Change::Updated {
                name: blueprint.name.clone(),
                from: blueprint.base_version().to_string(),
                to: new_version,
            });
        } else {
            changes.push(Change::Added {
                name: blueprint.name.clone(),
                version: new_version,
            });
            for removed_version in removed_versions {
                changes.push(Change::Removed {
                    name: blueprint.name.clone(),
                    version: removed_version,
                });
            }
        }
    }

    if !options.dry_run {
        resources.save().await?;
    }

    Ok(changes)
}

/// Honour `--skip`/`--only`, then deduplicate so only the last blueprint
/// sharing a `name` is probed (matching the last-wins rule in §4.H).
fn select_candidates(resources: &Resources, options: &UpdateOptions) -> Vec<Blueprint> {
    let mut by_name: HashMap<String, Blueprint> = HashMap::new();
    for blueprint in resources.blueprints() {
        if !options.only.is_empty() && !options.only.contains(&blueprint.name) {
            continue;
        }
        if options.skip.contains(&blueprint.name) {
            continue;
        }
        by_name.insert(blueprint.name.clone(), blueprint.clone());
    }
    let mut candidates: Vec<Blueprint> = by_name.into_values().collect();
    candidates.sort_by(|a, b| a.uid.cmp(&b.uid));
    candidates
}

/// Try each strategy in order; the first to find a candidate wins. A
/// strategy that errors (transport failure, unparseable response) doesn't
/// abort the probe — it's logged and the next strategy gets a turn, same
/// as the original's per-strategy catch-and-continue.
async fn probe(http: &reqwest::Client, blueprint: &Blueprint) -> Result<String> {
    match github_strategy(http, blueprint).await {
        Ok(Some(version)) => return Ok(version),
        Ok(None) => {}
        Err(err) => warn!(name = %blueprint.name, error = %err, "github release strategy failed, trying next"),
    }
    match generic_strategy(http, blueprint).await {
        Ok(Some(version)) => return Ok(version),
        Ok(None) => {}
        Err(err) => warn!(name = %blueprint.name, error = %err, "generic probing strategy failed, trying next"),
    }
    Ok(blueprint.base_version().to_string())
}

#[derive(Deserialize)]
struct GithubRelease {
    tag_name: String,
}

/// GitHub releases strategy: applies only when the blueprint's rendered
/// fetch URL is hosted on `github.com`.
async fn github_strategy(http: &reqwest::Client, blueprint: &Blueprint) -> Result<Option<String>> {
    let Some(url) = blueprint
        .render_fetch_url(blueprint.base_version(), blueprint.base_architecture())
        .context("render current fetch url")?
    else {
        return Ok(None);
    };
    let Some((_, owner, name)) = regex_captures!(r"^https://github\.com/([\w-]+)/([\w-]+)/", &url) else {
        return Ok(None);
    };

    let api_url = format!("https://api.github.com/repos/{owner}/{name}/releases/latest");
    let mut request = http
        .get(&api_url)
        .header("Accept", "application/vnd.github.v3+json")
        .header("User-Agent", "ops2deb");
    if let Ok(token) = std::env::var("OPS2DEB_GITHUB_TOKEN") {
        request = request.bearer_auth(token);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return Err(eyre!("GitHub API request failed: {err}")),
    };
    if !response.status().is_success() {
        return Ok(None);
    }
    let release: GithubRelease = response.json().await.context("parse GitHub release JSON")?;
    let tag = release.tag_name.strip_prefix('v').unwrap_or(&release.tag_name);

    let candidate = match (Version::parse(tag), Version::parse(blueprint.base_version())) {
        (Ok(tag_version), Ok(current)) => std::cmp::max(tag_version, current).to_string(),
        (Ok(_), Err(_)) => tag.to_string(),
        _ => return Ok(None),
    };

    if !try_version(blueprint, &candidate, http).await? {
        return Ok(None);
    }
    Ok(Some(candidate))
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Part {
    Major,
    Minor,
    Patch,
}

/// Generic upstream URL probing: only applies to blueprints whose current
/// version is valid semver. Bumps minor then patch — a miss on the minor
/// phase gets up to 3 consecutive patch-level "gap skipping" probes past
/// it before giving up; the patch phase never gap-skips, since a missed
/// patch bump is already the finest-grained probe — then retries against
/// major if neither moved the version.
async fn generic_strategy(http: &reqwest::Client, blueprint: &Blueprint) -> Result<Option<String>> {
    let Ok(current) = Version::parse(blueprint.base_version()) else {
        return Ok(None);
    };

    let mut best = current.clone();
    for part in [Part::Minor, Part::Patch] {
        best = probe_part(http, blueprint, &best, part).await?;
    }
    if best == current {
        best = probe_part(http, blueprint, &best, Part::Major).await?;
    }
    if best == current {
        return Ok(None);
    }
    Ok(Some(best.to_string()))
}

const MAX_GAP_SKIPS: u32 = 3;

async fn probe_part(http: &reqwest::Client, blueprint: &Blueprint, start: &Version, part: Part) -> Result<Version> {
    let mut best = start.clone();
    loop {
        let candidate = bump(&best, part);
        if try_version(blueprint, &candidate.to_string(), http).await? {
            best = candidate;
            continue;
        }

        // A miss on a minor/major bump doesn't mean the upstream stopped
        // releasing; it may have jumped straight to a later patch. Skip
        // ahead a few patches off the failed candidate before giving up.
        // The patch phase itself never gap-skips: a missed patch bump
        // already IS the finest-grained probe.
        if part == Part::Patch {
            return Ok(best);
        }

        let mut skipped = candidate.clone();
        let mut found_after_gap = false;
        for _ in 0..MAX_GAP_SKIPS {
            skipped = bump(&skipped, Part::Patch);
            if try_version(blueprint, &skipped.to_string(), http).await? {
                best = skipped.clone();
                found_after_gap = true;
                break;
            }
        }
        if !found_after_gap {
            return Ok(best);
        }
    }
}

fn bump(version: &Version, part: Part) -> Version {
    let mut next = version.clone();
    match part {
        Part::Major => {
            next.major += 1;
            next.minor = 0;
            next.patch = 0;
        }
        Part::Minor => {
            next.minor += 1;
            next.patch = 0;
        }
        Part::Patch => next.patch += 1,
    }
    next
}

/// HEAD the rendered fetch URL for `version`, returning whether it
/// exists. Trivially `false` if the URL doesn't change with version (no
/// placeholder) or the blueprint has no fetch.
async fn try_version(blueprint: &Blueprint, version: &str, http: &reqwest::Client) -> Result<bool> {
    let current_url = blueprint
        .render_fetch_url(blueprint.base_version(), blueprint.base_architecture())
        .context("render current fetch url")?;
    let Some(candidate_url) = blueprint
        .render_fetch_url(version, blueprint.base_architecture())
        .context("render candidate fetch url")?
    else {
        return Ok(false);
    };
    if Some(&candidate_url) == current_url.as_ref() {
        return Ok(false);
    }

    let response = match http.head(&candidate_url).send().await {
        Ok(response) => response,
        Err(err) => return Err(eyre!("Failed HEAD request to {candidate_url}. {err}")),
    };
    let status = response.status();
    if status.is_server_error() {
        return Err(eyre!("Server error when requesting {candidate_url}"));
    }
    Ok(status.is_success() || status.is_redirection())
}

/// Mutate the raw YAML node for `uid`'s blueprint per §4.H step 3,
/// returning the versions dropped from it (so their lockfile entries can
/// be removed too).
fn rewrite_configuration(
    resources: &mut Resources,
    uid: u64,
    blueprint: &Blueprint,
    new_version: &str,
    max_versions: usize,
) -> Result<Vec<String>> {
    let index_in_file = blueprint.index_in_file;
    let file = resources
        .config_file_for_uid_mut(uid)
        .ok_or_else(|| eyre!("no configuration file for blueprint {}", blueprint.name))?;

    let mapping = node_mapping_mut(file, index_in_file)?;
    let removed = if max_versions <= 1 {
        apply_single_version_update(mapping, new_version)?
    } else {
        apply_matrix_version_update(mapping, new_version, max_versions)?
    };
    file.tainted = true;
    Ok(removed)
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

fn key(name: &str) -> serde_yaml::Value {
    serde_yaml::Value::String(name.to_string())
}

fn apply_single_version_update(mapping: &mut serde_yaml::Mapping, new_version: &str) -> Result<Vec<String>> {
    let mut removed = Vec::new();

    if let Some(matrix) = mapping.get_mut(key("matrix")).and_then(|m| m.as_mapping_mut()) {
        if let Some(versions) = matrix.remove(key("versions")) {
            if let Some(seq) = versions.as_sequence() {
                removed.extend(seq.iter().filter_map(|v| v.as_str().map(str::to_string)));
            }
        }
    } else if let Some(version) = mapping.remove(key("version")) {
        if let Some(v) = version.as_str() {
            removed.push(v.to_string());
        }
    }

    mapping.insert(key("version"), serde_yaml::Value::String(new_version.to_string()));
    mapping.remove(key("revision"));
    reorder_keys(mapping, &["name", "matrix", "version"]);
    Ok(removed)
}

fn apply_matrix_version_update(
    mapping: &mut serde_yaml::Mapping,
    new_version: &str,
    max_versions: usize,
) -> Result<Vec<String>> {
    let mut removed = Vec::new();

    let scalar_version = mapping.remove(key("version"));

    let matrix_key = key("matrix");
    if !mapping.contains_key(&matrix_key) {
        mapping.insert(matrix_key.clone(), serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    }
    let matrix = mapping
        .get_mut(&matrix_key)
        .and_then(|m| m.as_mapping_mut())
        .ok_or_else(|| eyre!("`matrix` is not a mapping"))?;

    let versions_key = key("versions");
    let mut versions: Vec<String> = match matrix.get(&versions_key).and_then(|v| v.as_sequence()) {
        Some(seq) => seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        None => Vec::new(),
    };

    if versions.is_empty() {
        if let Some(v) = scalar_version.as_ref().and_then(|v| v.as_str()) {
            versions.push(v.to_string());
        }
    }
    versions.push(new_version.to_string());

    while versions.len() > max_versions {
        removed.push(versions.remove(0));
    }

    matrix.insert(
        versions_key,
        serde_yaml::Value::Sequence(versions.into_iter().map(serde_yaml::Value::String).collect()),
    );
    reorder_keys(mapping, &["name", "matrix", "version"]);
    Ok(removed)
}

/// Reorder `mapping`'s keys so `preferred` come first (in that order,
/// skipping any absent), followed by every other key in its original
/// relative order.
fn reorder_keys(mapping: &mut serde_yaml::Mapping, preferred: &[&str]) {
    let mut ordered = serde_yaml::Mapping::new();
    for name in preferred {
        let k = key(name);
        if let Some(value) = mapping.remove(&k) {
            ordered.insert(k, value);
        }
    }
    for (k, v) in mapping.iter() {
        ordered.insert(k.clone(), v.clone());
    }
    *mapping = ordered;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_resets_lower_parts() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!(bump(&v, Part::Patch), Version::parse("1.2.4").unwrap());
        assert_eq!(bump(&v, Part::Minor), Version::parse("1.3.0").unwrap());
        assert_eq!(bump(&v, Part::Major), Version::parse("2.0.0").unwrap());
    }

    #[test]
    fn single_version_update_drops_revision_and_reorders() {
        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert(key("summary"), serde_yaml::Value::String("s".into()));
        mapping.insert(key("name"), serde_yaml::Value::String("x".into()));
        mapping.insert(key("version"), serde_yaml::Value::String("1.0.0".into()));
        mapping.insert(key("revision"), serde_yaml::Value::String("2".into()));

        let removed = apply_single_version_update(&mut mapping, "1.1.0").unwrap();
        assert_eq!(removed, vec!["1.0.0".to_string()]);
        assert!(!mapping.contains_key(key("revision")));
        assert_eq!(
            mapping.get(key("version")).and_then(|v| v.as_str()),
            Some("1.1.0")
        );
        let keys: Vec<&str> = mapping.keys().filter_map(|k| k.as_str()).collect();
        assert_eq!(keys[0], "name");
        assert_eq!(keys[1], "version");
    }

    #[test]
    fn matrix_version_update_seeds_from_scalar_and_caps_length() {
        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert(key("name"), serde_yaml::Value::String("x".into()));
        mapping.insert(key("version"), serde_yaml::Value::String("1.0.0".into()));

        let removed = apply_matrix_version_update(&mut mapping, "1.1.0", 1).unwrap();
        assert_eq!(removed, vec!["1.0.0".to_string()]);
        let matrix = mapping.get(key("matrix")).unwrap().as_mapping().unwrap();
        let versions: Vec<&str> = matrix
            .get(key("versions"))
            .unwrap()
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(versions, vec!["1.1.0"]);
        assert!(!mapping.contains_key(key("version")));
    }

    #[test]
    fn change_display_matches_spec_format() {
        assert_eq!(
            Change::Updated {
                name: "x".into(),
                from: "1.0".into(),
                to: "1.1".into()
            }
            .to_string(),
            "Update x from 1.0 to 1.1"
        );
        assert_eq!(Change::Added { name: "x".into(), version: "1.1".into() }.to_string(), "Add x 1.1");
        assert_eq!(
            Change::Removed { name: "x".into(), version: "1.0".into() }.to_string(),
            "Remove x 1.0"
        );
    }
}
