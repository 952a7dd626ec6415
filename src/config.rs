//! The configuration store: loads one or more YAML catalogue files (glob
//! expansion), the lockfile each is associated with, and validates every
//! document into blueprints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use lazy_regex::regex_captures;
use tracing::{debug, instrument};

use crate::blueprint::{self, Blueprint};
use crate::error::Ops2debError;
use crate::fs as ofs;
use crate::lockfile::Lock;

/// One loaded YAML catalogue file: its raw document (for in-place mutation
/// by the updater), the blueprints validated from it, and the lockfile
/// path it is associated with.
#[derive(Debug)]
pub struct ConfigurationFile {
    pub path: PathBuf,
    pub lockfile_path: PathBuf,
    /// The parsed document root, kept around so the updater can mutate
    /// individual blueprint nodes in place (§4.H) without disturbing the
    /// rest of the file's key order.
    pub raw: serde_yaml::Value,
    pub blueprints: Vec<Blueprint>,
    /// Set once `raw` has been mutated; only tainted files are rewritten
    /// by [`Resources::save`].
    pub tainted: bool,
}

impl ConfigurationFile {
    async fn save(&self) -> Result<()> {
        if !self.tainted {
            return Ok(());
        }
        let yaml = serde_yaml::to_string(&self.raw).context("serialize configuration")?;
        let tmp = self.path.with_extension("yml.tmp");
        ofs::write(&tmp, yaml.as_bytes()).await.context("write config tmp")?;
        ofs::rename(&tmp, &self.path).await.context("rename config into place")?;
        debug!(path = ?self.path, "saved configuration file");
        Ok(())
    }
}

/// The aggregate of everything `load_resources` discovered: every
/// configuration file, every distinct lockfile, and a lookup from a
/// blueprint's `uid` back to its origin.
#[derive(Debug)]
pub struct Resources {
    pub config_files: Vec<ConfigurationFile>,
    pub locks: HashMap<PathBuf, Lock>,
    /// blueprint `uid` -> (index into `config_files`, lockfile path)
    origin: HashMap<u64, (usize, PathBuf)>,
}

impl Resources {
    /// Iterate every blueprint across every loaded configuration file.
    pub fn blueprints(&self) -> impl Iterator<Item = &Blueprint> {
        self.config_files.iter().flat_map(|f| f.blueprints.iter())
    }

    /// Iterate every blueprint, mutably, across every loaded file.
    pub fn blueprints_mut(&mut self) -> impl Iterator<Item = &mut Blueprint> {
        self.config_files.iter_mut().flat_map(|f| f.blueprints.iter_mut())
    }

    /// The lockfile owning the blueprint with the given `uid`.
    pub fn lock_for_uid(&self, uid: u64) -> Option<&Lock> {
        let (_, lockfile_path) = self.origin.get(&uid)?;
        self.locks.get(lockfile_path)
    }

    /// The lockfile owning the blueprint with the given `uid`, mutably.
    pub fn lock_for_uid_mut(&mut self, uid: u64) -> Option<&mut Lock> {
        let (_, lockfile_path) = self.origin.get(&uid)?.clone();
        self.locks.get_mut(&lockfile_path)
    }

    /// The configuration file owning the blueprint with the given `uid`.
    pub fn config_file_for_uid(&self, uid: u64) -> Option<&ConfigurationFile> {
        let (idx, _) = self.origin.get(&uid)?;
        self.config_files.get(*idx)
    }

    /// The configuration file owning the blueprint with the given `uid`,
    /// mutably.
    pub fn config_file_for_uid_mut(&mut self, uid: u64) -> Option<&mut ConfigurationFile> {
        let (idx, _) = *self.origin.get(&uid)?;
        self.config_files.get_mut(idx)
    }

    /// Flush every tainted configuration file and every tainted lockfile.
    /// Called at most once per process invocation.
    #[instrument(skip(self))]
    pub async fn save(&mut self) -> crate::error::Result<()> {
        for file in &self.config_files {
            file.save().await.map_err(Ops2debError::parser)?;
        }
        for lock in self.locks.values_mut() {
            lock.save().await.map_err(Ops2debError::lockfile)?;
        }
        Ok(())
    }
}

/// Load and validate every blueprint matched by `glob_pattern`, along with
/// the lockfiles they reference.
#[instrument]
pub async fn load_resources(glob_pattern: &str) -> crate::error::Result<Resources> {
    load_resources_inner(glob_pattern)
        .await
        .map_err(Ops2debError::parser)
}

async fn load_resources_inner(glob_pattern: &str) -> Result<Resources> {
    let mut paths: Vec<PathBuf> = glob::glob(glob_pattern)
        .context("invalid glob pattern")?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter(|path| !is_lockfile_name(path))
        .collect();
    paths.sort();

    if paths.is_empty() {
        bail!("no configuration files matched {glob_pattern:?}");
    }

    let mut config_files = Vec::with_capacity(paths.len());
    for path in &paths {
        config_files.push(load_one_file(path).await.with_context(|| format!("load {path:?}"))?);
    }

    let mut locks = HashMap::new();
    for file in &config_files {
        if locks.contains_key(&file.lockfile_path) {
            continue;
        }
        let lock = Lock::load(file.lockfile_path.clone())
            .await
            .with_context(|| format!("load lockfile {:?}", file.lockfile_path))?;
        locks.insert(file.lockfile_path.clone(), lock);
    }

    let mut origin = HashMap::new();
    let mut next_uid = 0u64;
    for (idx, file) in config_files.iter_mut().enumerate() {
        for blueprint in &mut file.blueprints {
            blueprint.uid = next_uid;
            origin.insert(next_uid, (idx, file.lockfile_path.clone()));
            next_uid += 1;
        }
    }

    debug!(
        files = config_files.len(),
        locks = locks.len(),
        blueprints = next_uid,
        "loaded resources"
    );
    Ok(Resources {
        config_files,
        locks,
        origin,
    })
}

fn is_lockfile_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".lock.yml") || n.ends_with(".lock.yaml"))
}

async fn load_one_file(path: &Path) -> Result<ConfigurationFile> {
    let bytes = ofs::read_buffered(path)
        .await
        .context("read configuration file")?
        .ok_or_else(|| color_eyre::eyre::eyre!("file not found: {path:?}"))?;
    let text = String::from_utf8(bytes).context("configuration file is not valid UTF-8")?;

    let lockfile_path = resolve_lockfile_path(path, &text);

    let raw: serde_yaml::Value = serde_yaml::from_str(&text).context("parse YAML")?;
    let nodes: Vec<serde_yaml::Value> = match &raw {
        serde_yaml::Value::Sequence(seq) => seq.clone(),
        serde_yaml::Value::Mapping(_) => vec![raw.clone()],
        other => bail!("document root must be a mapping or a list of mappings, got {other:?}"),
    };

    let mut blueprints = Vec::with_capacity(nodes.len());
    for (index, node) in nodes.into_iter().enumerate() {
        let blueprint = blueprint::from_value(node, index)
            .with_context(|| format!("{path:?}: blueprint at index {index}"))?;
        blueprints.push(blueprint);
    }

    Ok(ConfigurationFile {
        path: path.to_path_buf(),
        lockfile_path,
        raw,
        blueprints,
        tainted: false,
    })
}

/// Resolve the lockfile path for a configuration file: a first-line
/// comment `# lockfile=<relative path>` overrides the default
/// `<name>.lock.yml` sibling.
fn resolve_lockfile_path(config_path: &Path, text: &str) -> PathBuf {
    let first_non_blank = text.lines().find(|line| !line.trim().is_empty());
    let parent = config_path.parent().unwrap_or_else(|| Path::new("."));

    if let Some(line) = first_non_blank {
        if let Some((_, rel)) = regex_captures!(r"^#\s*lockfile=(.+)$", line.trim()) {
            return parent.join(rel.trim());
        }
    }

    default_lockfile_path(config_path)
}

pub fn default_lockfile_path(config_path: &Path) -> PathBuf {
    let parent = config_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = config_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("ops2deb");
    parent.join(format!("{stem}.lock.yml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn default_lockfile_sits_next_to_config() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("ops2deb.yml");
        tokio::fs::write(&config, "name: x\nversion: '1.0'\nsummary: s\n")
            .await
            .unwrap();
        let file = load_one_file(&config).await.unwrap();
        assert_eq!(file.lockfile_path, dir.path().join("ops2deb.lock.yml"));
    }

    #[tokio::test]
    async fn lockfile_comment_overrides_default() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("ops2deb.yml");
        tokio::fs::write(
            &config,
            "# lockfile=custom.lock.yml\nname: x\nversion: '1.0'\nsummary: s\n",
        )
        .await
        .unwrap();
        let file = load_one_file(&config).await.unwrap();
        assert_eq!(file.lockfile_path, dir.path().join("custom.lock.yml"));
    }

    #[tokio::test]
    async fn empty_glob_is_parser_error() {
        let dir = tempdir().unwrap();
        let pattern = dir.path().join("*.yml");
        let result = load_resources(pattern.to_str().unwrap()).await;
        assert!(matches!(result, Err(Ops2debError::Parser(_))));
    }

    #[tokio::test]
    async fn loads_a_list_of_blueprints_with_sequential_uids() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("ops2deb.yml");
        tokio::fs::write(
            &config,
            "- name: a\n  version: '1.0'\n  summary: s\n- name: b\n  version: '1.0'\n  summary: s\n",
        )
        .await
        .unwrap();
        let resources = load_resources(config.to_str().unwrap()).await.unwrap();
        let uids: Vec<u64> = resources.blueprints().map(|b| b.uid).collect();
        assert_eq!(uids, vec![0, 1]);
    }
}
