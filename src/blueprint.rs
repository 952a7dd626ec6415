//! The blueprint model: a validated description of one Debian source
//! package (or, via a matrix, a family of them).

use std::collections::BTreeSet;
use std::fmt;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use itertools::iproduct;
use lazy_regex::regex_is_match;
use serde::{Deserialize, Serialize};

use crate::template::{self, Context as TplContext};

/// A Debian architecture name recognised by ops2deb.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    All,
    Amd64,
    Arm64,
    Armhf,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Architecture::All => "all",
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Armhf => "armhf",
        };
        f.write_str(s)
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::Amd64
    }
}

/// `fetch.targets`: per-architecture remapping of the `target` template
/// variable, used when an upstream's URL spells architectures differently
/// than Debian does.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchTargets {
    pub amd64: Option<String>,
    pub arm64: Option<String>,
    pub armhf: Option<String>,
}

impl FetchTargets {
    fn get(&self, arch: Architecture) -> Option<&str> {
        match arch {
            Architecture::Amd64 => self.amd64.as_deref(),
            Architecture::Arm64 => self.arm64.as_deref(),
            Architecture::Armhf => self.armhf.as_deref(),
            Architecture::All => None,
        }
    }
}

/// The `fetch` field: absent, a bare URL template string, or an object
/// naming the URL plus an architecture remapping.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fetch {
    Url(String),
    WithTargets {
        url: String,
        #[serde(default)]
        targets: FetchTargets,
    },
}

impl Fetch {
    fn url(&self) -> &str {
        match self {
            Fetch::Url(url) => url,
            Fetch::WithTargets { url, .. } => url,
        }
    }

    fn target_for(&self, arch: Architecture) -> Option<&str> {
        match self {
            Fetch::Url(_) => None,
            Fetch::WithTargets { targets, .. } => targets.get(arch),
        }
    }
}

/// One entry of `blueprint.install`: either a rendered here-document
/// written to a destination path, or a copy of an existing path.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstallEntry {
    HereDoc { content: String, path: String },
    Copy(String),
}

/// One entry of `blueprint.matrix`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Matrix {
    #[serde(default)]
    pub architectures: Vec<Architecture>,
    #[serde(default)]
    pub versions: Vec<String>,
}

/// A validated blueprint: the central entity of the catalogue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Blueprint {
    pub name: String,
    pub version: Option<String>,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub architecture: Option<Architecture>,
    #[serde(default)]
    pub homepage: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub recommends: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub replaces: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub build_depends: Vec<String>,

    #[serde(default)]
    pub matrix: Matrix,

    #[serde(default)]
    pub fetch: Option<Fetch>,
    #[serde(default)]
    pub install: Vec<InstallEntry>,
    #[serde(default)]
    pub script: Vec<String>,

    /// Unique across every blueprint loaded in the same process.
    #[serde(skip)]
    pub uid: u64,

    /// Position of this blueprint within its source file.
    #[serde(skip)]
    pub index_in_file: usize,
}

fn default_revision() -> String {
    "1".to_string()
}

impl Blueprint {
    /// Validate invariants that the serde shape alone cannot express:
    /// mutual exclusion of `architecture`/`matrix.architectures` and of
    /// `version`/`matrix.versions`, non-emptiness of `name`, the
    /// `revision` grammar, and that every `install` copy pair has
    /// exactly one `:` separator.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("blueprint name must not be empty");
        }
        if !regex_is_match!(r"^[1-9][a-z0-9+~]*$", &self.revision) {
            bail!("invalid revision {:?} for blueprint {}", self.revision, self.name);
        }
        if self.architecture.is_some() && !self.matrix.architectures.is_empty() {
            bail!(
                "blueprint {}: `architecture` and `matrix.architectures` are mutually exclusive",
                self.name
            );
        }
        if self.version.is_some() && !self.matrix.versions.is_empty() {
            bail!(
                "blueprint {}: `version` and `matrix.versions` are mutually exclusive",
                self.name
            );
        }
        if self.version.is_none() && self.matrix.versions.is_empty() {
            bail!(
                "blueprint {}: one of `version` or `matrix.versions` is required",
                self.name
            );
        }
        for entry in &self.install {
            if let InstallEntry::Copy(pair) = entry {
                let colons = pair.matches(':').count();
                if colons != 1 {
                    bail!(
                        "blueprint {}: install copy pair {pair:?} must have exactly one ':' separator",
                        self.name
                    );
                }
            }
        }
        Ok(())
    }

    /// The effective `version` field after the `matrix.versions` fallback
    /// described in §3: when a matrix of versions is present, `version`
    /// defaults to the last one.
    pub fn base_version(&self) -> &str {
        self.version
            .as_deref()
            .or_else(|| self.matrix.versions.last().map(String::as_str))
            .expect("validated blueprint always has a version")
    }

    pub fn base_architecture(&self) -> Architecture {
        self.architecture.unwrap_or(Architecture::Amd64)
    }

    /// The set of architectures this blueprint expands over.
    pub fn architectures(&self) -> Vec<Architecture> {
        if self.matrix.architectures.is_empty() {
            vec![self.base_architecture()]
        } else {
            self.matrix.architectures.clone()
        }
    }

    /// The set of versions this blueprint expands over.
    pub fn versions(&self) -> Vec<String> {
        if self.matrix.versions.is_empty() {
            vec![self.base_version().to_string()]
        } else {
            self.matrix.versions.clone()
        }
    }

    /// The rendered Debian version string `[epoch:]version-revision~ops2deb`.
    pub fn debian_version(&self, version: &str) -> String {
        let epoch = if self.epoch == 0 {
            String::new()
        } else {
            format!("{}:", self.epoch)
        };
        format!("{epoch}{version}-{}~ops2deb", self.revision)
    }

    /// Render a template string with this blueprint's name/version/arch
    /// plus any caller-supplied overrides (`src`, `debian`, `cwd`, `tmp`,
    /// `sha256`, ...).
    pub fn render_string(&self, s: &str, version: &str, architecture: Architecture) -> Result<String> {
        let ctx = self.base_context(version, architecture);
        template::render(s, &ctx).with_context(|| format!("render {s:?} for {}", self.name))
    }

    /// The render context (`name`, `version`, `arch`, `target`, `goarch`,
    /// `rust_target`) every template render starts from; callers layer
    /// additional caller-supplied keys on top (e.g. the materialiser's
    /// `src`/`debian`/`cwd`/`tmp`/`sha256`).
    pub fn context(&self, version: &str, architecture: Architecture) -> TplContext {
        self.base_context(version, architecture)
    }

    fn base_context(&self, version: &str, architecture: Architecture) -> TplContext {
        let arch_str = architecture.to_string();
        let target = self
            .fetch
            .as_ref()
            .and_then(|f| f.target_for(architecture))
            .unwrap_or(&arch_str)
            .to_string();
        TplContext::new()
            .with("name", self.name.clone())
            .with("version", version.to_string())
            .with("arch", arch_str.clone())
            .with("target", target.clone())
            .with("goarch", template::DEFAULT_GOARCH_MAP
                .iter()
                .find(|(from, _)| *from == arch_str)
                .map(|(_, to)| (*to).to_string())
                .unwrap_or_else(|| arch_str.clone()))
            .with("rust_target", template::DEFAULT_RUST_TARGET_MAP
                .iter()
                .find(|(from, _)| *from == arch_str)
                .map(|(_, to)| (*to).to_string())
                .unwrap_or(arch_str))
    }

    /// Render the fetch URL for one (version, architecture) pair, or
    /// `None` if this blueprint has no `fetch`.
    pub fn render_fetch_url(&self, version: &str, architecture: Architecture) -> Result<Option<String>> {
        let Some(fetch) = &self.fetch else {
            return Ok(None);
        };
        let ctx = self.base_context(version, architecture);
        template::render(fetch.url(), &ctx)
            .map(Some)
            .with_context(|| format!("render fetch url for {}", self.name))
    }

    /// The full set of distinct URLs this blueprint fetches across its
    /// matrix expansion.
    pub fn render_fetch_urls(&self) -> Result<BTreeSet<String>> {
        let mut urls = BTreeSet::new();
        for (version, arch) in iproduct!(self.versions(), self.architectures()) {
            if let Some(url) = self.render_fetch_url(&version, arch)? {
                urls.insert(url);
            }
        }
        Ok(urls)
    }

    /// Render fetch urls for a single hypothetical version across this
    /// blueprint's architectures (used by the updater to probe/fetch a
    /// candidate new version that is not yet part of `versions()`).
    pub fn render_fetch_urls_for_version(&self, version: &str) -> Result<BTreeSet<String>> {
        let mut urls = BTreeSet::new();
        for arch in self.architectures() {
            if let Some(url) = self.render_fetch_url(version, arch)? {
                urls.insert(url);
            }
        }
        Ok(urls)
    }
}

/// Parse and validate a raw YAML node into a Blueprint, applying the
/// eager template rendering of `{name, version, summary, description,
/// homepage}` mandated by invariant 2.
pub fn from_value(value: serde_yaml::Value, index_in_file: usize) -> Result<Blueprint> {
    let mut blueprint: Blueprint =
        serde_yaml::from_value(value).context("deserialize blueprint")?;
    blueprint.index_in_file = index_in_file;
    blueprint.validate()?;

    let version = blueprint.base_version().to_string();
    let arch = blueprint.base_architecture();
    blueprint.name = blueprint
        .render_string(&blueprint.name.clone(), &version, arch)
        .context("render name")?;
    if let Some(v) = blueprint.version.clone() {
        blueprint.version = Some(blueprint.render_string(&v, &version, arch).context("render version")?);
    }
    blueprint.summary = blueprint
        .render_string(&blueprint.summary.clone(), &version, arch)
        .context("render summary")?;
    if let Some(d) = blueprint.description.clone() {
        blueprint.description =
            Some(blueprint.render_string(&d, &version, arch).context("render description")?);
    }
    if let Some(h) = blueprint.homepage.clone() {
        blueprint.homepage = Some(blueprint.render_string(&h, &version, arch).context("render homepage")?);
    }

    Ok(blueprint)
}

/// A fully-resolved (name, version, architecture) expansion of a
/// blueprint, as produced by the generator's matrix expansion (§4.G).
#[derive(Clone, Debug)]
pub struct SourcePackageDescriptor {
    pub blueprint: Blueprint,
    pub version: String,
    pub architecture: Architecture,
}

impl SourcePackageDescriptor {
    pub fn debian_version(&self) -> String {
        self.blueprint.debian_version(&self.version)
    }

    pub fn fetch_url(&self) -> Result<Option<String>> {
        self.blueprint.render_fetch_url(&self.version, self.architecture)
    }

    /// The unique slug `{name}_{debian_version}_{arch}` used for delta
    /// comparisons and output directory naming.
    pub fn slug(&self) -> String {
        format!(
            "{}_{}_{}",
            self.blueprint.name,
            self.debian_version(),
            self.architecture
        )
    }
}

/// Expand a blueprint over `architectures() × versions()`.
pub fn expand(blueprint: &Blueprint) -> Vec<SourcePackageDescriptor> {
    iproduct!(blueprint.versions(), blueprint.architectures())
        .map(|(version, architecture)| SourcePackageDescriptor {
            blueprint: blueprint.clone(),
            version,
            architecture,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml(extra: &str) -> serde_yaml::Value {
        let text = format!(
            "name: great-app\nversion: 1.0.0\nsummary: a great app\n{extra}"
        );
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn parses_minimal_blueprint() {
        let bp = from_value(minimal_yaml(""), 0).unwrap();
        assert_eq!(bp.name, "great-app");
        assert_eq!(bp.base_version(), "1.0.0");
        assert_eq!(bp.revision, "1");
        assert_eq!(bp.epoch, 0);
        assert_eq!(bp.base_architecture(), Architecture::Amd64);
    }

    #[test]
    fn rejects_conflicting_version_and_matrix() {
        let value = minimal_yaml("matrix:\n  versions: [1.0.0, 1.1.0]\n");
        assert!(from_value(value, 0).is_err());
    }

    #[test]
    fn debian_version_omits_zero_epoch() {
        let bp = from_value(minimal_yaml(""), 0).unwrap();
        assert_eq!(bp.debian_version("1.0.0"), "1.0.0-1~ops2deb");
    }

    #[test]
    fn debian_version_includes_nonzero_epoch() {
        let bp = from_value(minimal_yaml("epoch: 2\n"), 0).unwrap();
        assert_eq!(bp.debian_version("1.0.0"), "2:1.0.0-1~ops2deb");
    }

    #[test]
    fn matrix_expands_cartesian_product() {
        let value = serde_yaml::from_str(
            "name: foo\nsummary: s\nmatrix:\n  architectures: [amd64, arm64]\n  versions: [1.0.0, 1.1.0]\n",
        )
        .unwrap();
        let bp = from_value(value, 0).unwrap();
        let descriptors = expand(&bp);
        assert_eq!(descriptors.len(), 4);
    }

    #[test]
    fn render_fetch_url_uses_targets_remap() {
        let value = serde_yaml::from_str(
            "name: foo\nversion: 1.0.0\nsummary: s\nfetch:\n  url: \"http://h/{{target}}.tgz\"\n  targets:\n    armhf: arm\n",
        )
        .unwrap();
        let bp = from_value(value, 0).unwrap();
        let url = bp
            .render_fetch_url("1.0.0", Architecture::Armhf)
            .unwrap()
            .unwrap();
        assert_eq!(url, "http://h/arm.tgz");
    }
}
