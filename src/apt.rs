//! The APT client: reads just enough of a remote repository to answer
//! "which `(name, version, architecture)` triples are already published"
//! (§4.J). Parsing stops at that tuple; the full `Packages`/`Release`
//! grammar (priorities, hashes, file sizes, ...) is out of scope.

use std::fmt;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use futures::future::try_join_all;
use tracing::{debug, instrument};
use url::Url;

/// One published package as reported by a `Packages` file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub version: String,
    pub architecture: String,
}

impl PackageEntry {
    /// The same `{name}_{version}_{arch}` slug the generator/delta use for
    /// blueprint-expanded descriptors, so the two sides compare directly.
    pub fn slug(&self) -> String {
        format!("{}_{}_{}", self.name, self.version, self.architecture)
    }
}

/// A parsed `--repository "<url> <distribution>"` option.
#[derive(Clone, Debug)]
pub struct RepositorySpec {
    pub base: Url,
    pub distribution: String,
}

/// Parse the `--repository` option's `"<url> <distribution>"` grammar.
pub fn parse_repository_spec(spec: &str) -> Result<RepositorySpec> {
    let mut parts = spec.split_whitespace();
    let (Some(url), Some(distribution), None) = (parts.next(), parts.next(), parts.next()) else {
        bail!(
            "The expected format for the --repository option is \"<url> <distribution>\", got {spec:?}"
        );
    };
    let base = Url::parse(url)
        .with_context(|| format!("The expected format for the --repository option is \"<url> <distribution>\", got {spec:?}"))?;
    Ok(RepositorySpec {
        base,
        distribution: distribution.to_string(),
    })
}

/// Thin HTTP client over one or more Debian APT repositories.
#[derive(Clone)]
pub struct AptClient {
    http: reqwest::Client,
}

impl fmt::Debug for AptClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AptClient").finish_non_exhaustive()
    }
}

impl Default for AptClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AptClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// List every `(name, version, architecture)` triple published under
    /// `"<url> <distribution>"`.
    #[instrument(skip(self))]
    pub async fn list_repository_packages(&self, spec: &str) -> Result<Vec<PackageEntry>> {
        let spec = parse_repository_spec(spec)?;
        let release = self.get_text(&dists_path(&spec, "Release")).await?;
        let architectures = release_field(&release, "Architectures")
            .ok_or_else(|| eyre!("Release file at {} has no Architectures field", spec.base))?;
        let components = release_field(&release, "Components")
            .ok_or_else(|| eyre!("Release file at {} has no Components field", spec.base))?;

        debug!(?architectures, ?components, "parsed Release file");

        let fetches = components
            .iter()
            .flat_map(|component| architectures.iter().map(move |arch| (component.clone(), arch.clone())))
            .map(|(component, arch)| {
                let path = dists_path(&spec, &format!("{component}/binary-{arch}/Packages"));
                async move { self.get_text(&path).await }
            });

        let packages_files = try_join_all(fetches).await?;
        let mut packages = Vec::new();
        for text in packages_files {
            packages.extend(parse_packages_stanzas(&text));
        }
        Ok(packages)
    }

    async fn get_text(&self, url: &Url) -> Result<String> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|_| eyre!("Failed to download APT repository file at {url}"))?;
        if !response.status().is_success() {
            bail!("Failed to download APT repository file at {url}");
        }
        response
            .text()
            .await
            .map_err(|_| eyre!("Failed to download APT repository file at {url}"))
    }
}

fn dists_path(spec: &RepositorySpec, rest: &str) -> Url {
    let mut url = spec.base.clone();
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base_path}/dists/{}/{rest}", spec.distribution));
    url
}

/// Extract a space-separated `Field: a b c` line from a `Release` file.
fn release_field(release: &str, field: &str) -> Option<Vec<String>> {
    release.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(field) {
            Some(value.split_whitespace().map(str::to_string).collect())
        } else {
            None
        }
    })
}

/// Parse a `Packages` file's blank-line-separated stanzas, extracting just
/// the `(Package, Version, Architecture)` triple from each.
fn parse_packages_stanzas(text: &str) -> Vec<PackageEntry> {
    let mut packages = Vec::new();
    for stanza in text.split("\n\n") {
        if stanza.trim().is_empty() {
            continue;
        }
        let mut name = None;
        let mut version = None;
        let mut architecture = None;
        for line in stanza.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "Package" => name = Some(value),
                "Version" => version = Some(value),
                "Architecture" => architecture = Some(value),
                _ => {}
            }
        }
        if let (Some(name), Some(version), Some(architecture)) = (name, version, architecture) {
            packages.push(PackageEntry {
                name,
                version,
                architecture,
            });
        }
    }
    packages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_repository_spec() {
        let spec = parse_repository_spec("http://apt.example.com stable").unwrap();
        assert_eq!(spec.base.as_str(), "http://apt.example.com/");
        assert_eq!(spec.distribution, "stable");
    }

    #[test]
    fn rejects_malformed_repository_spec() {
        assert!(parse_repository_spec("http://apt.example.com").is_err());
        assert!(parse_repository_spec("http://apt.example.com stable extra").is_err());
        assert!(parse_repository_spec("not-a-url stable").is_err());
    }

    #[test]
    fn parses_release_fields() {
        let release = "Origin: x\nArchitectures: amd64 arm64\nComponents: main contrib\n";
        assert_eq!(
            release_field(release, "Architectures"),
            Some(vec!["amd64".to_string(), "arm64".to_string()])
        );
        assert_eq!(
            release_field(release, "Components"),
            Some(vec!["main".to_string(), "contrib".to_string()])
        );
    }

    #[test]
    fn parses_packages_stanzas() {
        let text = "Package: great-app\nVersion: 1.0.0-1~ops2deb\nArchitecture: amd64\nDescription: x\n\nPackage: other\nVersion: 2.0-1~ops2deb\nArchitecture: arm64\n";
        let packages = parse_packages_stanzas(text);
        assert_eq!(
            packages,
            vec![
                PackageEntry {
                    name: "great-app".to_string(),
                    version: "1.0.0-1~ops2deb".to_string(),
                    architecture: "amd64".to_string(),
                },
                PackageEntry {
                    name: "other".to_string(),
                    version: "2.0-1~ops2deb".to_string(),
                    architecture: "arm64".to_string(),
                },
            ]
        );
    }

    #[test]
    fn slug_matches_generator_format() {
        let entry = PackageEntry {
            name: "great-app".to_string(),
            version: "1.0.0-1~ops2deb".to_string(),
            architecture: "amd64".to_string(),
        };
        assert_eq!(entry.slug(), "great-app_1.0.0-1~ops2deb_amd64");
    }
}
