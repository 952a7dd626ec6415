//! Delta: compares the blueprints' expanded package slugs against what an
//! APT repository actually publishes (§4.I).

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::instrument;

use crate::apt::{AptClient, PackageEntry};
use crate::blueprint::{self, SourcePackageDescriptor};
use crate::config::Resources;
use crate::error::Ops2debError;

/// Slugs present on one side only, both sorted ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeltaResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Probe `repository` and diff it against every blueprint's matrix
/// expansion.
#[instrument(skip(resources))]
pub async fn delta(resources: &Resources, repository: &str) -> crate::error::Result<DeltaResult> {
    let client = AptClient::new();
    let published = client
        .list_repository_packages(repository)
        .await
        .map_err(Ops2debError::apt)?;

    let descriptors: Vec<SourcePackageDescriptor> = resources.blueprints().flat_map(blueprint::expand).collect();

    Ok(diff(&published, &descriptors))
}

fn diff(published: &[PackageEntry], descriptors: &[SourcePackageDescriptor]) -> DeltaResult {
    let apt_slugs: BTreeSet<String> = published.iter().map(PackageEntry::slug).collect();
    let blueprint_slugs: BTreeSet<String> = descriptors.iter().map(SourcePackageDescriptor::slug).collect();

    DeltaResult {
        added: blueprint_slugs.difference(&apt_slugs).cloned().collect(),
        removed: apt_slugs.difference(&blueprint_slugs).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::from_value;

    fn descriptor(name: &str, version: &str, arch: &str) -> SourcePackageDescriptor {
        let yaml = format!("name: {name}\nversion: '{version}'\nsummary: s\narchitecture: {arch}\n");
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let blueprint = from_value(value, 0).unwrap();
        blueprint::expand(&blueprint).into_iter().next().unwrap()
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let published = vec![
            PackageEntry {
                name: "stale".to_string(),
                version: "1.0-1~ops2deb".to_string(),
                architecture: "amd64".to_string(),
            },
            PackageEntry {
                name: "kept".to_string(),
                version: "1.0-1~ops2deb".to_string(),
                architecture: "amd64".to_string(),
            },
        ];
        let kept = descriptor("kept", "1.0", "amd64");
        let fresh = descriptor("fresh", "2.0", "amd64");
        let descriptors = vec![kept, fresh.clone()];

        let result = diff(&published, &descriptors);
        assert_eq!(result.added, vec![fresh.slug()]);
        assert_eq!(result.removed, vec!["stale_1.0-1~ops2deb_amd64".to_string()]);
    }

    #[test]
    fn diff_is_empty_when_sides_match() {
        let d = descriptor("a", "1.0", "amd64");
        let published = vec![PackageEntry {
            name: "a".to_string(),
            version: "1.0-1~ops2deb".to_string(),
            architecture: "amd64".to_string(),
        }];
        let result = diff(&published, &[d]);
        assert_eq!(result, DeltaResult::default());
    }
}
