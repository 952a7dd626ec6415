//! The generator: expands selected blueprints over their matrix, drops
//! descriptors already published to an APT repository, drives the
//! fetcher, and materialises whatever it can (§4.G).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::apt::AptClient;
use crate::blueprint::{self, SourcePackageDescriptor};
use crate::config::Resources;
use crate::error::Ops2debError;
use crate::fetch::{FetchResult, Fetcher};
use crate::materialiser::{self, FetchedArtifact};
use crate::progress::TransferBar;

/// Per-task data threaded through the fetcher back to the descriptor (and
/// the configuration directory needed to resolve relative install paths)
/// that requested it.
#[derive(Clone)]
struct GenTask {
    descriptor: SourcePackageDescriptor,
    config_dir: PathBuf,
}

/// Run the full `generate` pipeline. Returns `Ok(())` if every selected
/// descriptor that needed a fetch got one and materialised cleanly;
/// otherwise a [`Ops2debError::Generator`] naming the failure count,
/// raised only after everything that *could* be materialised was.
#[instrument(skip(resources))]
pub async fn generate(
    resources: &Resources,
    cache_dir: &Path,
    concurrency: usize,
    output_dir: &Path,
    repository: Option<&str>,
    only_names: Option<&[String]>,
) -> crate::error::Result<()> {
    let mut fetcher: Fetcher<GenTask> =
        Fetcher::new(cache_dir.to_path_buf(), concurrency).map_err(Ops2debError::fetcher)?;
    let mut descriptors = select_descriptors(resources, only_names);

    if let Some(repository) = repository {
        descriptors = filter_against_repository(descriptors, repository).await?;
    }

    let mut unfetched = Vec::new();
    for descriptor in descriptors {
        let config_dir = config_dir_for(resources, &descriptor);
        let Some(url) = descriptor.fetch_url().map_err(Ops2debError::generator)? else {
            unfetched.push(GenTask { descriptor, config_dir });
            continue;
        };

        let lock = resources
            .lock_for_uid(descriptor.blueprint.uid)
            .ok_or_else(|| Ops2debError::lockfile(format!("no lockfile associated with {}", descriptor.blueprint.name)))?;
        let expected = lock.sha256(&url).map_err(Ops2debError::lockfile)?;
        fetcher.add_task(
            url,
            GenTask { descriptor, config_dir },
            Some(expected.to_string()),
        );
    }

    let progress = (fetcher.task_count() > 0).then(|| TransferBar::new(fetcher.task_count() as u64, "Fetching"));
    let (results, failures) = fetcher.run_tasks_with_progress(progress.as_ref()).await;
    let mut failure_count = failures.len();

    for failure in &failures {
        warn!(url = %failure.url, error = %failure.error, "fetch failed, skipping package");
    }

    for result in &results {
        if materialise_one(&result.task_data.descriptor, Some(fetch_artifact(result)), output_dir, &result.task_data.config_dir)
            .await
            .is_err()
        {
            failure_count += 1;
        }
    }

    for task in unfetched {
        if materialise_one(&task.descriptor, None, output_dir, &task.config_dir)
            .await
            .is_err()
        {
            failure_count += 1;
        }
    }

    if failure_count > 0 {
        return Err(Ops2debError::generator(format!("{failure_count} failures occurred")));
    }
    Ok(())
}

/// Run the `lock` pipeline (§2: `C → B → E → D`): fetch every blueprint's
/// rendered URLs without an expected digest, then pin whatever came back
/// into the lockfile that owns each blueprint.
#[instrument(skip(resources))]
pub async fn lock(
    resources: &mut Resources,
    cache_dir: &Path,
    concurrency: usize,
    only_names: Option<&[String]>,
) -> crate::error::Result<()> {
    let mut fetcher: Fetcher<u64> =
        Fetcher::new(cache_dir.to_path_buf(), concurrency).map_err(Ops2debError::fetcher)?;

    let only: Option<HashSet<&str>> = only_names.map(|names| names.iter().map(String::as_str).collect());
    for blueprint in resources.blueprints() {
        if only.as_ref().is_some_and(|only| !only.contains(blueprint.name.as_str())) {
            continue;
        }
        let urls = blueprint.render_fetch_urls().map_err(Ops2debError::generator)?;
        for url in urls {
            fetcher.add_task(url, blueprint.uid, None);
        }
    }

    let progress = (fetcher.task_count() > 0).then(|| TransferBar::new(fetcher.task_count() as u64, "Locking"));
    let (results, failures) = fetcher.run_tasks_with_progress(progress.as_ref()).await;
    for failure in &failures {
        warn!(url = %failure.url, error = %failure.error, "fetch failed, url not pinned");
    }

    for result in results {
        if let Some(lock) = resources.lock_for_uid_mut(result.task_data) {
            lock.add([crate::lockfile::UrlAndHash {
                url: result.url,
                sha256: result.sha256,
            }]);
        }
    }

    resources.save().await?;

    if !failures.is_empty() {
        return Err(Ops2debError::fetcher(format!("{} failures occurred", failures.len())));
    }
    Ok(())
}

fn fetch_artifact(result: &FetchResult<GenTask>) -> FetchedArtifact<'_> {
    FetchedArtifact {
        sha256: &result.sha256,
        storage_path: &result.storage_path,
    }
}

async fn materialise_one(
    descriptor: &SourcePackageDescriptor,
    fetched: Option<FetchedArtifact<'_>>,
    output_dir: &Path,
    config_dir: &Path,
) -> crate::error::Result<PathBuf> {
    match materialiser::materialise(descriptor, fetched, output_dir, config_dir).await {
        Ok(package_dir) => {
            info!(package = %descriptor.slug(), dir = ?package_dir, "materialised source package");
            Ok(package_dir)
        }
        Err(err) => {
            warn!(package = %descriptor.slug(), error = %err, "failed to materialise package");
            Err(err)
        }
    }
}

fn select_descriptors(resources: &Resources, only_names: Option<&[String]>) -> Vec<SourcePackageDescriptor> {
    let only: Option<HashSet<&str>> = only_names.map(|names| names.iter().map(String::as_str).collect());
    resources
        .blueprints()
        .filter(|bp| only.as_ref().map_or(true, |only| only.contains(bp.name.as_str())))
        .flat_map(blueprint::expand)
        .collect()
}

fn config_dir_for(resources: &Resources, descriptor: &SourcePackageDescriptor) -> PathBuf {
    resources
        .config_file_for_uid(descriptor.blueprint.uid)
        .and_then(|file| file.path.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn filter_against_repository(
    descriptors: Vec<SourcePackageDescriptor>,
    repository: &str,
) -> crate::error::Result<Vec<SourcePackageDescriptor>> {
    let client = AptClient::new();
    let published: HashSet<String> = client
        .list_repository_packages(repository)
        .await
        .map_err(Ops2debError::apt)?
        .into_iter()
        .map(|p| p.slug())
        .collect();

    Ok(descriptors
        .into_iter()
        .filter(|d| !published.contains(&d.slug()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_descriptors_honours_only_names() {
        let yaml = "- name: a\n  version: '1.0'\n  summary: s\n- name: b\n  version: '1.0'\n  summary: s\n";
        let values: Vec<serde_yaml::Value> = serde_yaml::from_str(yaml).unwrap();
        let blueprints: Vec<_> = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| crate::blueprint::from_value(v, i).unwrap())
            .collect();

        let only = vec!["b".to_string()];
        let selected: Vec<_> = blueprints
            .iter()
            .filter(|bp| only.contains(&bp.name))
            .flat_map(crate::blueprint::expand)
            .collect();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].blueprint.name, "b");
    }
}
