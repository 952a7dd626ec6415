//! The fetcher: a content-addressed download/verify/extract cache with
//! per-URL task coalescing and bounded concurrency (§4.E).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};

use crate::archive;
use crate::fs as ofs;
use crate::progress::TransferBar;

const MAX_DOWNLOAD_ATTEMPTS: usize = 3;

/// The successful outcome of fetching one URL, reported once per caller
/// that registered interest in it (§4.E: "fan-out to multiple consumers
/// is preserved").
#[derive(Clone, Debug)]
pub struct FetchResult<T> {
    pub url: String,
    pub sha256: String,
    /// Either the downloaded file, or the directory it was extracted
    /// into, per the `storage_path` rule in §4.E step 4.
    pub storage_path: PathBuf,
    pub task_data: T,
}

/// The failed outcome of fetching one URL, reported once per caller.
#[derive(Clone, Debug)]
pub struct FetchFailure<T> {
    pub url: String,
    pub error: String,
    pub task_data: T,
}

struct PendingTask<T> {
    url: String,
    /// Each caller's opaque token, plus the expected digest *that caller*
    /// supplied (which may differ from the task-level winner).
    callers: Vec<(T, Option<String>)>,
}

/// Owns the on-disk cache and the queue of not-yet-run fetch tasks.
///
/// `T` is the opaque per-caller token threaded through to
/// [`FetchResult`]/[`FetchFailure`] (e.g. a [`crate::blueprint::SourcePackageDescriptor`]
/// index, or a blueprint `uid`).
pub struct Fetcher<T> {
    cache_dir: PathBuf,
    concurrency: usize,
    http: reqwest::Client,
    tasks: HashMap<String, PendingTask<T>>,
}

impl<T: Clone + Send + 'static> Fetcher<T> {
    pub fn new(cache_dir: PathBuf, concurrency: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(Duration::from_secs(300))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            cache_dir,
            concurrency: concurrency.max(1),
            http,
            tasks: HashMap::new(),
        })
    }

    /// Enqueue work for `url`. Multiple calls for the same URL coalesce
    /// into a single task; each caller's `data` is preserved so the
    /// eventual result (or failure) fans out to every caller.
    pub fn add_task(&mut self, url: impl Into<String>, data: T, sha256: Option<String>) {
        let url = url.into();
        self.tasks
            .entry(url.clone())
            .or_insert_with(|| PendingTask {
                url: url.clone(),
                callers: Vec::new(),
            })
            .callers
            .push((data, sha256));
    }

    /// Enqueue every URL in `urls` as its own task with opaque data `data`
    /// and no expected digest, for convenience callers (`lock`, `update`).
    pub fn fetch_urls(&mut self, urls: impl IntoIterator<Item = (String, T)>) {
        for (url, data) in urls {
            self.add_task(url, data, None);
        }
    }

    /// Drive every queued task to completion, bounded by this fetcher's
    /// concurrency, then clear internal state.
    #[instrument(skip(self))]
    pub async fn run_tasks(&mut self) -> (Vec<FetchResult<T>>, Vec<FetchFailure<T>>) {
        self.run_tasks_with_progress(None).await
    }

    /// Same as [`Self::run_tasks`], incrementing `progress` once per
    /// completed task (whichever caller it reports its outcome to isn't
    /// relevant to the bar, only task-level completion is).
    pub async fn run_tasks_with_progress(
        &mut self,
        progress: Option<&TransferBar>,
    ) -> (Vec<FetchResult<T>>, Vec<FetchFailure<T>>) {
        let tasks: Vec<PendingTask<T>> = self.tasks.drain().map(|(_, t)| t).collect();
        if tasks.is_empty() {
            return (Vec::new(), Vec::new());
        }
        info!(tasks = tasks.len(), "fetching");

        let cache_dir = self.cache_dir.clone();
        let http = self.http.clone();
        let concurrency = self.concurrency;

        let outcomes = stream::iter(tasks)
            .map(|task| {
                let cache_dir = cache_dir.clone();
                let http = http.clone();
                async move {
                    let expected = task
                        .callers
                        .iter()
                        .find_map(|(_, sha)| sha.clone());
                    let outcome = fetch_one(&http, &cache_dir, &task.url, expected.as_deref()).await;
                    if let Some(progress) = progress {
                        progress.inc(1);
                    }
                    (task, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for (task, outcome) in outcomes {
            match outcome {
                Ok((sha256, storage_path)) => {
                    for (data, expected) in task.callers {
                        match &expected {
                            Some(expected) if *expected != sha256 => {
                                failures.push(FetchFailure {
                                    url: task.url.clone(),
                                    error: format!(
                                        "Wrong checksum for file {}. Expected {expected}, got {sha256}.",
                                        basename(&task.url)
                                    ),
                                    task_data: data,
                                });
                            }
                            _ => results.push(FetchResult {
                                url: task.url.clone(),
                                sha256: sha256.clone(),
                                storage_path: storage_path.clone(),
                                task_data: data,
                            }),
                        }
                    }
                }
                Err(error) => {
                    let message = error.to_string();
                    for (data, _) in task.callers {
                        failures.push(FetchFailure {
                            url: task.url.clone(),
                            error: message.clone(),
                            task_data: data,
                        });
                    }
                }
            }
        }

        debug!(results = results.len(), failures = failures.len(), "fetch complete");
        (results, failures)
    }

    /// Number of distinct URLs currently queued.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Remove the entire on-disk cache (`purge`).
    pub async fn purge_cache(&self) -> Result<()> {
        ofs::remove_dir_all(&self.cache_dir).await
    }
}

fn basename(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}

/// Run the per-task algorithm of §4.E steps 1-6 for a single URL.
async fn fetch_one(
    http: &reqwest::Client,
    cache_dir: &Path,
    url: &str,
    expected_sha256: Option<&str>,
) -> Result<(String, PathBuf)> {
    let task_dir = cache_dir.join(ofs::sha256_str(url));
    ofs::create_dir_all(&task_dir).await.context("create cache dir")?;

    let name = basename(url);
    let file_path = task_dir.join(&name);
    let sum_path = task_dir.join(format!("{name}.sum"));
    let out_dir = task_dir.join(format!("{name}_out"));

    if !ofs::exists(&file_path).await {
        download(http, url, &file_path).await?;
    }

    let digest = match ofs::read_buffered(&sum_path).await.context("read sum file")? {
        Some(bytes) => String::from_utf8(bytes).context("sum file is not utf8")?,
        None => {
            let digest = ofs::sha256_file(&file_path).await.context("hash downloaded file")?;
            ofs::write(&sum_path, &digest).await.context("write sum file")?;
            digest
        }
    };

    let extractable = expected_sha256.is_some() && archive::is_supported(&file_path);
    let storage_path = if extractable {
        out_dir.clone()
    } else {
        file_path.clone()
    };

    if let Some(expected) = expected_sha256 {
        if expected != digest {
            return Err(eyre!(
                "Wrong checksum for file {name}. Expected {expected}, got {digest}."
            ));
        }
    }

    if extractable && !ofs::exists(&out_dir).await {
        let tmp_out = task_dir.join(format!("{name}_out_tmp"));
        ofs::remove_dir_all(&tmp_out).await.context("clear stale extraction tmp")?;
        ofs::create_dir_all(&tmp_out).await.context("create extraction tmp")?;
        let src = file_path.clone();
        let dst = tmp_out.clone();
        spawn_blocking(move || archive::extract(&src, &dst))
            .await
            .context("join extraction task")?
            .context("extract archive")?;
        ofs::rename(&tmp_out, &out_dir).await.context("commit extraction")?;
    }

    Ok((digest, storage_path))
}

async fn download(http: &reqwest::Client, url: &str, dst: &Path) -> Result<()> {
    let part_path = dst.with_extension(
        dst.extension()
            .map(|ext| format!("{}.part", ext.to_string_lossy()))
            .unwrap_or_else(|| "part".to_string()),
    );

    let mut last_error = None;
    for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
        match try_download(http, url, &part_path).await {
            Ok(()) => {
                ofs::rename(&part_path, dst).await.context("commit download")?;
                return Ok(());
            }
            Err(err) => {
                warn!(%url, attempt, error = %err, "download attempt failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| eyre!("download failed with no recorded error")))
}

async fn try_download(http: &reqwest::Client, url: &str, part_path: &Path) -> Result<()> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|err| eyre!("Failed to download {url}. {err}"))?;

    let status = response.status();
    if status >= StatusCode::BAD_REQUEST {
        return Err(eyre!(
            "Failed to download {url}. Server responded with {}.",
            status.as_u16()
        ));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|err| eyre!("Failed to download {url}. {err}"))?;
    ofs::write(part_path, &bytes).await.context("write partial download")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_extracts_last_path_segment() {
        assert_eq!(basename("http://h/a/b/archive.tar.gz"), "archive.tar.gz");
        assert_eq!(basename("http://h/lonely"), "lonely");
    }

    #[tokio::test]
    async fn add_task_coalesces_same_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher: Fetcher<u64> = Fetcher::new(dir.path().to_path_buf(), 2).unwrap();
        fetcher.add_task("http://h/a.tgz", 1, None);
        fetcher.add_task("http://h/a.tgz", 2, None);
        assert_eq!(fetcher.tasks.len(), 1);
        assert_eq!(fetcher.tasks["http://h/a.tgz"].callers.len(), 2);
    }

    #[tokio::test]
    async fn run_tasks_with_nothing_queued_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher: Fetcher<u64> = Fetcher::new(dir.path().to_path_buf(), 2).unwrap();
        let (results, failures) = fetcher.run_tasks().await;
        assert!(results.is_empty());
        assert!(failures.is_empty());
    }
}
