//! Thin wrapper around the external `dpkg-buildpackage` invocation
//! (`[ADD] Builder`). Kept separate from the generator so `generate`-only
//! workflows never shell out.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::error::Ops2debError;
use crate::templates::host_arch_flag;

/// One source package directory discovered under an output dir (any
/// directory containing a `debian/control` file), with the architecture
/// read back from its control file's `Architecture` field.
#[derive(Clone, Debug)]
pub struct BuildTarget {
    pub source_dir: PathBuf,
    pub architecture: Option<String>,
}

/// Invoke `dpkg-buildpackage -us -uc` for every target, bounded by a
/// semaphore of `concurrency` concurrent children.
#[instrument(skip(targets))]
pub async fn build_all(targets: Vec<BuildTarget>, concurrency: usize) -> crate::error::Result<()> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(targets.len());

    for target in targets {
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            build_one(&target).await
        }));
    }

    let mut failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "build failed");
                failures += 1;
            }
            Err(err) => {
                warn!(error = %err, "build task panicked");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(Ops2debError::builder(format!("{failures} package(s) failed to build")));
    }
    Ok(())
}

async fn build_one(target: &BuildTarget) -> crate::error::Result<()> {
    let mut command = tokio::process::Command::new("dpkg-buildpackage");
    command.args(["-us", "-uc"]).current_dir(&target.source_dir);
    if let Some(arch) = target.architecture.as_deref().filter(|arch| *arch != "all") {
        command.arg("--host-arch").arg(arch);
    }

    let output = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| Ops2debError::builder(format!("failed to spawn dpkg-buildpackage in {:?}: {err}", target.source_dir)))?;

    if !output.status.success() {
        return Err(Ops2debError::builder(format!(
            "dpkg-buildpackage in {:?} exited with {}: {}",
            target.source_dir,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    info!(dir = ?target.source_dir, "built package");
    Ok(())
}

/// Discover every source package directory under `output_dir` (any
/// directory directly containing `debian/control`), reading back its
/// architecture from the control file's `Package` stanza.
pub async fn discover_targets(output_dir: &Path) -> crate::error::Result<Vec<BuildTarget>> {
    discover_targets_inner(output_dir)
        .await
        .map_err(Ops2debError::builder)
}

async fn discover_targets_inner(output_dir: &Path) -> color_eyre::Result<Vec<BuildTarget>> {
    use color_eyre::eyre::Context;

    let mut targets = Vec::new();
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .with_context(|| format!("read output dir: {output_dir:?}"))?;

    while let Some(entry) = entries.next_entry().await.context("read output dir entry")? {
        let source_dir = entry.path();
        if !source_dir.is_dir() {
            continue;
        }
        let control_path = source_dir.join("debian/control");
        if !tokio::fs::try_exists(&control_path).await.unwrap_or(false) {
            continue;
        }
        let control = tokio::fs::read_to_string(&control_path)
            .await
            .with_context(|| format!("read {control_path:?}"))?;
        let architecture = architecture_field(&control);
        targets.push(BuildTarget { source_dir, architecture });
    }

    Ok(targets)
}

fn architecture_field(control: &str) -> Option<String> {
    control.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Architecture").then(|| value.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_field_reads_package_stanza() {
        let control = "Source: x\nPriority: optional\n\nPackage: x\nArchitecture: arm64\nDescription: d\n";
        assert_eq!(architecture_field(control), Some("arm64".to_string()));
    }

    #[test]
    fn architecture_field_absent_is_none() {
        assert_eq!(architecture_field("Source: x\n"), None);
    }

    #[test]
    fn host_arch_flag_still_omits_all() {
        assert_eq!(host_arch_flag(crate::blueprint::Architecture::All), None);
    }
}
