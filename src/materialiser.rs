//! The source package materialiser: builds the `debian/` + `src/` tree for
//! one already matrix-expanded blueprint (§4.F).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use tracing::{debug, info, instrument};

use crate::blueprint::{Architecture, InstallEntry, SourcePackageDescriptor};
use crate::error::Ops2debError;
use crate::fs as ofs;
use crate::template::{self, Context as TplContext};
use crate::templates;

const INSTALL_SUBDIRS: &[&str] = &["usr/bin", "usr/share", "usr/lib", "etc"];

/// The directories and naming a materialised package lives under,
/// computed once so every step shares the same paths.
#[derive(Clone, Debug)]
pub struct PackagePaths {
    pub package_dir: PathBuf,
    pub debian_dir: PathBuf,
    pub source_dir: PathBuf,
    pub fetch_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl PackagePaths {
    pub fn new(output_dir: &Path, descriptor: &SourcePackageDescriptor) -> Self {
        let dirname = format!(
            "{}_{}_{}",
            descriptor.blueprint.name, descriptor.version, descriptor.architecture
        );
        let package_dir = output_dir.join(&dirname);
        Self {
            debian_dir: package_dir.join("debian"),
            source_dir: package_dir.join("src"),
            fetch_dir: package_dir.join("fetched"),
            tmp_dir: PathBuf::from("/tmp/ops2deb_tmp").join(&dirname),
            package_dir,
        }
    }
}

/// What the fetcher handed back for this descriptor's fetch URL, if any.
/// Generic over the fetcher's task-data type; the materialiser only reads
/// `sha256`/`storage_path`.
pub struct FetchedArtifact<'a> {
    pub sha256: &'a str,
    pub storage_path: &'a Path,
}

/// Materialise one descriptor into `output_dir`, given the configuration
/// directory its blueprint was loaded from (for resolving relative
/// `install`/`script` paths when no fetch happened).
#[instrument(skip(descriptor, fetched))]
pub async fn materialise(
    descriptor: &SourcePackageDescriptor,
    fetched: Option<FetchedArtifact<'_>>,
    output_dir: &Path,
    config_dir: &Path,
) -> crate::error::Result<PathBuf> {
    let paths = PackagePaths::new(output_dir, descriptor);
    materialise_inner(descriptor, fetched, &paths, config_dir)
        .await
        .map(|()| paths.package_dir)
}

async fn materialise_inner(
    descriptor: &SourcePackageDescriptor,
    fetched: Option<FetchedArtifact<'_>>,
    paths: &PackagePaths,
    config_dir: &Path,
) -> crate::error::Result<()> {
    init(paths).await.map_err(Ops2debError::generator)?;
    populate_fetched_tree(paths, fetched.as_ref())
        .await
        .map_err(Ops2debError::generator)?;
    render_debian_files(descriptor, paths)
        .await
        .map_err(Ops2debError::generator)?;

    let cwd = if fetched.is_some() { &paths.fetch_dir } else { config_dir };
    let ctx = install_context(descriptor, paths, cwd, fetched.as_ref());

    run_install_steps(descriptor, paths, cwd, &ctx)
        .await
        .map_err(Ops2debError::generator)?;
    run_script_steps(descriptor, cwd, &ctx).await?;
    Ok(())
}

fn install_context(
    descriptor: &SourcePackageDescriptor,
    paths: &PackagePaths,
    cwd: &Path,
    fetched: Option<&FetchedArtifact<'_>>,
) -> TplContext {
    descriptor
        .blueprint
        .context(&descriptor.version, descriptor.architecture)
        .with("cwd", cwd.to_string_lossy().to_string())
        .with("debian", paths.debian_dir.to_string_lossy().to_string())
        .with("tmp", paths.tmp_dir.to_string_lossy().to_string())
        .with_opt(
            "src",
            fetched.map(|f| f.storage_path.to_string_lossy().to_string()),
        )
        .with_opt("sha256", fetched.map(|f| f.sha256.to_string()))
}

/// §4.F step 1: (re)create the package skeleton.
async fn init(paths: &PackagePaths) -> Result<()> {
    ofs::remove_dir_all(&paths.debian_dir).await?;
    ofs::remove_dir_all(&paths.source_dir).await?;
    ofs::remove_dir_all(&paths.tmp_dir).await?;
    ofs::remove_dir_all(&paths.fetch_dir).await?;
    ofs::create_dir_all(&paths.debian_dir).await?;
    ofs::create_dir_all(&paths.source_dir).await?;
    ofs::create_dir_all(&paths.tmp_dir).await?;
    for subdir in INSTALL_SUBDIRS {
        ofs::create_dir_all(&paths.source_dir.join(subdir)).await?;
    }
    Ok(())
}

/// §4.F step 2: copy or mirror the fetch result into `fetch_dir/`.
async fn populate_fetched_tree(paths: &PackagePaths, fetched: Option<&FetchedArtifact<'_>>) -> Result<()> {
    let Some(fetched) = fetched else {
        return Ok(());
    };
    ofs::create_dir_all(&paths.fetch_dir).await?;
    let metadata = tokio::fs::metadata(fetched.storage_path)
        .await
        .with_context(|| format!("stat fetch result: {:?}", fetched.storage_path))?;
    if metadata.is_dir() {
        ofs::sync_tree(fetched.storage_path, &paths.fetch_dir)
            .await
            .context("mirror fetched directory")?;
    } else {
        let name = fetched
            .storage_path
            .file_name()
            .ok_or_else(|| eyre!("fetch result has no file name: {:?}", fetched.storage_path))?;
        ofs::copy_file(fetched.storage_path, &paths.fetch_dir.join(name))
            .await
            .context("copy fetched file")?;
    }
    Ok(())
}

/// §4.F step 3: render the six fixed `debian/*` files.
async fn render_debian_files(descriptor: &SourcePackageDescriptor, paths: &PackagePaths) -> Result<()> {
    let name = &descriptor.blueprint.name;
    ofs::write(&paths.debian_dir.join("changelog"), templates::changelog(descriptor)).await?;
    ofs::write(&paths.debian_dir.join("control"), templates::control(descriptor)).await?;
    ofs::write(&paths.debian_dir.join("compat"), templates::compat()).await?;
    ofs::write(&paths.debian_dir.join("install"), templates::install()).await?;
    ofs::write(
        &paths.debian_dir.join(format!("{name}.lintian-overrides")),
        templates::lintian_overrides(name),
    )
    .await?;
    let rules_path = paths.debian_dir.join("rules");
    ofs::write(&rules_path, templates::rules()).await?;
    ofs::set_executable(&rules_path, true).await?;
    Ok(())
}

/// §4.F step 4: run the `install` entries in order.
async fn run_install_steps(
    descriptor: &SourcePackageDescriptor,
    paths: &PackagePaths,
    cwd: &Path,
    ctx: &TplContext,
) -> Result<()> {
    for entry in &descriptor.blueprint.install {
        match entry {
            InstallEntry::HereDoc { content, path } => {
                let rendered_path = template::render(path, ctx).context("render install path")?;
                let rendered_content = template::render(content, ctx).context("render install content")?;
                let dest = resolve_dest(&rendered_path, paths);
                if ofs::exists(&dest).await {
                    bail!("Failed to write {dest:?}, file already exists");
                }
                ofs::write(&dest, rendered_content.as_bytes())
                    .await
                    .with_context(|| format!("write {dest:?}"))?;
            }
            InstallEntry::Copy(pair) => {
                let (src, dst) = split_copy_pair(pair)?;
                let src = template::render(src, ctx).context("render copy source")?;
                let dst = template::render(dst, ctx).context("render copy destination")?;
                let src_path = cwd.join(&src);
                if !ofs::exists(&src_path).await {
                    bail!("copy source does not exist: {src_path:?}");
                }
                let dest = resolve_dest(&dst, paths);
                let metadata = tokio::fs::metadata(&src_path)
                    .await
                    .with_context(|| format!("stat copy source: {src_path:?}"))?;
                if metadata.is_dir() {
                    ofs::sync_tree(&src_path, &dest)
                        .await
                        .with_context(|| format!("copy {src_path:?} to {dest:?}"))?;
                } else {
                    ofs::copy_file(&src_path, &dest)
                        .await
                        .with_context(|| format!("copy {src_path:?} to {dest:?}"))?;
                }
            }
        }
    }
    Ok(())
}

/// Split a copy pair `"<source>:<destination>"` on its separating colon.
/// Exactly one `:` is required; `Blueprint::validate` already rejects
/// malformed pairs at load time; this is belt-and-suspenders.
fn split_copy_pair(pair: &str) -> Result<(&str, &str)> {
    let mut parts = pair.split(':');
    let (Some(src), Some(dst), None) = (parts.next(), parts.next(), parts.next()) else {
        bail!("install copy pair {pair:?} must have exactly one ':' separator");
    };
    Ok((src, dst))
}

/// §4.F step 4's destination resolution rule: an absolute path outside
/// both `package_dir` and `tmp_dir` is rebased under `source_dir`;
/// everything else (relative paths, or absolute paths already inside one
/// of those trees) is taken at face value relative to `package_dir`.
fn resolve_dest(dest: &str, paths: &PackagePaths) -> PathBuf {
    let dest_path = Path::new(dest);
    if dest_path.is_absolute() {
        if dest_path.starts_with(&paths.package_dir) || dest_path.starts_with(&paths.tmp_dir) {
            dest_path.to_path_buf()
        } else {
            let relative = dest_path.strip_prefix("/").unwrap_or(dest_path);
            paths.source_dir.join(relative)
        }
    } else {
        paths.package_dir.join(dest_path)
    }
}

/// §4.F step 5: run the `script` entries in order, in `cwd`.
async fn run_script_steps(
    descriptor: &SourcePackageDescriptor,
    cwd: &Path,
    ctx: &TplContext,
) -> crate::error::Result<()> {
    for line in &descriptor.blueprint.script {
        let rendered = template::render(line, ctx)
            .map_err(|err| Ops2debError::generator(format!("render script line {line:?}: {err}")))?;
        debug!(cwd = ?cwd, command = %rendered, "running script line");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&rendered)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| Ops2debError::GeneratorScript {
                package: descriptor.blueprint.name.clone(),
                message: format!("failed to spawn {rendered:?}: {err}"),
            })?;

        info!(
            command = %rendered,
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "script output"
        );

        if !output.status.success() {
            return Err(Ops2debError::GeneratorScript {
                package: descriptor.blueprint.name.clone(),
                message: format!(
                    "{rendered:?} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }
    }
    Ok(())
}

/// Whether `architecture` gets a `--host-arch` flag when building (the
/// `all` pseudo-arch has none).
pub fn host_arch_flag(architecture: Architecture) -> Option<String> {
    templates::host_arch_flag(architecture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint;
    use tempfile::tempdir;

    fn descriptor(yaml: &str) -> SourcePackageDescriptor {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let bp = blueprint::from_value(value, 0).unwrap();
        blueprint::expand(&bp).into_iter().next().unwrap()
    }

    #[test]
    fn resolve_dest_rebases_foreign_absolute_paths_under_source_dir() {
        let output_dir = Path::new("/out");
        let descriptor = descriptor("name: app\nversion: '1.0'\nsummary: s\n");
        let paths = PackagePaths::new(output_dir, &descriptor);
        let dest = resolve_dest("/etc/app.conf", &paths);
        assert_eq!(dest, paths.source_dir.join("etc/app.conf"));
    }

    #[test]
    fn resolve_dest_keeps_relative_paths_under_package_dir() {
        let output_dir = Path::new("/out");
        let descriptor = descriptor("name: app\nversion: '1.0'\nsummary: s\n");
        let paths = PackagePaths::new(output_dir, &descriptor);
        let dest = resolve_dest("notes.txt", &paths);
        assert_eq!(dest, paths.package_dir.join("notes.txt"));
    }

    #[test]
    fn split_copy_pair_splits_on_colon() {
        let (src, dst) = split_copy_pair("a/b.conf:/etc/b.conf").unwrap();
        assert_eq!(src, "a/b.conf");
        assert_eq!(dst, "/etc/b.conf");
    }

    #[test]
    fn split_copy_pair_without_separator_fails() {
        assert!(split_copy_pair("no-colon-here").is_err());
    }

    #[test]
    fn split_copy_pair_with_extra_separator_fails() {
        assert!(split_copy_pair("a:b:c").is_err());
    }

    #[tokio::test]
    async fn materialise_without_fetch_copies_config_relative_file() {
        let config_dir = tempdir().unwrap();
        tokio::fs::write(config_dir.path().join("test.conf"), b"hello").await.unwrap();

        let output_root = tempdir().unwrap();
        let descriptor = descriptor(
            "name: app\nversion: '1.0'\nsummary: s\ninstall:\n  - \"{{cwd}}/test.conf:/etc/test.conf\"\n",
        );

        let package_dir = materialise(&descriptor, None, output_root.path(), config_dir.path())
            .await
            .unwrap();

        let installed = tokio::fs::read(package_dir.join("src/etc/test.conf")).await.unwrap();
        assert_eq!(installed, b"hello");
    }

    #[tokio::test]
    async fn materialise_fails_when_here_doc_destination_already_exists() {
        let config_dir = tempdir().unwrap();
        let output_root = tempdir().unwrap();
        let descriptor = descriptor(
            "name: app\nversion: '1.0'\nsummary: s\ninstall:\n  - path: notes.txt\n    content: one\n  - path: notes.txt\n    content: two\n",
        );

        let result = materialise(&descriptor, None, output_root.path(), config_dir.path()).await;
        assert!(result.is_err());
    }
}
