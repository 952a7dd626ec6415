//! Process level settings, distinct from the blueprint catalogue itself.
//!
//! Mirrors the shape of the original project's settings module: every field
//! is overridable by CLI flag or by an `OPS2DEB_*` environment variable,
//! with the CLI flag taking precedence.

use std::path::PathBuf;

use bon::Builder;
use clap::Args;
use color_eyre::{Result, eyre::Context};
use tracing::debug;

/// Settings shared by every subcommand.
#[derive(Clone, Debug, Args)]
pub struct Settings {
    /// Path (glob allowed) to one or more blueprint configuration files.
    #[arg(long, short, env = "OPS2DEB_CONFIG", default_value = "ops2deb.yml")]
    pub config: String,

    /// Directory in which generated Debian source packages are written.
    #[arg(long, short, env = "OPS2DEB_OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,

    /// Directory used to cache downloaded fetch targets.
    #[arg(long, env = "OPS2DEB_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Raise the log filter to `debug`.
    #[arg(long, short, env = "OPS2DEB_VERBOSE")]
    pub verbose: bool,

    /// Number of fetch/build tasks to run concurrently.
    #[arg(long, env = "OPS2DEB_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Process exit code used when an operation fails.
    #[arg(long, env = "OPS2DEB_EXIT_CODE", default_value_t = 1)]
    pub exit_code: i32,

    /// Maximum number of newer versions the updater may report per package.
    #[arg(long, env = "OPS2DEB_MAX_VERSIONS", default_value_t = 1)]
    pub max_versions: usize,
}

/// Resolved paths derived from [`Settings`], computed once at startup.
#[derive(Clone, Debug, Builder)]
pub struct ResolvedPaths {
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Settings {
    /// Resolve the cache directory, falling back to the OS cache directory
    /// (`~/.cache/ops2deb` on Linux) when `--cache-dir` is not given.
    pub fn resolve_paths(&self) -> Result<ResolvedPaths> {
        let cache_dir = match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => default_cache_dir().context("determine default cache directory")?,
        };
        let paths = ResolvedPaths::builder()
            .output_dir(self.output_dir.clone())
            .cache_dir(cache_dir)
            .build();
        debug!(?paths, "resolved settings paths");
        Ok(paths)
    }
}

fn default_cache_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", "ops2deb")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .ok_or_else(|| color_eyre::eyre::eyre!("could not determine home directory"))
}
