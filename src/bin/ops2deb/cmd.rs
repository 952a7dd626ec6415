//! One function per CLI subcommand, each a thin pipeline over the
//! `ops2deb` library (§2's "Control flow" table).

use std::path::PathBuf;

use color_eyre::eyre::Context;
use ops2deb::blueprint;
use ops2deb::builder;
use ops2deb::config;
use ops2deb::delta;
use ops2deb::error::{Ops2debError, Result};
use ops2deb::formatter;
use ops2deb::generator;
use ops2deb::settings::Settings;
use ops2deb::updater::{self, UpdateOptions};

pub async fn generate(settings: &Settings, repository: Option<&str>, only: &[String]) -> Result<()> {
    let resources = config::load_resources(&settings.config).await?;
    let paths = settings.resolve_paths().map_err(Ops2debError::generator)?;
    let only = (!only.is_empty()).then_some(only);
    generator::generate(
        &resources,
        &paths.cache_dir,
        settings.workers,
        &paths.output_dir,
        repository,
        only,
    )
    .await
}

pub async fn build(settings: &Settings) -> Result<()> {
    let paths = settings.resolve_paths().map_err(Ops2debError::builder)?;
    let targets = builder::discover_targets(&paths.output_dir).await?;
    builder::build_all(targets, settings.workers).await
}

pub async fn default_pipeline(settings: &Settings, repository: Option<&str>, only: &[String]) -> Result<()> {
    generate(settings, repository, only).await?;
    build(settings).await
}

pub async fn update(
    settings: &Settings,
    skip: &[String],
    only: &[String],
    dry_run: bool,
    output_file: Option<&PathBuf>,
) -> Result<()> {
    let mut resources = config::load_resources(&settings.config).await?;
    let paths = settings.resolve_paths().map_err(Ops2debError::updater)?;
    let options = UpdateOptions {
        skip: skip.to_vec(),
        only: only.to_vec(),
        max_versions: settings.max_versions,
        dry_run,
    };
    let changes = updater::update(&mut resources, &paths.cache_dir, settings.workers, &options).await?;

    let summary: String = changes.iter().map(|c| format!("{c}\n")).collect();
    match output_file {
        Some(path) => {
            tokio::fs::write(path, summary).await.map_err(Ops2debError::updater)?;
        }
        None => print!("{summary}"),
    }
    Ok(())
}

pub async fn lock(settings: &Settings, only: &[String]) -> Result<()> {
    let mut resources = config::load_resources(&settings.config).await?;
    let paths = settings.resolve_paths().map_err(Ops2debError::fetcher)?;
    let only = (!only.is_empty()).then_some(only);
    generator::lock(&mut resources, &paths.cache_dir, settings.workers, only).await
}

pub async fn format(settings: &Settings) -> Result<()> {
    let resources = config::load_resources(&settings.config).await?;
    let changed = formatter::format(&resources).await?;
    for path in &changed {
        println!("reformatted {}", path.display());
    }
    if !changed.is_empty() {
        return Err(Ops2debError::Formatter(format!(
            "{} file(s) were reformatted",
            changed.len()
        )));
    }
    Ok(())
}

pub async fn validate(settings: &Settings) -> Result<()> {
    let resources = config::load_resources(&settings.config).await?;
    formatter::validate(&resources)
}

pub async fn migrate(settings: &Settings) -> Result<()> {
    let mut resources = config::load_resources(&settings.config).await?;
    let migrated = formatter::migrate(&mut resources).await?;
    println!("migrated {migrated} blueprint(s)");
    Ok(())
}

pub async fn purge(settings: &Settings) -> Result<()> {
    let paths = settings.resolve_paths().map_err(Ops2debError::fetcher)?;
    ops2deb::fs::remove_dir_all(&paths.cache_dir)
        .await
        .map_err(Ops2debError::fetcher)
}

pub async fn delta(settings: &Settings, repository: &str, json: bool) -> Result<()> {
    let resources = config::load_resources(&settings.config).await?;
    let result = delta::delta(&resources, repository).await?;

    if json {
        let text = serde_json::to_string_pretty(&result).context("serialize delta as json").map_err(Ops2debError::apt)?;
        println!("{text}");
    } else {
        println!("Added:");
        for slug in &result.added {
            println!("  {slug}");
        }
        println!("Removed:");
        for slug in &result.removed {
            println!("  {slug}");
        }
    }
    Ok(())
}

/// Count every distinct blueprint expansion across every loaded
/// configuration file, used by `ops2deb version`'s catalogue summary.
pub async fn version(settings: &Settings) -> Result<()> {
    println!("ops2deb {}", env!("CARGO_PKG_VERSION"));
    if let Ok(resources) = config::load_resources(&settings.config).await {
        let packages: usize = resources.blueprints().flat_map(blueprint::expand).count();
        println!("{packages} source package(s) described by {}", settings.config);
    }
    Ok(())
}
