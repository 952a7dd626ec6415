//! The binary entrypoint for `ops2deb`: a thin CLI shell over the
//! pipelines exposed by the `ops2deb` library.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ops2deb::error::Ops2debError;
use ops2deb::settings::Settings;
use tracing_subscriber::util::SubscriberInitExt as _;

mod cmd;
mod log;

#[derive(Parser)]
#[command(name = "ops2deb", about = "Turns a YAML blueprint catalogue into Debian source packages", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand)]
enum Command {
    /// Generate source packages, then build them (the default pipeline).
    Default(GenerateArgs),
    /// Generate Debian source package trees from the blueprint catalogue.
    Generate(GenerateArgs),
    /// Invoke `dpkg-buildpackage` on every source package tree already
    /// present under `--output-dir`.
    Build,
    /// Probe upstreams for newer versions and rewrite the catalogue and
    /// lockfile in place.
    Update(UpdateArgs),
    /// Fetch every blueprint's URLs and pin their digests into the
    /// lockfile, without generating any packages.
    Lock {
        /// Only lock blueprints with these names.
        #[arg(long)]
        only: Vec<String>,
    },
    /// Re-serialise the catalogue into its canonical shape.
    Format,
    /// Load and validate the catalogue without fetching or generating.
    Validate,
    /// Migrate a legacy per-architecture `fetch.sha256` blueprint onto
    /// the current `matrix.architectures` shape.
    Migrate,
    /// Delete the on-disk fetch cache.
    Purge,
    /// Compare the catalogue against a remote APT repository.
    Delta {
        /// `"<url> <distribution>"`, e.g. `"http://apt.example.com stable"`.
        repository: String,
        /// Emit a JSON `{added, removed}` document instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print the tool's version and catalogue summary.
    Version,
}

#[derive(clap::Args)]
struct GenerateArgs {
    /// Compare against this APT repository and skip already-published
    /// packages. `"<url> <distribution>"`.
    #[arg(long, short)]
    repository: Option<String>,
    /// Only generate blueprints with these names.
    #[arg(long)]
    only: Vec<String>,
}

#[derive(clap::Args)]
struct UpdateArgs {
    /// Skip these blueprint names when probing for updates.
    #[arg(long)]
    skip: Vec<String>,
    /// Only probe these blueprint names.
    #[arg(long)]
    only: Vec<String>,
    /// Probe and report changes without writing the catalogue or lockfile.
    #[arg(long)]
    dry_run: bool,
    /// Write the change summary to this file instead of stdout.
    #[arg(long)]
    output_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    log::make_logger(cli.settings.verbose).init();

    let result = match &cli.command {
        Command::Default(args) => {
            cmd::default_pipeline(&cli.settings, args.repository.as_deref(), &args.only).await
        }
        Command::Generate(args) => cmd::generate(&cli.settings, args.repository.as_deref(), &args.only).await,
        Command::Build => cmd::build(&cli.settings).await,
        Command::Update(args) => {
            cmd::update(&cli.settings, &args.skip, &args.only, args.dry_run, args.output_file.as_ref()).await
        }
        Command::Lock { only } => cmd::lock(&cli.settings, only).await,
        Command::Format => cmd::format(&cli.settings).await,
        Command::Validate => cmd::validate(&cli.settings).await,
        Command::Migrate => cmd::migrate(&cli.settings).await,
        Command::Purge => cmd::purge(&cli.settings).await,
        Command::Delta { repository, json } => cmd::delta(&cli.settings, repository, *json).await,
        Command::Version => cmd::version(&cli.settings).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", console::style(&err).red());
            exit_code_for(&cli.settings, &err)
        }
    }
}

fn exit_code_for(settings: &Settings, _err: &Ops2debError) -> ExitCode {
    let code = settings.exit_code.clamp(0, 255) as u8;
    ExitCode::from(code)
}
