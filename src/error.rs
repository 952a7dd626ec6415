//! The closed error taxonomy returned at component boundaries.
//!
//! Internals use [`color_eyre::Result`] for its `.context()` ergonomics;
//! each component folds that report into one of these variants at its
//! public boundary so callers (and the CLI's exit code mapping) always see
//! a closed, matchable set of failure kinds.

use thiserror::Error;

/// Top level error type returned by every public `ops2deb` operation.
#[derive(Debug, Error)]
pub enum Ops2debError {
    /// The configuration file (or a file it includes) failed to parse.
    #[error("parse configuration: {0}")]
    Parser(String),

    /// Reading, writing, or validating the lockfile failed.
    #[error("lockfile: {0}")]
    LockFile(String),

    /// Downloading or verifying a fetch target failed.
    #[error("fetch: {0}")]
    Fetcher(String),

    /// Extracting an archive failed.
    #[error("extract archive: {0}")]
    Extract(String),

    /// Materialising a source package failed.
    #[error("generate package: {0}")]
    Generator(String),

    /// A blueprint's `script` step exited with a non-zero status.
    #[error("script for {package}: {message}")]
    GeneratorScript {
        /// The blueprint name whose script failed.
        package: String,
        /// Detail about the failure.
        message: String,
    },

    /// Invoking `dpkg-buildpackage` failed.
    #[error("build package: {0}")]
    Builder(String),

    /// Checking for or applying an update failed.
    #[error("update: {0}")]
    Updater(String),

    /// Talking to an APT repository failed.
    #[error("apt repository: {0}")]
    Apt(String),

    /// Re-formatting a configuration file failed.
    #[error("format configuration: {0}")]
    Formatter(String),
}

impl Ops2debError {
    /// Construct a [`Ops2debError::Parser`] from any displayable cause.
    pub fn parser(cause: impl std::fmt::Display) -> Self {
        Self::Parser(cause.to_string())
    }

    /// Construct a [`Ops2debError::LockFile`] from any displayable cause.
    pub fn lockfile(cause: impl std::fmt::Display) -> Self {
        Self::LockFile(cause.to_string())
    }

    /// Construct a [`Ops2debError::Fetcher`] from any displayable cause.
    pub fn fetcher(cause: impl std::fmt::Display) -> Self {
        Self::Fetcher(cause.to_string())
    }

    /// Construct a [`Ops2debError::Extract`] from any displayable cause.
    pub fn extract(cause: impl std::fmt::Display) -> Self {
        Self::Extract(cause.to_string())
    }

    /// Construct a [`Ops2debError::Generator`] from any displayable cause.
    pub fn generator(cause: impl std::fmt::Display) -> Self {
        Self::Generator(cause.to_string())
    }

    /// Construct a [`Ops2debError::Builder`] from any displayable cause.
    pub fn builder(cause: impl std::fmt::Display) -> Self {
        Self::Builder(cause.to_string())
    }

    /// Construct a [`Ops2debError::Updater`] from any displayable cause.
    pub fn updater(cause: impl std::fmt::Display) -> Self {
        Self::Updater(cause.to_string())
    }

    /// Construct a [`Ops2debError::Apt`] from any displayable cause.
    pub fn apt(cause: impl std::fmt::Display) -> Self {
        Self::Apt(cause.to_string())
    }

    /// Construct a [`Ops2debError::Formatter`] from any displayable cause.
    pub fn formatter(cause: impl std::fmt::Display) -> Self {
        Self::Formatter(cause.to_string())
    }
}

/// Convenience alias for operations that return the closed taxonomy.
pub type Result<T> = std::result::Result<T, Ops2debError>;
