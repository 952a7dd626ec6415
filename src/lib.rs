//! Library for `ops2deb`: turns a YAML blueprint catalogue into Debian
//! source packages (and, optionally, built `.deb` archives).
//!
//! The binary crate (`src/bin/ops2deb`) is a thin CLI shell over the
//! operations exposed here; this library is also what its tests exercise
//! directly.

pub mod apt;
pub mod archive;
pub mod blueprint;
pub mod builder;
pub mod config;
pub mod delta;
pub mod error;
pub mod fetch;
pub mod formatter;
pub mod fs;
pub mod generator;
pub mod lockfile;
pub mod materialiser;
pub mod progress;
pub mod settings;
pub mod template;
pub mod templates;
pub mod updater;
