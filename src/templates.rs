//! The six fixed `debian/*` files rendered by the materialiser (§4.F
//! step 3, grammar in §6). These are deliberately plain string builders
//! rather than passes through the component A template engine: their
//! shape (sorted/joined dependency lists, fixed boilerplate) is simpler to
//! express directly than to encode as `{{ }}` placeholders.

use crate::blueprint::{Architecture, SourcePackageDescriptor};

const MAINTAINER: &str = "ops2deb <ops2deb@upciti.com>";
const STANDARDS_VERSION: &str = "3.9.6";
/// Fixed upstream release placeholder timestamp; ops2deb has never
/// attempted to discover a real release date for generated changelogs.
const CHANGELOG_DATE: &str = "Tue, 07 May 2019 20:31:30 +0000";

fn joined_sorted(items: &[String]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let mut sorted = items.to_vec();
    sorted.sort();
    Some(sorted.join(", "))
}

pub fn control(descriptor: &SourcePackageDescriptor) -> String {
    let bp = &descriptor.blueprint;
    let mut build_depends = vec!["debhelper".to_string()];
    build_depends.extend(bp.build_depends.iter().cloned());
    build_depends.sort();
    build_depends.dedup();

    let mut out = String::new();
    out.push_str(&format!("Source: {}\n", bp.name));
    out.push_str("Priority: optional\n");
    out.push_str(&format!("Maintainer: {MAINTAINER}\n"));
    out.push_str(&format!("Build-Depends: {}\n", build_depends.join(", ")));
    out.push_str(&format!("Standards-Version: {STANDARDS_VERSION}\n"));
    if let Some(homepage) = &bp.homepage {
        out.push_str(&format!("Homepage: {homepage}\n"));
    }
    out.push('\n');

    out.push_str(&format!("Package: {}\n", bp.name));
    out.push_str(&format!("Architecture: {}\n", descriptor.architecture));
    for (field, values) in [
        ("Provides", &bp.provides),
        ("Depends", &bp.depends),
        ("Recommends", &bp.recommends),
        ("Replaces", &bp.replaces),
        ("Conflicts", &bp.conflicts),
    ] {
        if let Some(joined) = joined_sorted(values) {
            out.push_str(&format!("{field}: {joined}\n"));
        }
    }
    out.push_str(&format!("Description: {}\n", bp.summary));
    if let Some(description) = &bp.description {
        for line in description.lines() {
            if line.trim().is_empty() {
                out.push_str(" .\n");
            } else {
                out.push_str(&format!(" {line}\n"));
            }
        }
    }
    out
}

pub fn changelog(descriptor: &SourcePackageDescriptor) -> String {
    let bp = &descriptor.blueprint;
    format!(
        "{} ({}) unstable; urgency=low\n\n  * Package generated by ops2deb.\n\n -- {MAINTAINER}  {CHANGELOG_DATE}\n",
        bp.name,
        descriptor.debian_version(),
    )
}

pub fn compat() -> &'static str {
    "10\n"
}

pub fn install() -> &'static str {
    "src/* /\n"
}

pub fn lintian_overrides(name: &str) -> String {
    format!("{name}: statically-linked-binary\n{name}: binary-without-manpage\n")
}

pub fn rules() -> &'static str {
    "#!/usr/bin/make -f\n\
%:\n\
\tdh $@\n\n\
override_dh_shlibdeps:\n\
\tdh_shlibdeps --dpkg-shlibdeps-params=--ignore-missing-info\n\n\
override_dh_strip:\n\
\tdh_strip --no-ddebs\n\n\
override_dh_builddeb:\n\
\tdh_builddeb -- -Zxz\n"
}

/// Whether `architecture` should be passed to `dpkg-buildpackage
/// --host-arch` when building (it's omitted for the `all` pseudo-arch).
pub fn host_arch_flag(architecture: Architecture) -> Option<String> {
    match architecture {
        Architecture::All => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{self};

    fn descriptor() -> SourcePackageDescriptor {
        let value: serde_yaml::Value = serde_yaml::from_str(
            "name: great-app\nversion: 1.0.0\nsummary: a great app\ndescription: |\n  line one\n\n  line two\ndepends: [libc6, libssl1.1]\n",
        )
        .unwrap();
        let bp = blueprint::from_value(value, 0).unwrap();
        blueprint::expand(&bp).into_iter().next().unwrap()
    }

    #[test]
    fn control_sorts_and_includes_debhelper() {
        let text = control(&descriptor());
        assert!(text.contains("Build-Depends: debhelper\n"));
        assert!(text.contains("Depends: libc6, libssl1.1\n"));
    }

    #[test]
    fn control_replaces_blank_description_lines() {
        let text = control(&descriptor());
        assert!(text.contains(" line one\n"));
        assert!(text.contains(" .\n"));
        assert!(text.contains(" line two\n"));
    }

    #[test]
    fn host_arch_flag_omitted_for_all() {
        assert_eq!(host_arch_flag(Architecture::All), None);
        assert_eq!(host_arch_flag(Architecture::Amd64), Some("amd64".to_string()));
    }
}
