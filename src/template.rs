//! A small string-template evaluator.
//!
//! Placeholders are delimited by `{{ … }}` and may optionally carry a
//! pipeline of filters: `{{ architecture | goarch }}`. Expressions may also
//! be function calls, currently only `env(key)` / `env(key, default)`.
//!
//! Undefined variables render as the empty string. A missing function (an
//! unknown name, or `env` called with the wrong argument count) fails the
//! whole render, since that is a blueprint authoring mistake rather than a
//! legitimately-absent value.

use std::collections::HashMap;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use lazy_regex::regex;

/// Mapping of Debian architecture names to Go's `GOARCH` values.
///
/// Entries not present here pass through unchanged (e.g. a caller-supplied
/// architecture we don't recognise).
pub const DEFAULT_GOARCH_MAP: &[(&str, &str)] =
    &[("amd64", "amd64"), ("arm64", "arm64"), ("armhf", "arm")];

/// Mapping of Debian architecture names to Rust target triples.
pub const DEFAULT_RUST_TARGET_MAP: &[(&str, &str)] = &[
    ("amd64", "x86_64-unknown-linux-gnu"),
    ("arm64", "aarch64-unknown-linux-gnu"),
    ("armhf", "arm-unknown-linux-gnueabihf"),
];

/// A renderable collection of named string variables, exposed to templates
/// via `{{ name }}`.
#[derive(Clone, Debug, Default)]
pub struct Context {
    vars: HashMap<String, String>,
}

impl Context {
    /// Start building a render context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or overwrite) a variable.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Insert an optional variable; a `None` value is simply not inserted
    /// (so the placeholder renders empty rather than the literal "None").
    pub fn with_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

fn apply_filter(name: &str, input: &str) -> Result<String> {
    match name {
        "goarch" => Ok(map_or_passthrough(DEFAULT_GOARCH_MAP, input)),
        "rust_target" => Ok(map_or_passthrough(DEFAULT_RUST_TARGET_MAP, input)),
        other => bail!("unknown filter: {other}"),
    }
}

fn map_or_passthrough(table: &[(&str, &str)], input: &str) -> String {
    table
        .iter()
        .find(|(from, _)| *from == input)
        .map(|(_, to)| (*to).to_string())
        .unwrap_or_else(|| input.to_string())
}

fn call_env(args: &str) -> Result<String> {
    let mut parts = split_args(args).into_iter();
    let key = parts
        .next()
        .ok_or_else(|| eyre!("env() requires at least one argument"))?;
    let key = key.trim().trim_matches(['"', '\'']);
    let default = parts.next().map(|d| d.trim().trim_matches(['"', '\'']).to_string());
    if parts.next().is_some() {
        bail!("env() takes at most two arguments");
    }
    match std::env::var(key) {
        Ok(value) => Ok(value),
        Err(_) => default.ok_or_else(|| eyre!("environment variable {key} is not set")),
    }
}

fn split_args(args: &str) -> Vec<String> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    args.split(',').map(str::to_string).collect()
}

/// Render `template` against `ctx`, substituting `{{ expr }}` placeholders.
///
/// `expr` is either a bare variable name, a variable followed by one or
/// more `| filter` stages, or a function call such as `env(FOO, "bar")`.
pub fn render(template: &str, ctx: &Context) -> Result<String> {
    let placeholder = regex!(r"\{\{\s*(.*?)\s*\}\}");
    let mut err = None;
    let rendered = placeholder.replace_all(template, |caps: &regex::Captures| {
        if err.is_some() {
            return String::new();
        }
        match render_expr(&caps[1], ctx) {
            Ok(value) => value,
            Err(e) => {
                err = Some(e);
                String::new()
            }
        }
    });
    match err {
        Some(e) => Err(e).context(format!("render template: {template:?}")),
        None => Ok(rendered.into_owned()),
    }
}

fn render_expr(expr: &str, ctx: &Context) -> Result<String> {
    let mut stages = expr.split('|').map(str::trim);
    let head = stages.next().unwrap_or_default();

    let mut value = if let Some(args) = head.strip_prefix("env(").and_then(|s| s.strip_suffix(')'))
    {
        call_env(args)?
    } else {
        ctx.get(head).unwrap_or_default().to_string()
    };

    for filter in stages {
        value = apply_filter(filter, &value)?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_plain_variables() {
        let ctx = Context::new().with("name", "foo").with("version", "1.0");
        let out = render("{{name}}-{{version}}.tar.gz", &ctx).unwrap();
        assert_eq!(out, "foo-1.0.tar.gz");
    }

    #[test]
    fn undefined_variable_renders_empty() {
        let ctx = Context::new();
        let out = render("[{{missing}}]", &ctx).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn goarch_filter_maps_known_values() {
        let ctx = Context::new().with("arch", "armhf");
        let out = render("{{arch | goarch}}", &ctx).unwrap();
        assert_eq!(out, "arm");
    }

    #[test]
    fn goarch_filter_passes_through_unknown() {
        let ctx = Context::new().with("arch", "riscv64");
        let out = render("{{arch | goarch}}", &ctx).unwrap();
        assert_eq!(out, "riscv64");
    }

    #[test]
    fn rust_target_filter_maps_known_values() {
        let ctx = Context::new().with("arch", "arm64");
        let out = render("{{arch | rust_target}}", &ctx).unwrap();
        assert_eq!(out, "aarch64-unknown-linux-gnu");
    }

    #[test]
    fn env_reads_process_environment() {
        // SAFETY: test-local env var, not read concurrently by other tests
        // asserting on it.
        unsafe { std::env::set_var("OPS2DEB_TEMPLATE_TEST", "hello") };
        let ctx = Context::new();
        let out = render("{{env(OPS2DEB_TEMPLATE_TEST)}}", &ctx).unwrap();
        assert_eq!(out, "hello");
        unsafe { std::env::remove_var("OPS2DEB_TEMPLATE_TEST") };
    }

    #[test]
    fn env_uses_default_when_unset() {
        let ctx = Context::new();
        let out = render(r#"{{env(OPS2DEB_TEMPLATE_TEST_UNSET, "fallback")}}"#, &ctx).unwrap();
        assert_eq!(out, "fallback");
    }

    #[test]
    fn env_without_default_fails_render_when_unset() {
        let ctx = Context::new();
        let err = render("{{env(OPS2DEB_TEMPLATE_TEST_UNSET_2)}}", &ctx);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_filter_fails_render() {
        let ctx = Context::new().with("arch", "amd64");
        let err = render("{{arch | nope}}", &ctx);
        assert!(err.is_err());
    }
}
