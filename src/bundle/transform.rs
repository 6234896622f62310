//! Source transforms applied to every module before its dependencies are
//! scanned.
use std::sync::{Arc, LazyLock};

use anyhow::{Context, bail};
use camino::Utf8Path;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::config::Features;
use crate::variables::Variables;

static RE_READ_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:fs\.)?readFileSync\(\s*(?:path\.join\(\s*__dirname\s*,\s*['"]([^'"]+)['"]\s*\)|__dirname\s*\+\s*['"]([^'"]+)['"])\s*(?:,\s*['"][\w-]+['"]\s*)?\)"#,
    )
    .expect("static regex")
});

static RE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*///:\s*(BEGIN|END):ONLY_INCLUDE_IN(?:\(([^)]*)\))?\s*$").expect("static regex")
});

static RE_PROCESS_ENV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bprocess\.env\.([A-Za-z_$][A-Za-z0-9_$]*)").expect("static regex")
});

/// A source-to-source rewrite of one module.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, _file: &Utf8Path) -> bool {
        true
    }

    fn transform(&self, file: &Utf8Path, source: String) -> anyhow::Result<String>;
}

/// Compiles TypeScript down to CommonJS with esbuild.
#[derive(Debug, Clone)]
pub struct Transpile {
    binary: String,
}

impl Default for Transpile {
    fn default() -> Self {
        Self {
            binary: "esbuild".into(),
        }
    }
}

impl Transpile {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Transform for Transpile {
    fn name(&self) -> &'static str {
        "transpile"
    }

    fn applies_to(&self, file: &Utf8Path) -> bool {
        matches!(file.extension(), Some("ts" | "tsx"))
    }

    fn transform(&self, file: &Utf8Path, source: String) -> anyhow::Result<String> {
        let loader = format!("--loader={}", file.extension().unwrap_or("ts"));
        let sourcefile = format!("--sourcefile={file}");

        let output = crate::esbuild::transform_stdin(
            &self.binary,
            &[&loader, "--format=cjs", &sourcefile],
            &source,
        )?;

        Ok(output)
    }
}

/// Replaces `readFileSync` calls relative to `__dirname` with the contents of
/// the file as a string literal.
#[derive(Debug, Clone, Default)]
pub struct InlineFileRead;

impl Transform for InlineFileRead {
    fn name(&self) -> &'static str {
        "inline-file-read"
    }

    fn transform(&self, file: &Utf8Path, source: String) -> anyhow::Result<String> {
        if !source.contains("readFileSync") {
            return Ok(source);
        }

        let dir = file.parent().unwrap_or(Utf8Path::new(""));
        let mut failure = None;

        let replaced = RE_READ_FILE.replace_all(&source, |caps: &Captures| {
            let Some(relative) = caps.get(1).or_else(|| caps.get(2)) else {
                return caps[0].to_string();
            };
            let relative = relative.as_str().trim_start_matches('/');
            let target = crate::utils::normalize_path(&dir.join(relative));

            match std::fs::read_to_string(&target) {
                Ok(contents) => Value::String(contents).to_string(),
                Err(err) => {
                    failure.get_or_insert_with(|| {
                        anyhow::Error::new(err).context(format!("Couldn't inline '{target}'"))
                    });
                    caps[0].to_string()
                }
            }
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(replaced.into_owned()),
        }
    }
}

/// Drops code fenced off for features this build leaves out.
///
/// A fence opens with `///: BEGIN:ONLY_INCLUDE_IN(a,b)` and closes with
/// `///: END:ONLY_INCLUDE_IN`. The lines in between, fences included, are
/// removed unless one of the named features is active. Fences don't nest.
#[derive(Debug, Clone)]
pub struct RemoveFencedCode {
    features: Arc<Features>,
}

impl RemoveFencedCode {
    pub fn new(features: Arc<Features>) -> Self {
        Self { features }
    }
}

impl Transform for RemoveFencedCode {
    fn name(&self) -> &'static str {
        "remove-fenced-code"
    }

    fn transform(&self, file: &Utf8Path, source: String) -> anyhow::Result<String> {
        if !source.contains("///:") {
            return Ok(source);
        }

        let mut output = String::with_capacity(source.len());
        // Line of the open fence, and whether its block is kept.
        let mut open: Option<(usize, bool)> = None;

        for (index, line) in source.split_inclusive('\n').enumerate() {
            let number = index + 1;

            if !line.trim_start().starts_with("///:") {
                if open.is_none_or(|(_, keep)| keep) {
                    output.push_str(line);
                }
                continue;
            }

            let Some(caps) = RE_FENCE.captures(line.trim_end()) else {
                bail!("Malformed fence at {file}:{number}");
            };

            match (&caps[1], caps.get(2), open) {
                ("BEGIN", _, Some((begin, _))) => {
                    bail!("Nested fence at {file}:{number}, the one at line {begin} is still open");
                }
                ("BEGIN", Some(params), None) => {
                    let mut keep = false;
                    for feature in params.as_str().split(',').map(str::trim) {
                        if !self.features.all.contains(feature) {
                            bail!("Unknown feature '{feature}' in fence at {file}:{number}");
                        }
                        keep |= self.features.active.contains(feature);
                    }
                    if keep {
                        output.push_str(line);
                    }
                    open = Some((number, keep));
                }
                ("BEGIN", None, None) => bail!("Fence at {file}:{number} names no features"),
                ("END", Some(_), _) => bail!("Closing fence at {file}:{number} takes no features"),
                ("END", None, None) => bail!("Closing fence at {file}:{number} without an opening one"),
                (_, _, Some((_, keep))) => {
                    if keep {
                        output.push_str(line);
                    }
                    open = None;
                }
                _ => bail!("Malformed fence at {file}:{number}"),
            }
        }

        if let Some((begin, _)) = open {
            bail!("Fence opened at {file}:{begin} is never closed");
        }

        Ok(output)
    }
}

/// Replaces `process.env.KEY` with the JSON literal of the variable. A key
/// that was never declared fails the transform, a `null` value becomes
/// `undefined`.
#[derive(Debug, Clone)]
pub struct EnvInject {
    variables: Arc<Variables>,
}

impl EnvInject {
    pub fn new(variables: Arc<Variables>) -> Self {
        Self { variables }
    }
}

impl Transform for EnvInject {
    fn name(&self) -> &'static str {
        "env-inject"
    }

    fn transform(&self, file: &Utf8Path, source: String) -> anyhow::Result<String> {
        if !source.contains("process.env.") {
            return Ok(source);
        }

        let mut failure = None;

        let replaced = RE_PROCESS_ENV.replace_all(&source, |caps: &Captures| {
            match self.variables.get(&caps[1]) {
                Ok(Value::Null) => "undefined".to_string(),
                Ok(value) => value.to_string(),
                Err(err) => {
                    failure.get_or_insert(err);
                    caps[0].to_string()
                }
            }
        });

        match failure {
            Some(err) => Err(err).with_context(|| format!("in '{file}'")),
            None => Ok(replaced.into_owned()),
        }
    }
}
