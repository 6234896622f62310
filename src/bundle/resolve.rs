//! Walks the module graph on disk, starting from the entry points.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use futures::{StreamExt, TryStreamExt, stream};
use regex::Regex;
use serde::Deserialize;

use super::{BundlerOptions, ModuleRecord};
use crate::error::PipelineError;
use crate::pipeline::{Packet, PacketStream};
use crate::utils::normalize_path;

static RE_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\(\s*['"]([^'"\n]+)['"]\s*\)"#).expect("static regex")
});

static RE_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[\w*{}\s,$]+?\s+from\s+)?['"]([^'"\n]+)['"]"#)
        .expect("static regex")
});

/// Source of the raw module stream of a bundle run.
pub trait Bundler: Send + Sync {
    /// Resolve the graph described by `options` and stream its modules.
    fn bundle(&self, options: &BundlerOptions) -> PacketStream;

    /// Files read during the most recent run.
    fn watched(&self) -> Vec<Utf8PathBuf>;
}

/// Resolves modules from the file system, relative to `root`.
#[derive(Debug, Clone)]
pub struct FsBundler {
    root: Utf8PathBuf,
    read: Arc<Mutex<Vec<Utf8PathBuf>>>,
}

impl FsBundler {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            read: Arc::default(),
        }
    }
}

impl Bundler for FsBundler {
    fn bundle(&self, options: &BundlerOptions) -> PacketStream {
        let root = self.root.clone();
        let options = options.clone();
        let read = self.read.clone();

        stream::once(async move {
            let modules = tokio::task::spawn_blocking(move || {
                // Files read before a failure still count, so a broken
                // build can be fixed by editing any of them.
                let mut files = Vec::new();
                let result = resolve_graph(&root, &options, &mut files);
                *read.lock().unwrap_or_else(PoisonError::into_inner) = files;
                result
            })
            .await??;

            Ok::<_, PipelineError>(stream::iter(
                modules.into_iter().map(|m| Ok(Packet::Module(m))),
            ))
        })
        .try_flatten()
        .boxed()
    }

    fn watched(&self) -> Vec<Utf8PathBuf> {
        self.read
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
struct Visited {
    source: String,
    deps: BTreeMap<String, Option<Utf8PathBuf>>,
}

#[derive(Deserialize)]
struct PackageJson {
    main: Option<String>,
    browser: Option<serde_json::Value>,
}

/// Every file visited is pushed onto `files`, also when the walk fails.
fn resolve_graph(
    root: &Utf8Path,
    options: &BundlerOptions,
    files: &mut Vec<Utf8PathBuf>,
) -> Result<Vec<ModuleRecord>, PipelineError> {
    let entries: BTreeSet<Utf8PathBuf> = options
        .entries
        .iter()
        .map(|entry| normalize_path(&root.join(entry)))
        .collect();

    let mut visited: BTreeMap<Utf8PathBuf, Visited> = BTreeMap::new();
    let mut queue: VecDeque<Utf8PathBuf> = entries.iter().cloned().collect();

    while let Some(file) = queue.pop_front() {
        if visited.contains_key(&file) {
            continue;
        }
        files.push(file.clone());

        let mut source = std::fs::read_to_string(&file)
            .map_err(|err| PipelineError::Read(file.clone(), err))?;

        for transform in &options.transforms {
            if transform.applies_to(&file) {
                source = transform.transform(&file, source).map_err(|source| {
                    PipelineError::Transform {
                        name: transform.name(),
                        file: file.clone(),
                        source,
                    }
                })?;
            }
        }

        let mut deps = BTreeMap::new();
        for specifier in scan_specifiers(&source) {
            let resolved = resolve_specifier(root, &file, &specifier, options)?;
            if let Some(path) = &resolved {
                queue.push_back(path.clone());
            }
            deps.insert(specifier, resolved);
        }

        visited.insert(file, Visited { source, deps });
    }

    let ids: BTreeMap<&Utf8Path, String> = visited
        .keys()
        .enumerate()
        .map(|(index, path)| {
            let id = if options.full_paths {
                relative_to(root, path).to_string()
            } else {
                (index + 1).to_string()
            };
            (path.as_path(), id)
        })
        .collect();

    let modules = visited
        .iter()
        .map(|(path, visited)| ModuleRecord {
            id: ids[path.as_path()].clone(),
            file: relative_to(root, path),
            source: visited.source.clone(),
            deps: visited
                .deps
                .iter()
                .map(|(spec, dep)| {
                    let id = dep.as_deref().map(|dep| ids[dep].clone());
                    (spec.clone(), id)
                })
                .collect(),
            entry: entries.contains(path),
        })
        .collect();

    Ok(modules)
}

fn scan_specifiers(source: &str) -> BTreeSet<String> {
    RE_REQUIRE
        .captures_iter(source)
        .chain(RE_IMPORT.captures_iter(source))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Name of the package a bare specifier points into.
fn package_name(specifier: &str) -> &str {
    let mut parts = specifier.splitn(3, '/');
    match (parts.next(), parts.next()) {
        (Some(scope), Some(name)) if scope.starts_with('@') => {
            &specifier[..scope.len() + 1 + name.len()]
        }
        (Some(name), _) => name,
        _ => specifier,
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}

/// `Ok(None)` means the dependency is deliberately left out of the bundle.
fn resolve_specifier(
    root: &Utf8Path,
    from: &Utf8Path,
    specifier: &str,
    options: &BundlerOptions,
) -> Result<Option<Utf8PathBuf>, PipelineError> {
    let dir = from.parent().unwrap_or(root);

    if !is_relative(specifier) {
        let package = package_name(specifier);
        let listed = |list: &[String]| list.iter().any(|s| s == specifier || s == package);

        if listed(&options.ignore) || listed(&options.external) {
            return Ok(None);
        }
    }

    let resolved = if is_relative(specifier) {
        resolve_file(&normalize_path(&dir.join(specifier)), &options.extensions)
    } else {
        resolve_package(dir, specifier, &options.extensions)
    };

    let Some(resolved) = resolved else {
        return Err(PipelineError::Resolve {
            specifier: specifier.to_string(),
            from: relative_to(root, from),
        });
    };

    let relative = relative_to(root, &resolved);
    if options.exclude.iter().any(|p| p.matches(relative.as_str())) {
        return Ok(None);
    }

    Ok(Some(resolved))
}

fn resolve_file(candidate: &Utf8Path, extensions: &[String]) -> Option<Utf8PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_owned());
    }

    for ext in extensions {
        let with_ext = Utf8PathBuf::from(format!("{candidate}{ext}"));
        if with_ext.is_file() {
            return Some(with_ext);
        }
    }

    if candidate.is_dir() {
        return resolve_directory(candidate, extensions);
    }

    None
}

fn resolve_directory(dir: &Utf8Path, extensions: &[String]) -> Option<Utf8PathBuf> {
    if let Ok(text) = std::fs::read_to_string(dir.join("package.json"))
        && let Ok(package) = serde_json::from_str::<PackageJson>(&text)
    {
        let main = match package.browser {
            Some(serde_json::Value::String(browser)) => Some(browser),
            _ => package.main,
        };

        if let Some(main) = main
            && let Some(found) = resolve_file(&normalize_path(&dir.join(&main)), extensions)
        {
            return Some(found);
        }
    }

    extensions
        .iter()
        .map(|ext| dir.join(format!("index{ext}")))
        .find(|index| index.is_file())
}

fn resolve_package(from: &Utf8Path, specifier: &str, extensions: &[String]) -> Option<Utf8PathBuf> {
    from.ancestors()
        .map(|dir| dir.join("node_modules").join(specifier))
        .find_map(|candidate| resolve_file(&candidate, extensions))
}

fn relative_to(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    path.strip_prefix(root)
        .map(Utf8Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
