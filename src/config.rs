//! Project configuration, read from `build.json`.
use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::factor::DEFAULT_SIZE_LIMIT;
use crate::render::RenderConfig;

/// A standalone bundle built from a single entry file, without factoring.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BundleSpec {
    /// Output file name, without the `.js` extension.
    pub label: String,
    pub entry: Utf8PathBuf,
}

/// Features code fences may name, and the ones this build keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub all: BTreeSet<String>,
    #[serde(default)]
    pub active: BTreeSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Project root, relative to the directory of the config file.
    #[serde(default = "default_root")]
    pub root: Utf8PathBuf,
    /// Output directory, relative to the root.
    #[serde(default = "default_dist")]
    pub dist: Utf8PathBuf,
    pub platforms: Vec<String>,
    #[serde(default)]
    pub version: String,
    /// Chunk size ceiling in bytes.
    #[serde(default = "default_size_limit")]
    pub size_limit: usize,
    /// Entry points of the factored build.
    pub entry_points: Vec<Utf8PathBuf>,
    /// Named sets of standalone bundles, each set built in order.
    #[serde(default)]
    pub bundles: BTreeMap<String, Vec<BundleSpec>>,
    #[serde(default)]
    pub render: RenderConfig,
    /// Project variables, visible through `process.env`.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Globs of files never bundled, relative to the root.
    #[serde(default)]
    pub ignored_files: Vec<String>,
    #[serde(default)]
    pub features: Features,
    /// Packages replaced with nothing outside `dev` builds.
    #[serde(default)]
    pub dev_only_packages: Vec<String>,
    /// Extra tasks, as `series`/`parallel` compositions of other tasks.
    #[serde(default)]
    pub tasks: BTreeMap<String, Value>,
    /// Preferred port of the live reload server.
    #[serde(default = "default_reload_port")]
    pub reload_port: u16,
}

fn default_root() -> Utf8PathBuf {
    ".".into()
}

fn default_dist() -> Utf8PathBuf {
    "dist".into()
}

fn default_size_limit() -> usize {
    DEFAULT_SIZE_LIMIT
}

fn default_reload_port() -> u16 {
    1337
}

impl ProjectConfig {
    /// Read and validate the config file. A relative `root` is resolved
    /// against the directory holding the file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_owned(), e))?;

        let mut config = Self::parse(&text)?;
        if config.root.is_relative()
            && let Some(dir) = path.parent()
        {
            config.root = crate::utils::normalize_path(&dir.join(&config.root));
        }

        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.platforms.is_empty() {
            return Err(ConfigError::Empty("platform"));
        }
        if self.entry_points.is_empty() {
            return Err(ConfigError::Empty("entry point"));
        }
        if let Some(unknown) = self.features.active.difference(&self.features.all).next() {
            return Err(ConfigError::UnknownFeature(unknown.clone()));
        }
        self.ignored_patterns()?;
        Ok(())
    }

    pub fn ignored_patterns(&self) -> Result<Vec<glob::Pattern>, ConfigError> {
        self.ignored_files
            .iter()
            .map(|pattern| glob::Pattern::new(pattern).map_err(ConfigError::from))
            .collect()
    }

    pub fn dist_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.dist)
    }

    /// `dist/<platform>` for every platform.
    pub fn platform_dirs(&self) -> Vec<Utf8PathBuf> {
        let dist = self.dist_dir();
        self.platforms
            .iter()
            .map(|platform| dist.join(platform))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "platforms": ["chrome", "firefox"],
        "entryPoints": ["app/scripts/ui.js", "app/scripts/background.js"]
    }"#;

    #[test]
    fn test_defaults() {
        let config = ProjectConfig::parse(MINIMAL).unwrap();

        assert_eq!(config.root, ".");
        assert_eq!(config.dist, "dist");
        assert_eq!(config.size_limit, 2_000_000);
        assert_eq!(config.reload_port, 1337);
        assert!(config.bundles.is_empty());
        assert!(config.tasks.is_empty());
        assert!(config.render.rules.contains_key("ui"));
    }

    #[test]
    fn test_full() {
        let config = ProjectConfig::parse(
            r#"{
                "root": "ext",
                "platforms": ["chrome"],
                "version": "11.2.0",
                "sizeLimit": 1000,
                "entryPoints": ["app/scripts/ui.js"],
                "bundles": {
                    "contentscript": [
                        { "label": "inpage", "entry": "app/scripts/inpage.js" },
                        { "label": "contentscript", "entry": "app/scripts/contentscript.js" }
                    ]
                },
                "variables": { "SENTRY_DSN": null, "DEBUG": true },
                "ignoredFiles": ["app/scripts/mmi/**"],
                "features": { "all": ["flask", "snaps"], "active": ["snaps"] },
                "devOnlyPackages": ["remote-redux-devtools"],
                "tasks": { "build": { "series": ["clean", "scripts:core:prod"] } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.version, "11.2.0");
        assert_eq!(config.size_limit, 1000);
        assert_eq!(
            config.bundles["contentscript"]
                .iter()
                .map(|b| b.label.as_str())
                .collect::<Vec<_>>(),
            vec!["inpage", "contentscript"]
        );
        assert_eq!(config.variables["SENTRY_DSN"], Value::Null);
        assert_eq!(config.ignored_patterns().unwrap().len(), 1);
        assert!(config.features.active.contains("snaps"));
        assert_eq!(config.features.all.len(), 2);
        assert_eq!(config.platform_dirs(), vec![Utf8PathBuf::from("ext/dist/chrome")]);
    }

    #[test]
    fn test_validation() {
        let no_platforms = r#"{ "platforms": [], "entryPoints": ["a.js"] }"#;
        assert!(matches!(
            ProjectConfig::parse(no_platforms),
            Err(ConfigError::Empty("platform"))
        ));

        let no_entries = r#"{ "platforms": ["chrome"], "entryPoints": [] }"#;
        assert!(matches!(
            ProjectConfig::parse(no_entries),
            Err(ConfigError::Empty("entry point"))
        ));

        let bad_glob = r#"{ "platforms": ["chrome"], "entryPoints": ["a.js"], "ignoredFiles": ["a/***"] }"#;
        assert!(matches!(
            ProjectConfig::parse(bad_glob),
            Err(ConfigError::GlobPattern(_))
        ));

        let undeclared = r#"{ "platforms": ["chrome"], "entryPoints": ["a.js"], "features": { "active": ["flask"] } }"#;
        assert!(matches!(
            ProjectConfig::parse(undeclared),
            Err(ConfigError::UnknownFeature(f)) if f == "flask"
        ));

        assert!(matches!(
            ProjectConfig::parse("{ \"platforms\": "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_resolves_root() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(base.join("build.json"), MINIMAL).unwrap();

        let config = ProjectConfig::load(&base.join("build.json")).unwrap();
        assert_eq!(config.root, base);
        assert_eq!(config.dist_dir(), base.join("dist"));

        assert!(matches!(
            ProjectConfig::load(&base.join("missing.json")),
            Err(ConfigError::Read(..))
        ));
    }
}
