//! HTML shells and loader scripts written next to the factored bundles.
//!
//! Every entry label of the grouping map must have a [`RenderRule`]. Each
//! rule names HTML templates, rendered with `minijinja`, and optionally a
//! loader script: a copy of the loader template with the `/* SCRIPTS */`
//! marker replaced by the ordered list of scripts to load.
use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use minijinja::{Environment, Value};
use serde::Deserialize;

use crate::error::RenderError;
use crate::factor::{COMMON, GroupingMap};

const SCRIPTS_MARKER: &str = "/* SCRIPTS */";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRule {
    /// Template names, each read from `<templates>/<name>.html`.
    #[serde(default)]
    pub html: Vec<String>,
    /// File name of the loader script to emit, if any.
    #[serde(default)]
    pub loader: Option<String>,
}

impl RenderRule {
    pub fn html(names: &[&str]) -> Self {
        Self {
            html: names.iter().map(|name| name.to_string()).collect(),
            loader: None,
        }
    }

    pub fn with_loader(mut self, file: impl Into<String>) -> Self {
        self.loader = Some(file.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderConfig {
    /// Directory holding the HTML templates, relative to the project root.
    pub templates: Utf8PathBuf,
    /// Loader script template, relative to the project root.
    pub loader_template: Utf8PathBuf,
    /// Scripts every loader pulls in before the bundles.
    pub preamble: Vec<String>,
    pub rules: BTreeMap<String, RenderRule>,
    /// Extra variables exposed to HTML templates.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        let rules = [
            (
                "ui",
                RenderRule::html(&["popup", "notification", "home"]).with_loader("load-app.js"),
            ),
            (
                "background",
                RenderRule::html(&["background"]).with_loader("load-background.js"),
            ),
            ("content-script", RenderRule::html(&["trezor-usb-permissions"])),
            ("offscreen", RenderRule::default().with_loader("load-offscreen.js")),
        ];

        let preamble = [
            "./snow.js",
            "./use-snow.js",
            "./globalthis.js",
            "./sentry-install.js",
            "./lockdown-install.js",
            "./lockdown-run.js",
            "./lockdown-more.js",
            "./runtime-cjs.js",
        ];

        Self {
            templates: "app".into(),
            loader_template: "app/scripts/load-app.js".into(),
            preamble: preamble.map(String::from).to_vec(),
            rules: rules
                .into_iter()
                .map(|(label, rule)| (label.to_string(), rule))
                .collect(),
            context: BTreeMap::new(),
        }
    }
}

/// Scripts a page for `label` has to load: every common chunk, then the
/// label's own chunks.
pub fn scripts_for(grouping: &GroupingMap, label: &str) -> Vec<String> {
    let common = grouping.get(COMMON).into_iter().flatten();
    let own = grouping.get(label).into_iter().flatten();

    common
        .chain(own)
        .map(|chunk| format!("./{chunk}.js"))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ArtifactRenderer {
    root: Utf8PathBuf,
    dist: Utf8PathBuf,
    platforms: Vec<String>,
    config: RenderConfig,
}

impl ArtifactRenderer {
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        dist: impl Into<Utf8PathBuf>,
        platforms: Vec<String>,
        config: RenderConfig,
    ) -> Self {
        Self {
            root: root.into(),
            dist: dist.into(),
            platforms,
            config,
        }
    }

    /// Render every artifact for the grouping, returning the written paths.
    /// Labels are checked against the rules before anything is written.
    pub fn render(&self, grouping: &GroupingMap) -> Result<Vec<Utf8PathBuf>, RenderError> {
        let mut jobs = Vec::new();
        for label in grouping.keys().filter(|label| *label != COMMON) {
            let rule = self
                .config
                .rules
                .get(label)
                .ok_or_else(|| RenderError::UnknownGroupLabel(label.clone()))?;
            jobs.push((label, rule));
        }

        let env = Environment::new();
        let mut written = Vec::new();

        for (label, rule) in jobs {
            let scripts = scripts_for(grouping, label);

            for name in &rule.html {
                let html = self.render_html(&env, name, &scripts)?;
                written.extend(self.write_all(&format!("{name}.html"), &html)?);
            }

            if let Some(file) = &rule.loader {
                let loader = self.render_loader(&scripts)?;
                written.extend(self.write_all(file, &loader)?);
            }

            tracing::debug!("Rendered artifacts for '{label}'");
        }

        Ok(written)
    }

    fn render_html(
        &self,
        env: &Environment,
        name: &str,
        scripts: &[String],
    ) -> Result<String, RenderError> {
        let path = self.root.join(&self.config.templates).join(format!("{name}.html"));
        let source = read(&path)?;

        let mut context = self.config.context.clone();
        context.insert("scripts".into(), scripts.into());

        env.render_str(&source, Value::from_serialize(&context))
            .map_err(|e| RenderError::Render(name.to_string(), e))
    }

    fn render_loader(&self, scripts: &[String]) -> Result<String, RenderError> {
        let source = read(&self.root.join(&self.config.loader_template))?;

        let required: Vec<&str> = self
            .config
            .preamble
            .iter()
            .chain(scripts)
            .map(String::as_str)
            .collect();

        let list = serde_json::to_string(&required)?;
        Ok(source.replace(SCRIPTS_MARKER, &format!("...{list}")))
    }

    fn write_all(&self, file: &str, contents: &str) -> Result<Vec<Utf8PathBuf>, RenderError> {
        let mut written = Vec::with_capacity(self.platforms.len());

        for platform in &self.platforms {
            let dir = self.root.join(&self.dist).join(platform);
            std::fs::create_dir_all(&dir).map_err(|e| RenderError::Write(dir.clone(), e))?;

            let path = dir.join(file);
            std::fs::write(&path, contents).map_err(|e| RenderError::Write(path.clone(), e))?;
            written.push(path);
        }

        Ok(written)
    }
}

fn read(path: &Utf8Path) -> Result<String, RenderError> {
    std::fs::read_to_string(path).map_err(|e| RenderError::Template(path.to_owned(), e))
}
