//! One bundle run: configuration, defaults and the run itself.
mod module;
mod resolve;
mod transform;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8PathBuf;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::config::Features;
use crate::error::PipelineError;
use crate::pipeline::sourcemap::{self, MapTarget};
use crate::pipeline::{EsbuildMinifier, Minifier, PacketStream, Pipeline, StageName};
use crate::target::BuildTarget;
use crate::task::end_of_stream;
use crate::variables::Variables;

pub use module::ModuleRecord;
pub use resolve::{Bundler, FsBundler};
pub use transform::{EnvInject, InlineFileRead, RemoveFencedCode, Transform, Transpile};

type ConfigureHook = Box<dyn Fn(&mut Pipeline) + Send + Sync>;
type StreamHook = Box<dyn Fn(PacketStream) -> PacketStream + Send + Sync>;
type DoneHook = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Bundler plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plugin {
    /// Keep rebuilding whenever one of the bundled files changes.
    Watch,
}

/// Everything the bundler needs to know to walk the module graph.
#[derive(Clone, Default)]
pub struct BundlerOptions {
    pub entries: Vec<Utf8PathBuf>,
    pub transforms: Vec<Arc<dyn Transform>>,
    pub plugins: Vec<Plugin>,
    pub extensions: Vec<String>,
    /// Left for the runtime to provide.
    pub external: Vec<String>,
    /// Replaced with nothing.
    pub ignore: Vec<String>,
    /// Files matching these are never bundled, relative to the project root.
    pub exclude: Vec<glob::Pattern>,
    /// Use project-relative paths as module ids instead of numbers.
    pub full_paths: bool,
}

impl std::fmt::Debug for BundlerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transforms: Vec<_> = self.transforms.iter().map(|t| t.name()).collect();
        f.debug_struct("BundlerOptions")
            .field("entries", &self.entries)
            .field("transforms", &transforms)
            .field("plugins", &self.plugins)
            .field("extensions", &self.extensions)
            .field("external", &self.external)
            .field("ignore", &self.ignore)
            .field("exclude", &self.exclude)
            .field("full_paths", &self.full_paths)
            .finish()
    }
}

/// State of a single bundle run. Hooks subscribed here only ever see the run
/// owning this configuration.
pub struct BuildConfiguration {
    label: String,
    pub options: BundlerOptions,
    configure: Vec<ConfigureHook>,
    stream: Vec<StreamHook>,
    done: Vec<DoneHook>,
}

impl BuildConfiguration {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            options: BundlerOptions::default(),
            configure: Vec::new(),
            stream: Vec::new(),
            done: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Called with a fresh pipeline at the start of every run, before any
    /// data flows.
    pub fn on_configure_pipeline<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&mut Pipeline) + Send + Sync + 'static,
    {
        self.configure.push(Box::new(hook));
        self
    }

    /// Wraps the raw bundler stream of every run before it enters the
    /// pipeline. Hooks apply in subscription order.
    pub fn on_bundle_stream<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(PacketStream) -> PacketStream + Send + Sync + 'static,
    {
        self.stream.push(Box::new(hook));
        self
    }

    /// Called after the pipeline of a run drained without errors.
    pub fn on_bundle_done<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.done.push(Box::new(move || hook().boxed()));
        self
    }
}

impl std::fmt::Debug for BuildConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildConfiguration")
            .field("label", &self.label)
            .field("options", &self.options)
            .field("configure", &self.configure.len())
            .field("stream", &self.stream.len())
            .field("done", &self.done.len())
            .finish()
    }
}

/// Knobs for [`configure_defaults`].
#[derive(Clone)]
pub struct Defaults {
    pub target: BuildTarget,
    /// Inline source maps, never minify.
    pub dev_mode: bool,
    pub variables: Option<Arc<Variables>>,
    /// Fenced code is stripped for every feature not active here.
    pub features: Option<Arc<Features>>,
    pub reload_on_change: bool,
    pub minify: bool,
    pub minifier: Arc<dyn Minifier>,
    pub ignored_files: Vec<glob::Pattern>,
    /// Packages which only make sense in `dev` builds.
    pub dev_only_packages: Vec<String>,
}

impl Defaults {
    pub fn for_target(target: BuildTarget) -> Self {
        let dev_mode = target.is_dev();
        Self {
            target,
            dev_mode,
            variables: None,
            features: None,
            reload_on_change: dev_mode,
            minify: !dev_mode,
            minifier: Arc::new(EsbuildMinifier::default()),
            ignored_files: Vec::new(),
            dev_only_packages: Vec::new(),
        }
    }
}

/// Fill in the bundler options and pipeline hooks every bundle shares.
pub fn configure_defaults(config: &mut BuildConfiguration, defaults: Defaults) {
    let options = &mut config.options;

    if let Some(features) = defaults.features {
        options.transforms.push(Arc::new(RemoveFencedCode::new(features)));
    }
    options.transforms.push(Arc::new(Transpile::default()));
    options.transforms.push(Arc::new(InlineFileRead));
    if let Some(variables) = defaults.variables {
        options.transforms.push(Arc::new(EnvInject::new(variables)));
    }

    options.extensions = vec![".js".into(), ".ts".into(), ".tsx".into()];
    options.full_paths = defaults.target.is_dev() || defaults.target.is_test();

    if defaults.target != BuildTarget::Dev {
        options.ignore.extend(defaults.dev_only_packages);
    }

    options.exclude.extend(defaults.ignored_files);

    if defaults.reload_on_change {
        options.plugins.push(Plugin::Watch);
    }

    if defaults.minify && !defaults.dev_mode {
        let minifier = defaults.minifier;
        config.on_configure_pipeline(move |pipeline| {
            pipeline
                .get(StageName::Minify)
                .push(crate::pipeline::minify(minifier.clone()));
        });
    }

    let target = if defaults.dev_mode {
        MapTarget::Inline
    } else {
        MapTarget::External {
            dir: "../sourcemaps".into(),
            add_comment: false,
        }
    };

    config.on_configure_pipeline(move |pipeline| {
        pipeline
            .get(StageName::SourcemapsInit)
            .push(sourcemap::init());
        pipeline
            .get(StageName::SourcemapsWrite)
            .push(sourcemap::write(target.clone()));
    });
}

/// Build the bundle once. With the watch plugin on, a failed first build is
/// only reported, and a background watcher keeps rebuilding the bundle.
pub async fn create_bundle(
    config: BuildConfiguration,
    bundler: Arc<dyn Bundler>,
) -> Result<(), PipelineError> {
    let watch = config.options.plugins.contains(&Plugin::Watch);
    let start = Instant::now();

    tracing::info!("Bundle start: '{}'", config.label);

    if watch {
        rebuild(&config, bundler.as_ref()).await;
    } else {
        perform_bundle(&config, bundler.as_ref()).await?;
    }

    tracing::info!(
        "Bundle end: '{}' {}",
        config.label,
        crate::utils::as_overhead(start)
    );

    if watch {
        #[cfg(feature = "live")]
        crate::watch::spawn_watcher(config, bundler);

        #[cfg(not(feature = "live"))]
        tracing::warn!("Watching '{}' requires the `live` feature", config.label);
    }

    Ok(())
}

/// Run the whole pipeline once.
pub async fn perform_bundle(
    config: &BuildConfiguration,
    bundler: &dyn Bundler,
) -> Result<(), PipelineError> {
    let mut pipeline = Pipeline::new();

    for hook in &config.configure {
        hook(&mut pipeline);
    }

    if pipeline.get(StageName::Groups).is_empty() {
        pipeline
            .get(StageName::Groups)
            .push(crate::factor::single_group(config.label.clone()));
    }

    if pipeline.get(StageName::Container).is_empty() {
        pipeline
            .get(StageName::Container)
            .push(crate::pipeline::container());
    }

    tracing::debug!("Pipeline for '{}': {pipeline:?}", config.label);

    let raw = config
        .stream
        .iter()
        .fold(bundler.bundle(&config.options), |raw, hook| hook(raw));
    let packets = end_of_stream(pipeline.into_stream(raw)).await?;
    tracing::debug!("'{}' produced {packets} packets", config.label);

    for hook in &config.done {
        hook().await.map_err(PipelineError::Hook)?;
    }

    Ok(())
}

/// Run a bundle pass for watch mode. Failures are reported and swallowed so
/// the watcher survives a broken intermediate build.
pub async fn rebuild(config: &BuildConfiguration, bundler: &dyn Bundler) -> bool {
    match perform_bundle(config, bundler).await {
        Ok(()) => true,
        Err(err) => {
            graceful_error(&err);
            false
        }
    }
}

fn graceful_error(err: &dyn Display) {
    tracing::warn!("{err}");
    crate::utils::bell();
}
