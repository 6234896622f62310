//! Build definitions: the script tasks of every build target.
//!
//! For each [`BuildTarget`] the following tasks are registered, with
//! `<prefix>` being `scripts:core:<target>`:
//!
//! - `<prefix>:standardEntryPoints` builds the factored bundle of all entry
//!   points and renders the HTML shells and loaders next to it,
//! - `<prefix>:<set>` builds each standalone bundle of a configured bundle
//!   set, in order,
//! - `<prefix>` runs all of the above in parallel.
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8Path;

use crate::bundle::{
    BuildConfiguration, Defaults, FsBundler, configure_defaults, create_bundle,
};
use crate::config::{BundleSpec, ProjectConfig};
use crate::error::{ConfigError, StepClearError, TaskError};
use crate::factor::{GroupingMap, factor};
use crate::pipeline::{EsbuildMinifier, Minifier, StageName, dest};
use crate::render::ArtifactRenderer;
use crate::target::{BuildTarget, CiInfo, Environment};
use crate::task::{Registry, TaskBody, TaskItem};
use crate::variables::Variables;

#[cfg(feature = "live")]
use crate::watch::LiveReload;

/// Label of the factored build of all entry points.
pub const STANDARD_ENTRY_POINTS: &str = "standardEntryPoints";

pub fn task_prefix(target: BuildTarget) -> String {
    format!("scripts:core:{}", target.task_segment())
}

#[derive(Clone)]
pub struct Scripts {
    project: Arc<ProjectConfig>,
    ci: CiInfo,
    minifier: Arc<dyn Minifier>,
    #[cfg(feature = "live")]
    reload: Arc<Mutex<Option<LiveReload>>>,
}

impl Scripts {
    pub fn new(project: ProjectConfig) -> Self {
        Self {
            project: Arc::new(project),
            ci: CiInfo::from_env(),
            minifier: Arc::new(EsbuildMinifier::default()),
            #[cfg(feature = "live")]
            reload: Arc::default(),
        }
    }

    pub fn with_ci(mut self, ci: CiInfo) -> Self {
        self.ci = ci;
        self
    }

    pub fn with_minifier(mut self, minifier: Arc<dyn Minifier>) -> Self {
        self.minifier = minifier;
        self
    }

    /// Register the script tasks of every target, `clean`, and the tasks
    /// composed in the project config.
    pub fn register(&self, registry: &Registry) -> Result<(), TaskError> {
        for target in BuildTarget::ALL {
            self.register_target(registry, target)?;
        }

        let dist = self.project.dist_dir();
        registry.register(
            "clean",
            TaskBody::new(move || {
                let dist = dist.clone();
                async move { Ok(clean(&dist).await?) }
            }),
        )?;

        for (name, value) in &self.project.tasks {
            registry.register(name.as_str(), registry.compose(value)?)?;
        }

        Ok(())
    }

    fn register_target(&self, registry: &Registry, target: BuildTarget) -> Result<(), TaskError> {
        let prefix = task_prefix(target);
        let mut subtasks = Vec::new();

        let standard = format!("{prefix}:{STANDARD_ENTRY_POINTS}");
        let scripts = self.clone();
        registry.register(
            standard.as_str(),
            TaskBody::new(move || {
                let scripts = scripts.clone();
                async move { scripts.build_factored(target).await }
            }),
        )?;
        subtasks.push(standard);

        for (set, specs) in &self.project.bundles {
            let bundles = specs.iter().map(|spec| {
                let scripts = self.clone();
                let spec = spec.clone();
                TaskItem::from(TaskBody::new(move || {
                    let scripts = scripts.clone();
                    let spec = spec.clone();
                    async move { scripts.build_normal(target, &spec).await }
                }))
            });

            let name = format!("{prefix}:{set}");
            registry.register(name.as_str(), registry.series(bundles.collect::<Vec<_>>()))?;
            subtasks.push(name);
        }

        registry.register(prefix, registry.parallel(subtasks))
    }

    fn defaults(&self, target: BuildTarget) -> Result<Defaults, ConfigError> {
        let environment = Environment::detect(target, &self.ci);
        let variables = Variables::for_build(
            &self.project.variables,
            target,
            environment,
            &self.project.version,
        );

        Ok(Defaults {
            variables: Some(Arc::new(variables)),
            features: Some(Arc::new(self.project.features.clone())),
            minifier: self.minifier.clone(),
            ignored_files: self.project.ignored_patterns()?,
            dev_only_packages: self.project.dev_only_packages.clone(),
            ..Defaults::for_target(target)
        })
    }

    /// All entry points in one bundle run, factored into size-capped chunks.
    async fn build_factored(&self, target: BuildTarget) -> anyhow::Result<()> {
        let project = &self.project;

        let mut config = BuildConfiguration::new(STANDARD_ENTRY_POINTS);
        config.options.entries = project.entry_points.clone();
        configure_defaults(&mut config, self.defaults(target)?);

        let grouping = Arc::new(Mutex::new(GroupingMap::new()));
        let limit = project.size_limit;
        let dirs = project.platform_dirs();

        let shared = grouping.clone();
        config.on_configure_pipeline(move |pipeline| {
            pipeline
                .get(StageName::Groups)
                .push(factor(limit, shared.clone()));
            pipeline.get(StageName::Dest).push(dest(dirs.clone()));
        });

        let renderer = Arc::new(ArtifactRenderer::new(
            &project.root,
            &project.dist,
            project.platforms.clone(),
            project.render.clone(),
        ));

        config.on_bundle_done(move || {
            let renderer = renderer.clone();
            let grouping = grouping.clone();

            async move {
                let map = grouping.lock().unwrap_or_else(PoisonError::into_inner).clone();
                let written = tokio::task::spawn_blocking(move || renderer.render(&map)).await??;
                tracing::debug!("Rendered {} artifacts", written.len());
                Ok(())
            }
        });

        self.attach_live_reload(&mut config, target)?;

        create_bundle(config, Arc::new(FsBundler::new(&project.root))).await?;
        Ok(())
    }

    /// A single entry point written to `<label>.js`.
    async fn build_normal(&self, target: BuildTarget, spec: &BundleSpec) -> anyhow::Result<()> {
        let project = &self.project;

        let mut config = BuildConfiguration::new(spec.label.as_str());
        config.options.entries = vec![spec.entry.clone()];
        configure_defaults(&mut config, self.defaults(target)?);

        let dirs = project.platform_dirs();
        config.on_configure_pipeline(move |pipeline| {
            pipeline.get(StageName::Dest).push(dest(dirs.clone()));
        });

        self.attach_live_reload(&mut config, target)?;

        create_bundle(config, Arc::new(FsBundler::new(&project.root))).await?;
        Ok(())
    }

    #[cfg(feature = "live")]
    fn attach_live_reload(
        &self,
        config: &mut BuildConfiguration,
        target: BuildTarget,
    ) -> anyhow::Result<()> {
        if !target.is_dev() {
            return Ok(());
        }

        let reload = {
            let mut slot = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(reload) => reload.clone(),
                None => slot.insert(LiveReload::start(self.project.reload_port)?).clone(),
            }
        };

        config.on_bundle_done(move || {
            reload.notify();
            async { Ok(()) }
        });

        Ok(())
    }

    #[cfg(not(feature = "live"))]
    fn attach_live_reload(
        &self,
        _config: &mut BuildConfiguration,
        _target: BuildTarget,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for Scripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripts")
            .field("project", &self.project)
            .field("ci", &self.ci)
            .finish_non_exhaustive()
    }
}

/// Remove the output directory and recreate it empty.
pub async fn clean(dist: &Utf8Path) -> Result<(), StepClearError> {
    match tokio::fs::remove_dir_all(dist).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(StepClearError::Remove(e)),
    }

    tokio::fs::create_dir_all(dist)
        .await
        .map_err(StepClearError::Create)
}
