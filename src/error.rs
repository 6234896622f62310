use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TsumugiError {
    #[error("Failed to build runtime")]
    RuntimeBuild(#[from] std::io::Error),

    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Task '{0}' failed:\n{1:?}")]
    Run(String, anyhow::Error),
}

/// Problems with the composition of tasks, detected before any task body
/// starts running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Unrecognized task '{0}'")]
    UnknownTask(String),

    #[error("Invalid task value: {0}")]
    InvalidTaskValue(String),
}

/// Aggregate failure of a parallel composition. Every member has settled by
/// the time this is returned.
#[derive(Debug, Error)]
#[error("{} of {total} parallel tasks failed, first error: {:#}", failures.len(), failures[0])]
pub struct ParallelError {
    pub total: usize,
    pub failures: Vec<anyhow::Error>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Couldn't read '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't write '{0}'.\n{1}")]
    Write(Utf8PathBuf, std::io::Error),

    #[error("Cannot find module '{specifier}' from '{from}'")]
    Resolve { specifier: String, from: Utf8PathBuf },

    #[error("Transform '{name}' failed on '{file}':\n{source:#}")]
    Transform {
        name: &'static str,
        file: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("Minification of '{file}' failed:\n{source:#}")]
    Minify {
        file: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("Malformed source map for '{0}'.\n{1}")]
    SourceMap(Utf8PathBuf, serde_json::Error),

    #[error("Malformed inline source map in '{0}'.\n{1}")]
    InlineMap(Utf8PathBuf, base64::DecodeError),

    #[error("Couldn't serialize bundle metadata.\n{0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Factor(#[from] FactorError),

    #[error("Unknown pipeline stage '{0}'")]
    UnknownStage(String),

    #[error("Background job panicked or was cancelled.\n{0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Bundle hook failed:\n{0:#}")]
    Hook(anyhow::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FactorError {
    #[error("Entry points '{0}' and '{1}' share the label '{2}'")]
    DuplicateEntryLabel(Utf8PathBuf, Utf8PathBuf, String),

    #[error("Module '{0}' depends on '{1}', which is missing from the graph")]
    MissingModule(String, String),

    #[error("Entry point '{0}' uses the label '{1}', which is reserved for shared modules")]
    ReservedEntryLabel(Utf8PathBuf, String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Unknown group label '{0}', no render rule is defined for it")]
    UnknownGroupLabel(String),

    #[error("Couldn't read template '{0}'.\n{1}")]
    Template(Utf8PathBuf, std::io::Error),

    #[error("Couldn't render template '{0}'.\n{1}")]
    Render(String, minijinja::Error),

    #[error("Couldn't write '{0}'.\n{1}")]
    Write(Utf8PathBuf, std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse config file.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Couldn't compile ignore pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Config must list at least one {0}")]
    Empty(&'static str),

    #[error("Active feature '{0}' is not declared in `features.all`")]
    UnknownFeature(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VariableError {
    #[error("Tried to access an undeclared environment variable '{0}'")]
    Missing(String),
}

#[derive(Debug, Error)]
pub enum StepClearError {
    #[error("Couldn't remove the dist directory.\n{0}")]
    Remove(std::io::Error),

    #[error("Couldn't create the dist directory.\n{0}")]
    Create(std::io::Error),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),
}
