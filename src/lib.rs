#![forbid(unsafe_code)]
//! Task-composed build orchestrator for multi-platform script bundles.
//!
//! Work is described as named tasks in a [`Registry`] and combined with
//! [`Registry::series`] and [`Registry::parallel`]. Script tasks run bundle
//! builds through a staged streaming [`Pipeline`]: the module graph is walked
//! from its entry points, factored into size-capped chunks shared between
//! entries, packed into containers, minified and written once per platform.

pub mod bundle;
pub mod config;
mod error;
mod esbuild;
pub mod events;
pub mod factor;
pub mod pipeline;
pub mod render;
pub mod scripts;
pub mod target;
pub mod task;
mod utils;
pub mod variables;
#[cfg(feature = "live")]
pub mod watch;

pub use crate::bundle::{
    BuildConfiguration, Bundler, BundlerOptions, Defaults, FsBundler, ModuleRecord,
    configure_defaults, create_bundle, perform_bundle,
};
pub use crate::config::{Features, ProjectConfig};
pub use crate::error::*;
pub use crate::events::Events;
pub use crate::factor::{GroupingMap, ModuleGroup, group_by_factor, group_by_size};
pub use crate::pipeline::{Packet, Pipeline, StageName, Step};
pub use crate::render::ArtifactRenderer;
pub use crate::scripts::Scripts;
pub use crate::target::{BuildTarget, Environment};
pub use crate::task::{Registry, TaskBody, TaskEvent, TaskItem, Timeline};
pub use crate::variables::Variables;

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
