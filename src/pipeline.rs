//! The staged stream pipeline one bundle run flows through.
//!
//! A [`Pipeline`] always consists of the same six stages in the same order.
//! What happens in a stage is decided at configure time, by pushing [`Step`]s
//! onto it. Once configured, the pipeline is folded into a single pull-based
//! stream: every step wraps the stream produced by the step before it.
mod container;
mod dest;
mod minify;
pub mod sourcemap;

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::str::FromStr;

use camino::Utf8PathBuf;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use crate::bundle::ModuleRecord;
use crate::error::PipelineError;
use crate::factor::ModuleGroup;

pub use container::container;
pub use dest::dest;
pub use minify::{EsbuildMinifier, Minified, Minifier, minify};
pub use sourcemap::SourceMap;

/// A file produced by the pipeline, relative to the output directory.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildFile {
    pub path: Utf8PathBuf,
    pub contents: String,
    pub map: Option<SourceMap>,
}

impl BuildFile {
    pub fn new(path: impl Into<Utf8PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            map: None,
        }
    }
}

/// Item flowing through the pipeline. Modules come from the bundler, the
/// `groups` stage turns them into groups, and `container` turns groups into
/// files.
#[derive(Debug, Clone)]
pub enum Packet {
    Module(ModuleRecord),
    Group(ModuleGroup),
    File(BuildFile),
}

pub type PacketStream = BoxStream<'static, Result<Packet, PipelineError>>;

/// The fixed stage vocabulary, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageName {
    Groups,
    Container,
    SourcemapsInit,
    Minify,
    SourcemapsWrite,
    Dest,
}

impl StageName {
    pub const ALL: [StageName; 6] = [
        StageName::Groups,
        StageName::Container,
        StageName::SourcemapsInit,
        StageName::Minify,
        StageName::SourcemapsWrite,
        StageName::Dest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Groups => "groups",
            StageName::Container => "container",
            StageName::SourcemapsInit => "sourcemaps:init",
            StageName::Minify => "minify",
            StageName::SourcemapsWrite => "sourcemaps:write",
            StageName::Dest => "dest",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl Display for StageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| PipelineError::UnknownStage(s.to_string()))
    }
}

/// One processing step. A step takes ownership of the upstream stream and
/// returns the stream downstream steps will pull from.
pub trait Step: Send {
    fn name(&self) -> &str;

    fn apply(self: Box<Self>, input: PacketStream) -> PacketStream;
}

struct FnStep<F> {
    name: &'static str,
    func: F,
}

impl<F> Step for FnStep<F>
where
    F: FnOnce(PacketStream) -> PacketStream + Send,
{
    fn name(&self) -> &str {
        self.name
    }

    fn apply(self: Box<Self>, input: PacketStream) -> PacketStream {
        (self.func)(input)
    }
}

/// Step from a closure over the whole stream.
pub fn from_fn<F>(name: &'static str, func: F) -> impl Step
where
    F: FnOnce(PacketStream) -> PacketStream + Send + 'static,
{
    FnStep { name, func }
}

/// Step transforming every [`BuildFile`] one at a time, in order. Other
/// packets pass through untouched.
pub fn map_files<F, Fut>(name: &'static str, func: F) -> impl Step
where
    F: Fn(BuildFile) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BuildFile, PipelineError>> + Send + 'static,
{
    from_fn(name, move |input| {
        input
            .and_then(move |packet| {
                let file = match packet {
                    Packet::File(file) => Ok(func(file)),
                    other => Err(other),
                };
                async move {
                    match file {
                        Ok(fut) => fut.await.map(Packet::File),
                        Err(other) => Ok(other),
                    }
                }
            })
            .boxed()
    })
}

/// Ordered list of steps of one named stage.
pub struct Stage {
    name: StageName,
    steps: VecDeque<Box<dyn Step>>,
}

impl Stage {
    fn new(name: StageName) -> Self {
        Self {
            name,
            steps: VecDeque::new(),
        }
    }

    pub fn name(&self) -> StageName {
        self.name
    }

    /// Append a step at the end of this stage.
    pub fn push(&mut self, step: impl Step + 'static) -> &mut Self {
        self.steps.push_back(Box::new(step));
        self
    }

    /// Insert a step at the front of this stage.
    pub fn unshift(&mut self, step: impl Step + 'static) -> &mut Self {
        self.steps.push_front(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }
}

/// A pipeline for one bundle run.
pub struct Pipeline {
    stages: [Stage; 6],
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            stages: StageName::ALL.map(Stage::new),
        }
    }

    pub fn get(&mut self, name: StageName) -> &mut Stage {
        &mut self.stages[name.index()]
    }

    /// Look a stage up by its textual name.
    pub fn stage(&mut self, name: &str) -> Result<&mut Stage, PipelineError> {
        Ok(self.get(name.parse()?))
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Fold every step of every stage over `input`, in stage order.
    pub fn into_stream(self, input: PacketStream) -> PacketStream {
        let mut stream = input;

        for stage in self.stages {
            for step in stage.steps {
                tracing::trace!(stage = %stage.name, step = step.name(), "attach");
                stream = step.apply(stream);
            }
        }

        stream
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for stage in &self.stages {
            map.entry(&stage.name.as_str(), &stage.step_names());
        }
        map.finish()
    }
}
