//! Task registry and compositor.
//!
//! Tasks are named asynchronous units of work. They are registered once in a
//! [`Registry`] and later combined with [`Registry::series`] and
//! [`Registry::parallel`]. Combinators resolve their members lazily, when the
//! combined task is invoked, so a composition may refer to tasks which are
//! registered after it.
mod timeline;

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use console::style;
use futures::future::{BoxFuture, FutureExt, join_all};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::Instrument;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{ParallelError, TaskError, TsumugiError};
use crate::events::Events;

pub use timeline::Timeline;

/// Result from a single executed task.
pub type TaskResult = anyhow::Result<()>;

pub type TaskFuture = BoxFuture<'static, TaskResult>;

/// A callable task body. Each call starts a fresh run of the task.
#[derive(Clone)]
pub struct TaskBody(Arc<dyn Fn() -> TaskFuture + Send + Sync>);

impl TaskBody {
    /// Task body returning a future.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self(Arc::new(move || func().boxed()))
    }

    /// Task body returning a stream; the run is complete once the stream has
    /// been drained, and fails on the first error item.
    pub fn stream<F, S, T, E>(func: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        Self::new(move || {
            let stream = func();
            async move {
                end_of_stream(stream).await.map_err(Into::into)?;
                Ok(())
            }
        })
    }

    pub fn call(&self) -> TaskFuture {
        (self.0)()
    }
}

impl std::fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskBody(*)")
    }
}

/// Wait until a stream is exhausted, returning how many items went through.
pub async fn end_of_stream<S, T, E>(stream: S) -> Result<usize, E>
where
    S: Stream<Item = Result<T, E>>,
{
    let mut stream = pin!(stream);
    let mut count = 0;

    while let Some(item) = stream.next().await {
        item?;
        count += 1;
    }

    Ok(count)
}

/// Anything a combinator accepts as a member.
#[derive(Debug, Clone)]
pub enum TaskItem {
    /// Reference to a registered task.
    Name(Cow<'static, str>),
    /// Anonymous task body, used as-is.
    Body(TaskBody),
    /// Task description coming from configuration. A string is a name, an
    /// object `{"series": [...]}` or `{"parallel": [...]}` is a composition.
    Value(Value),
}

impl From<&'static str> for TaskItem {
    fn from(value: &'static str) -> Self {
        TaskItem::Name(Cow::Borrowed(value))
    }
}

impl From<String> for TaskItem {
    fn from(value: String) -> Self {
        TaskItem::Name(Cow::Owned(value))
    }
}

impl From<TaskBody> for TaskItem {
    fn from(value: TaskBody) -> Self {
        TaskItem::Body(value)
    }
}

impl From<Value> for TaskItem {
    fn from(value: Value) -> Self {
        TaskItem::Value(value)
    }
}

/// Lifecycle events emitted by registered tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Start {
        name: String,
        timestamp: Instant,
    },
    End {
        name: String,
        start: Instant,
        end: Instant,
    },
    /// A top-level run finished successfully.
    Complete,
}

/// The named-task table. Construct one at program start and clone it wherever
/// tasks need to be registered, composed or run; clones share the table.
#[derive(Clone, Default)]
pub struct Registry {
    tasks: Arc<RwLock<HashMap<String, TaskBody>>>,
    events: Events<TaskEvent>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub on which every registered task reports its lifecycle.
    pub fn events(&self) -> &Events<TaskEvent> {
        &self.events
    }

    /// Register a task under a unique name. The stored task reports `Start`
    /// before the body runs and `End` after it succeeds.
    pub fn register(&self, name: impl Into<String>, body: TaskBody) -> Result<(), TaskError> {
        let name = name.into();
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);

        if tasks.contains_key(&name) {
            return Err(TaskError::DuplicateTask(name));
        }

        let body = instrument(name.clone(), body, self.events.clone());
        tasks.insert(name, body);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TaskBody> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Sorted names of every registered task.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Turn a task item into something callable.
    pub fn resolve(&self, item: &TaskItem) -> Result<TaskBody, TaskError> {
        match item {
            TaskItem::Name(name) => self.lookup(name),
            TaskItem::Body(body) => Ok(body.clone()),
            TaskItem::Value(value) => self.resolve_value(value),
        }
    }

    fn lookup(&self, name: &str) -> Result<TaskBody, TaskError> {
        self.get(name)
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))
    }

    fn resolve_value(&self, value: &Value) -> Result<TaskBody, TaskError> {
        match value {
            Value::String(name) => self.lookup(name),
            Value::Object(map) if map.len() == 1 => {
                let Some((kind, Value::Array(members))) = map.iter().next() else {
                    return Err(TaskError::InvalidTaskValue(value.to_string()));
                };

                let items = members.iter().cloned().map(TaskItem::Value);

                match kind.as_str() {
                    "series" => Ok(self.series(items)),
                    "parallel" => Ok(self.parallel(items)),
                    _ => Err(TaskError::InvalidTaskValue(value.to_string())),
                }
            }
            _ => Err(TaskError::InvalidTaskValue(value.to_string())),
        }
    }

    /// Build a task body from a JSON description. The shape is checked
    /// immediately, names are looked up when the body runs.
    pub fn compose(&self, value: &Value) -> Result<TaskBody, TaskError> {
        check_shape(value)?;
        self.resolve_value(value)
    }

    /// Run every item strictly in order, stopping at the first failure.
    pub fn series<I>(&self, items: I) -> TaskBody
    where
        I: IntoIterator,
        I::Item: Into<TaskItem>,
    {
        let registry = self.clone();
        let items: Arc<[TaskItem]> = items.into_iter().map(Into::into).collect();

        TaskBody::new(move || {
            let registry = registry.clone();
            let items = items.clone();

            async move {
                let bodies = items
                    .iter()
                    .map(|item| registry.resolve(item))
                    .collect::<Result<Vec<_>, _>>()?;

                for body in bodies {
                    body.call().await?;
                }

                Ok(())
            }
        })
    }

    /// Run every item concurrently. The aggregate settles only after all
    /// members settled, and fails if any of them failed.
    pub fn parallel<I>(&self, items: I) -> TaskBody
    where
        I: IntoIterator,
        I::Item: Into<TaskItem>,
    {
        let registry = self.clone();
        let items: Arc<[TaskItem]> = items.into_iter().map(Into::into).collect();

        TaskBody::new(move || {
            let registry = registry.clone();
            let items = items.clone();

            async move {
                let bodies = items
                    .iter()
                    .map(|item| registry.resolve(item))
                    .collect::<Result<Vec<_>, _>>()?;

                let total = bodies.len();
                let results = join_all(bodies.iter().map(TaskBody::call)).await;
                let failures: Vec<_> = results.into_iter().filter_map(Result::err).collect();

                if failures.is_empty() {
                    Ok(())
                } else {
                    for failure in &failures {
                        tracing::error!("{failure:#}");
                    }
                    Err(ParallelError { total, failures }.into())
                }
            }
        })
    }

    /// Look up and run a top-level task. Emits `Complete` on success.
    pub async fn run(&self, name: &str) -> Result<(), TsumugiError> {
        let body = self.lookup(name)?;

        body.call()
            .await
            .map_err(|err| TsumugiError::Run(name.to_string(), err))?;

        self.events.emit(&TaskEvent::Complete);
        Ok(())
    }

    /// Like [`Registry::run`], but terminates the process with a non-zero
    /// status on failure.
    pub async fn run_or_exit(&self, name: &str) {
        if let Err(err) = self.run(name).await {
            eprintln!("{} {err}", style("error:").red().bold());
            std::process::exit(1);
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.names())
            .field("events", &self.events)
            .finish()
    }
}

fn check_shape(value: &Value) -> Result<(), TaskError> {
    match value {
        Value::String(_) => Ok(()),
        Value::Object(map) if map.len() == 1 => match map.iter().next() {
            Some((kind, Value::Array(members))) if kind == "series" || kind == "parallel" => {
                members.iter().try_for_each(check_shape)
            }
            _ => Err(TaskError::InvalidTaskValue(value.to_string())),
        },
        _ => Err(TaskError::InvalidTaskValue(value.to_string())),
    }
}

fn instrument(name: String, body: TaskBody, events: Events<TaskEvent>) -> TaskBody {
    TaskBody::new(move || {
        let name = name.clone();
        let body = body.clone();
        let events = events.clone();

        let span = tracing::info_span!("task", name = %name);
        span.pb_set_style(&crate::utils::get_style_task());
        span.pb_set_message(&format!("Running {name}"));

        async move {
            let start = Instant::now();
            events.emit(&TaskEvent::Start {
                name: name.clone(),
                timestamp: start,
            });

            body.call().await?;

            let end = Instant::now();
            tracing::info!("Finished '{name}' {}", crate::utils::as_overhead(start));
            events.emit(&TaskEvent::End { name, start, end });

            Ok(())
        }
        .instrument(span)
    })
}
