use std::fmt::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use super::TaskEvent;
use crate::events::Events;

/// One finished task as observed on the event hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpan {
    pub name: String,
    pub start: Instant,
    pub duration: Duration,
}

/// Records the lifecycle of every task and, once the top-level run completes,
/// writes a waterfall chart and logs a summary.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    spans: Arc<Mutex<Vec<TaskSpan>>>,
}

impl Timeline {
    /// Subscribe a new timeline to the hub. When `output` is set the SVG
    /// waterfall is written there on `Complete`.
    pub fn attach(events: &Events<TaskEvent>, output: Option<Utf8PathBuf>) -> Self {
        let timeline = Self::default();

        let this = timeline.clone();
        events.subscribe(move |event| match event {
            TaskEvent::Start { .. } => {}
            TaskEvent::End { name, start, end } => {
                this.spans
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(TaskSpan {
                        name: name.clone(),
                        start: *start,
                        duration: end.saturating_duration_since(*start),
                    });
            }
            TaskEvent::Complete => {
                for line in this.summary().lines() {
                    tracing::info!("{line}");
                }
                if let Some(path) = &output {
                    let written = this
                        .render_waterfall()
                        .map_err(anyhow::Error::from)
                        .and_then(|svg| Ok(std::fs::write(path, svg)?));
                    if let Err(err) = written {
                        tracing::warn!("Couldn't write timeline to '{path}': {err:#}");
                    }
                }
            }
        });

        timeline
    }

    /// Recorded spans ordered by start time.
    pub fn spans(&self) -> Vec<TaskSpan> {
        let mut spans = self
            .spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        spans.sort_by_key(|span| span.start);
        spans
    }

    /// One line per task, slowest first.
    pub fn summary(&self) -> String {
        let mut spans = self.spans();
        spans.sort_by(|a, b| b.duration.cmp(&a.duration).then(a.name.cmp(&b.name)));

        let width = spans.iter().map(|s| s.name.len()).max().unwrap_or(0);
        let mut buf = String::new();
        for span in spans {
            let _ = writeln!(buf, "{:<width$}  {:.2?}", span.name, span.duration);
        }
        buf
    }

    /// Renders a waterfall chart of task execution as an SVG string.
    pub fn render_waterfall(&self) -> Result<String, minijinja::Error> {
        let spans = self.spans();

        let origin = spans.iter().map(|s| s.start).min();
        let end = spans.iter().map(|s| s.start + s.duration).max();
        let total = match (origin, end) {
            (Some(origin), Some(end)) => end.duration_since(origin).as_micros().max(1) as f64,
            _ => 1.0,
        };

        let scale = |micros: f64| (micros / total * CHART_WIDTH * 10.0).round() / 10.0;
        let rows: Vec<Row> = spans
            .iter()
            .enumerate()
            .map(|(i, span)| {
                let offset = origin.map_or(0, |o| span.start.duration_since(o).as_micros());
                let x = LABEL_WIDTH + scale(offset as f64);
                let width = scale(span.duration.as_micros() as f64).max(1.0);
                Row {
                    name: &span.name,
                    y: HEADER + i as u32 * ROW_HEIGHT,
                    x,
                    width,
                    time_x: x + width + 4.0,
                    time: format!("{:.2?}", span.duration),
                }
            })
            .collect();

        let mut env = minijinja::Environment::new();
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::Html);
        env.render_str(
            WATERFALL,
            minijinja::context! {
                width => LABEL_WIDTH + CHART_WIDTH + 100.0,
                height => HEADER + rows.len().max(1) as u32 * ROW_HEIGHT,
                rows,
            },
        )
    }
}

const LABEL_WIDTH: f64 = 360.0;
const CHART_WIDTH: f64 = 800.0;
const ROW_HEIGHT: u32 = 24;
const HEADER: u32 = 10;

const WATERFALL: &str = r##"<svg width="{{ width }}" height="{{ height }}" xmlns="http://www.w3.org/2000/svg"><style>text { font: 12px sans-serif; } .bar { fill: #10b981; } .time { fill: #666; font-size: 11px; }</style>
{%- for row in rows %}
<text x="8" y="{{ row.y + 16 }}">{{ row.name }}</text><rect class="bar" x="{{ row.x }}" y="{{ row.y + 3 }}" width="{{ row.width }}" height="18"><title>{{ row.name }}: {{ row.time }}</title></rect><text class="time" x="{{ row.time_x }}" y="{{ row.y + 16 }}">{{ row.time }}</text>
{%- else %}
<text x="8" y="26">No tasks ran</text>
{%- endfor %}
</svg>"##;

#[derive(Serialize)]
struct Row<'a> {
    name: &'a str,
    y: u32,
    x: f64,
    width: f64,
    time_x: f64,
    time: String,
}
