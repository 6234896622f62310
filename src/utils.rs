use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

static STYLE_TASK: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// Spinner style for a running task, no progress bar.
pub(crate) fn get_style_task() -> ProgressStyle {
    STYLE_TASK.clone()
}

/// Time elapsed since `s`, formatted as a dimmed suffix for log lines.
pub fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Ring the terminal bell.
pub(crate) fn bell() {
    eprint!("\x07");
}

/// Lexically resolve `.` and `..` components without touching the disk.
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut ret = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::Prefix(prefix) => {
                ret.push(prefix.as_str());
            }
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Install the global subscriber: formatted output through the indicatif
/// writer, so log lines and task spinners don't tear each other. Filtering is
/// controlled by `RUST_LOG` and defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}
