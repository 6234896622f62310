use camino::Utf8PathBuf;
use clap::Parser;
use tsumugi::{ProjectConfig, Registry, Scripts, Timeline, TsumugiError};

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
struct Args {
    /// Task to run, e.g. `scripts:core:prod`.
    #[clap(index = 1, default_value = "scripts:core:dev")]
    task: String,

    /// Project configuration file.
    #[clap(long, default_value = "build.json")]
    config: Utf8PathBuf,

    /// Write an SVG waterfall of the task timings here.
    #[clap(long)]
    timeline: Option<Utf8PathBuf>,

    /// Print the registered tasks and exit.
    #[clap(long)]
    list: bool,
}

fn main() -> Result<(), TsumugiError> {
    let args = Args::parse();

    #[cfg(feature = "logging")]
    if let Err(err) = tsumugi::init_logging() {
        eprintln!("Couldn't set up logging: {err}");
    }

    let project = ProjectConfig::load(&args.config)?;

    let registry = Registry::new();
    Scripts::new(project).register(&registry)?;

    if args.list {
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    }

    let _timeline = Timeline::attach(registry.events(), args.timeline);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        registry.run_or_exit(&args.task).await;

        #[cfg(feature = "live")]
        tsumugi::watch::wait_for_watchers().await;
    });

    Ok(())
}
