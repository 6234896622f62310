//! Watch mode has two halves:
//!
//! 1. **File watcher**: `notify` with debouncing monitors the directories of
//!    every file the bundler read during its last run. Any change to one of
//!    those files triggers a full rebuild of the bundle. Rebuilds never
//!    overlap, events arriving during a rebuild are coalesced into the next
//!    one.
//! 2. **WebSocket server**: two dedicated threads using `tungstenite`
//!    accept connections from open pages and broadcast `"reload"` to them
//!    whenever a dev build finishes.
use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use futures::StreamExt;
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tokio::task::JoinHandle;
use tungstenite::WebSocket;

use crate::bundle::{BuildConfiguration, Bundler, rebuild};
use crate::error::WatchError;

const DEBOUNCE: Duration = Duration::from_millis(250);
const MAX_CLIENTS: usize = 10;

static WATCHERS: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

/// Keep rebuilding the bundle in the background, see [`rebuild_on_change`].
pub fn spawn_watcher(config: BuildConfiguration, bundler: Arc<dyn Bundler>) {
    let handle = tokio::spawn(async move {
        if let Err(err) = rebuild_on_change(&config, bundler).await {
            tracing::error!("Stopped watching '{}': {err}", config.label());
        }
    });

    WATCHERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(handle);
}

/// Wait until every spawned watcher has stopped.
pub async fn wait_for_watchers() {
    loop {
        let handles = std::mem::take(&mut *WATCHERS.lock().unwrap_or_else(PoisonError::into_inner));
        if handles.is_empty() {
            break;
        }
        futures::future::join_all(handles).await;
    }
}

/// Rebuild the bundle every time one of its files changes. Only returns when
/// the file watcher shuts down.
pub async fn rebuild_on_change(
    config: &BuildConfiguration,
    bundler: Arc<dyn Bundler>,
) -> Result<(), WatchError> {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
        tx.unbounded_send(result).ok();
    })?;

    let mut files = HashSet::new();
    let mut roots = Vec::new();
    refresh_watched(bundler.as_ref(), &mut files, &mut roots, |root| {
        debouncer.watch(root, RecursiveMode::Recursive)
    })?;

    tracing::info!("Watching '{}' for changes...", config.label());

    let mut batches = rx.ready_chunks(64);
    while let Some(batch) = batches.next().await {
        let mut changed = Vec::new();

        for result in batch {
            match result {
                Ok(events) => changed.extend(
                    events
                        .into_iter()
                        .filter(|de| {
                            matches!(
                                de.event.kind,
                                EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
                            )
                        })
                        .flat_map(|de| de.event.paths)
                        .filter(|path| files.contains(path)),
                ),
                Err(errors) => {
                    for err in errors {
                        tracing::warn!("Watch error: {err}");
                    }
                }
            }
        }

        if changed.is_empty() {
            continue;
        }

        tracing::info!("Change detected in {}, rebuilding...", changed[0].display());

        if rebuild(config, bundler.as_ref()).await {
            tracing::info!("Rebuild of '{}' complete", config.label());
        }

        refresh_watched(bundler.as_ref(), &mut files, &mut roots, |root| {
            debouncer.watch(root, RecursiveMode::Recursive)
        })?;
    }

    Ok(())
}

/// Pick up files the bundler started reading since the last run, and watch
/// any directory not covered yet.
fn refresh_watched<F>(
    bundler: &dyn Bundler,
    files: &mut HashSet<PathBuf>,
    roots: &mut Vec<Utf8PathBuf>,
    mut watch: F,
) -> Result<(), WatchError>
where
    F: FnMut(&Utf8Path) -> notify::Result<()>,
{
    let mut dirs = HashSet::new();

    for file in bundler.watched() {
        let Some(file) = canonical_watch_path(&file) else {
            tracing::warn!("Couldn't resolve watched file '{file}'");
            continue;
        };
        if let Some(parent) = file.parent() {
            dirs.insert(parent.to_path_buf());
        }
        files.insert(file.into_std_path_buf());
    }

    for dir in collapse_watch_paths(dirs) {
        if roots.iter().any(|root| dir.starts_with(root)) {
            continue;
        }
        tracing::debug!("Watching {dir}");
        watch(&dir)?;
        roots.push(dir);
    }

    Ok(())
}

/// Files which don't exist yet are watched through their directory, so
/// creating them triggers a rebuild too.
fn canonical_watch_path(file: &Utf8Path) -> Option<Utf8PathBuf> {
    if let Ok(file) = file.canonicalize_utf8() {
        return Some(file);
    }

    let dir = file.parent()?.canonicalize_utf8().ok()?;
    Some(dir.join(file.file_name()?))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// Watchers are recursive, so `/a` already covers `/a/b`.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Handle to the live reload broadcaster. Cloning shares the server.
#[derive(Clone)]
pub struct LiveReload {
    port: u16,
    clients: Clients,
    tx: Sender<()>,
}

impl LiveReload {
    /// Listen on `127.0.0.1:port`, or on any free port if that one is taken.
    pub fn start(port: u16) -> Result<Self, WatchError> {
        let listener = match TcpListener::bind(("127.0.0.1", port)) {
            Ok(sock) => sock,
            Err(_) => TcpListener::bind("127.0.0.1:0")?,
        };
        let port = listener.local_addr()?.port();

        let clients = Clients::default();
        new_thread_ws_incoming(listener, clients.clone());
        let tx = new_thread_ws_reload(clients.clone());

        tracing::info!("Live reload listening on ws://127.0.0.1:{port}");

        Ok(Self { port, clients, tx })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connections(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Ask every connected page to reload.
    pub fn notify(&self) {
        if self.tx.send(()).is_err() {
            tracing::warn!("Live reload thread is gone");
        }
    }
}

impl std::fmt::Debug for LiveReload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveReload")
            .field("port", &self.port)
            .field("connections", &self.connections())
            .finish()
    }
}

fn new_thread_ws_incoming(server: TcpListener, clients: Clients) {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("Live reload connection failed: {e}");
                    continue;
                }
            };

            match tungstenite::accept(stream) {
                Ok(socket) => clients
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(socket),
                Err(e) => tracing::debug!("Rejected live reload client: {e}"),
            }
        }
    });
}

fn new_thread_ws_reload(clients: Clients) -> Sender<()> {
    let (tx, rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        while rx.recv().is_ok() {
            let mut clients = clients.lock().unwrap_or_else(PoisonError::into_inner);
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send("reload".into()) {
                    Ok(_) => {}
                    Err(tungstenite::Error::Io(e)) => {
                        tracing::debug!("Dropping live reload client: {e}");
                        broken.push(i);
                    }
                    Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                        broken.push(i);
                    }
                    Err(e) => {
                        tracing::error!("Live reload error: {e:?}");
                    }
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            // Close all but the last few connections
            let len = clients.len();
            if len > MAX_CLIENTS {
                for mut socket in clients.drain(0..len - MAX_CLIENTS) {
                    socket.close(None).ok();
                }
            }
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::FsBundler;
    use crate::pipeline::PacketStream;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_collapse_watch_paths() {
        let paths = HashSet::from([
            Utf8PathBuf::from("/app"),
            Utf8PathBuf::from("/app/scripts"),
            Utf8PathBuf::from("/app/scripts/lib"),
            Utf8PathBuf::from("/shared"),
            Utf8PathBuf::from("/node_modules/foo"),
        ]);

        assert_eq!(
            collapse_watch_paths(paths),
            vec![
                Utf8PathBuf::from("/app"),
                Utf8PathBuf::from("/node_modules/foo"),
                Utf8PathBuf::from("/shared"),
            ]
        );
    }

    #[test]
    fn test_collapse_watch_paths_similar_names() {
        let paths = HashSet::from([Utf8PathBuf::from("/ui"), Utf8PathBuf::from("/ui-old")]);

        assert_eq!(
            collapse_watch_paths(paths),
            vec![Utf8PathBuf::from("/ui"), Utf8PathBuf::from("/ui-old")]
        );
    }

    struct Files(Vec<Utf8PathBuf>);

    impl Bundler for Files {
        fn bundle(&self, _: &crate::bundle::BundlerOptions) -> PacketStream {
            stream::empty().boxed()
        }

        fn watched(&self) -> Vec<Utf8PathBuf> {
            self.0.clone()
        }
    }

    #[test]
    fn test_refresh_watched_adds_only_new_roots() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        std::fs::create_dir_all(root.join("app/lib")).unwrap();
        std::fs::create_dir_all(root.join("shared")).unwrap();
        for file in ["app/ui.js", "app/lib/a.js", "shared/b.js"] {
            std::fs::write(root.join(file), "").unwrap();
        }

        let mut files = HashSet::new();
        let mut roots = Vec::new();
        let mut calls = Vec::new();

        let first = Files(vec![root.join("app/ui.js"), root.join("app/lib/a.js")]);
        refresh_watched(&first, &mut files, &mut roots, |dir| {
            calls.push(dir.to_path_buf());
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, vec![root.join("app")]);

        let second = Files(vec![
            root.join("app/lib/a.js"),
            root.join("shared/b.js"),
            root.join("gone/c.js"),
        ]);
        refresh_watched(&second, &mut files, &mut roots, |dir| {
            calls.push(dir.to_path_buf());
            Ok(())
        })
        .unwrap();

        assert_eq!(calls, vec![root.join("app"), root.join("shared")]);
        assert!(files.contains(root.join("shared/b.js").as_std_path()));
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn test_missing_file_is_watched_through_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();

        assert_eq!(canonical_watch_path(&root.join("new.js")), Some(root.join("new.js")));
        assert_eq!(canonical_watch_path(&root.join("nowhere/new.js")), None);
    }

    /// Rewrite `file` until the number of finished builds reaches `target`.
    async fn edit_until(file: &Utf8Path, contents: &str, builds: &AtomicUsize, target: usize) {
        for attempt in 0..40 {
            if attempt % 5 == 0 {
                std::fs::write(file, format!("{contents}\n// {attempt}\n")).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            if builds.load(Ordering::SeqCst) >= target {
                return;
            }
        }
        panic!("no rebuild after editing {file}");
    }

    #[tokio::test]
    async fn test_watcher_recovers_from_failed_build() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        let entry = root.join("ui.js");
        std::fs::write(&entry, "require('./gone');\n").unwrap();

        let builds = Arc::new(AtomicUsize::new(0));
        let mut config = BuildConfiguration::new("ui");
        config.options.entries = vec!["ui.js".into()];
        config.options.extensions = vec![".js".into()];
        let counter = builds.clone();
        config.on_bundle_done(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(()) }
        });

        let bundler: Arc<dyn Bundler> = Arc::new(FsBundler::new(root.clone()));
        assert!(!rebuild(&config, bundler.as_ref()).await);

        let config = Arc::new(config);
        let watcher = {
            let config = config.clone();
            let bundler = bundler.clone();
            tokio::spawn(async move { rebuild_on_change(&config, bundler).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        edit_until(&entry, "module.exports = 1;", &builds, 1).await;

        // Breaking the build again only produces a warning.
        std::fs::write(&entry, "require('./gone');\n").unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        let before = builds.load(Ordering::SeqCst);

        edit_until(&entry, "module.exports = 2;", &builds, before + 1).await;
        assert!(!watcher.is_finished());

        watcher.abort();
    }

    #[test]
    fn test_live_reload_broadcast() {
        let reload = LiveReload::start(0).unwrap();
        let url = format!("ws://127.0.0.1:{}", reload.port());
        let (mut client, _) = tungstenite::connect(url).unwrap();

        while reload.connections() == 0 {
            std::thread::sleep(Duration::from_millis(10));
        }

        reload.notify();
        let message = client.read().unwrap();
        assert_eq!(message.to_text().unwrap(), "reload");
    }
}
