use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher as _};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FeatureError, Result};
use crate::registry::{ActiveWatch, Registry};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Kind of filesystem change carried by an [`FsEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
    Other,
}

impl From<&EventKind> for FsOp {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => FsOp::Create,
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => FsOp::Write,
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => FsOp::Write,
            // a file moved onto a name is new under that name; backends that
            // cannot tell the two ends apart report `Any`
            EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => FsOp::Create,
            EventKind::Modify(ModifyKind::Name(_)) => FsOp::Rename,
            EventKind::Modify(ModifyKind::Metadata(_)) => FsOp::Chmod,
            EventKind::Remove(_) => FsOp::Remove,
            _ => FsOp::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub op: FsOp,
}

/// One [`FsEvent`] per path of `event`. A rename reported with both ends
/// lists the source first; the destination becomes a `Create`.
fn split_event(event: notify::Event) -> Vec<FsEvent> {
    let op = FsOp::from(&event.kind);
    let both_ends = matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both))
    );
    event
        .paths
        .into_iter()
        .enumerate()
        .map(|(idx, path)| FsEvent {
            path,
            op: if both_ends && idx == 1 { FsOp::Create } else { op },
        })
        .collect()
}

/// A stream of events for one directory. Dropping it releases the
/// underlying OS watch.
pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<notify::Result<FsEvent>>,
    _guard: Box<dyn Send>,
}

impl Subscription {
    /// `guard` is kept alive as long as the subscription.
    pub fn new(
        events: mpsc::UnboundedReceiver<notify::Result<FsEvent>>,
        guard: impl Send + 'static,
    ) -> Self {
        Self {
            events,
            _guard: Box::new(guard),
        }
    }
}

/// Source of filesystem events.
pub trait Notifier: Send + Sync {
    /// Subscribes to changes of the entries directly inside `dir`.
    fn subscribe(&self, dir: &Path) -> Result<Subscription>;
}

/// [`Notifier`] backed by the platform's native watcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecommendedNotifier;

impl Notifier for RecommendedNotifier {
    fn subscribe(&self, dir: &Path) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for fs_event in split_event(event) {
                        let _ = tx.send(Ok(fs_event));
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Subscription::new(rx, watcher))
    }
}

/// Keeps a [`Registry`] and its backing JSON file in sync.
///
/// External edits to the file are reloaded into the registry. Mutations made
/// through the registry are written back to the file after `debounce`, with
/// bursts coalesced into one write. A registry carries at most one active
/// watch at a time.
pub struct Watcher {
    registry: Arc<Registry>,
    notifier: Arc<dyn Notifier>,
    debounce: Duration,
}

impl Watcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_notifier(registry, RecommendedNotifier)
    }

    pub fn with_notifier(registry: Arc<Registry>, notifier: impl Notifier + 'static) -> Self {
        Self {
            registry,
            notifier: Arc::new(notifier),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Delay between a mutation and its write-back. Zero writes immediately.
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Starts watching `path` until `cancel` fires or the notifier fails.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`FeatureError::DuplicateWatch`] while another watch is active on the
    /// same registry.
    pub fn watch(&self, path: impl AsRef<Path>, cancel: CancellationToken) -> Result<WatchHandle> {
        let path = std::path::absolute(path.as_ref())?;
        let (dir, file_name) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_os_string()),
            _ => {
                return Err(FeatureError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} does not name a file", path.display()),
                )))
            }
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FeatureError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        let mut slot = self.registry.watch_slot();
        if let Some(active) = slot.as_ref() {
            return Err(FeatureError::DuplicateWatch(active.path.clone()));
        }
        let subscription = self.notifier.subscribe(&dir)?;
        let (tx, rx) = mpsc::channel(1);
        *slot = Some(ActiveWatch {
            path: path.clone(),
            modified: tx.clone(),
        });
        drop(slot);

        info!(path = %path.display(), "watching features file");
        let session = Session {
            registry: Arc::clone(&self.registry),
            path: path.clone(),
            file_name,
            debounce: self.debounce,
            modified: rx,
            last_synced: None,
        };
        let idle = IdleOnExit {
            registry: Arc::clone(&self.registry),
            modified: tx,
        };
        let task = runtime.spawn(session.run(subscription, cancel, idle));
        Ok(WatchHandle { path, task })
    }
}

pub struct WatchHandle {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves once the session has ended and the registry is free to be
    /// watched again.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!(path = %self.path.display(), error = %e, "watch task failed");
        }
    }
}

/// Returns the registry to idle however the session ends.
struct IdleOnExit {
    registry: Arc<Registry>,
    modified: mpsc::Sender<()>,
}

impl Drop for IdleOnExit {
    fn drop(&mut self) {
        self.registry.end_watch(&self.modified);
    }
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

struct Session {
    registry: Arc<Registry>,
    path: PathBuf,
    file_name: OsString,
    debounce: Duration,
    modified: mpsc::Receiver<()>,
    /// Hash of the content last written or loaded by this session.
    last_synced: Option<String>,
}

impl Session {
    async fn run(
        mut self,
        mut subscription: Subscription,
        cancel: CancellationToken,
        idle: IdleOnExit,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    if self.modified.try_recv().is_ok() {
                        self.write_back().await;
                    }
                    debug!(path = %self.path.display(), "watch cancelled");
                    break;
                }
                Some(()) = self.modified.recv() => {
                    if !self.debounce.is_zero() {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                self.write_back().await;
                                break;
                            }
                            _ = tokio::time::sleep(self.debounce) => {}
                        }
                    }
                    while self.modified.try_recv().is_ok() {}
                    self.write_back().await;
                }
                event = subscription.events.recv() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => {
                        error!(path = %self.path.display(), error = %e, "notifier failed");
                        break;
                    }
                    None => {
                        warn!(path = %self.path.display(), "notifier closed");
                        break;
                    }
                },
            }
        }

        drop(subscription);
        drop(idle);
        info!(path = %self.path.display(), "stopped watching features file");
    }

    async fn handle_event(&mut self, event: FsEvent) {
        if event.path.file_name() != Some(self.file_name.as_os_str()) {
            return;
        }
        if !matches!(event.op, FsOp::Create | FsOp::Write) {
            debug!(path = %event.path.display(), op = ?event.op, "ignoring event");
            return;
        }

        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read features file");
                return;
            }
        };
        let hash = digest(&bytes);
        if self.last_synced.as_deref() == Some(hash.as_str()) {
            debug!(path = %self.path.display(), "content unchanged, skipping reload");
            return;
        }

        match self.registry.reload_from_slice(&bytes, &self.path) {
            Ok(()) => {
                self.last_synced = Some(hash);
                info!(
                    path = %self.path.display(),
                    count = self.registry.len(),
                    "features file reloaded"
                );
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "keeping current features");
            }
        }
    }

    async fn write_back(&mut self) {
        let encoded = match self.registry.encode_snapshot() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(error = %e, "failed to encode features");
                return;
            }
        };
        match tokio::fs::write(&self.path, &encoded).await {
            Ok(()) => {
                self.last_synced = Some(digest(&encoded));
                debug!(path = %self.path.display(), bytes = encoded.len(), "features written back");
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to write features file");
            }
        }
    }
}
