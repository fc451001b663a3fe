//! Watch/Debounce Loop.
//!
//! One `IndexWorker` thread owns all index maintenance driven from outside
//! the request path. File system events and index requests reach it through
//! a bounded queue of `IndexCommand`s. Watch events go through a `Debouncer`;
//! when a path's quiet period expires the worker indexes whatever is on disk
//! at that moment, so a burst of writes costs one re-index of the final
//! content.
//!
//! Startup reconciliation runs on its own thread with a deadline and never
//! holds up readiness.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;

use crate::semantic::{IndexOutcome, IndexStore};
use crate::vault::Vault;

/// How often the worker saves a dirty index
const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
    pub observed_at: Instant,
}

pub enum IndexCommand {
    /// Raw file system observation, debounced
    Watch(WatchEvent),
    /// Index a path now (write-path tools)
    Index(String),
    Shutdown,
}

struct Pending {
    deadline: Instant,
    kind: WatchKind,
}

/// Per-path quiet-period timers. Pure state, no I/O.
pub struct Debouncer {
    quiet: Duration,
    pending: HashMap<String, Pending>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    /// Record an event, restarting the path's timer.
    pub fn observe(&mut self, path: &str, kind: WatchKind, now: Instant) {
        self.pending.insert(
            path.to_string(),
            Pending {
                deadline: now + self.quiet,
                kind,
            },
        );
    }

    /// Paths whose quiet period has elapsed, with the last kind observed.
    /// They leave the pending set.
    pub fn due(&mut self, now: Instant) -> Vec<(String, WatchKind)> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut fired: Vec<(String, WatchKind)> = ready
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|p| (path, p.kind)))
            .collect();
        fired.sort_by(|a, b| a.0.cmp(&b.0));
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Cloneable handle for feeding the worker.
#[derive(Clone)]
pub struct IndexSender {
    tx: SyncSender<IndexCommand>,
}

impl IndexSender {
    /// Queue a command without blocking. Returns false when the queue is
    /// full or the worker is gone; the caller decides what to do instead.
    pub fn send(&self, command: IndexCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("index queue full, dropping command");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub struct IndexWorker {
    sender: IndexSender,
    handle: Option<JoinHandle<()>>,
}

impl IndexWorker {
    pub fn spawn(
        vault: Arc<Vault>,
        index: Arc<IndexStore>,
        quiet: Duration,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));

        let handle = thread::Builder::new()
            .name("index-worker".to_string())
            .spawn(move || run_worker(&vault, &index, rx, quiet))?;

        Ok(Self {
            sender: IndexSender { tx },
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> IndexSender {
        self.sender.clone()
    }

    /// Stop the worker after it drains what is already queued. Pending
    /// debounce timers are flushed first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // a full queue still gets the message through eventually
        let _ = self.sender.tx.send(IndexCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("index worker panicked");
            }
        }
    }
}

impl Drop for IndexWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run_worker(vault: &Vault, index: &IndexStore, rx: Receiver<IndexCommand>, quiet: Duration) {
    let mut debouncer = Debouncer::new(quiet);
    let mut last_persist = Instant::now();

    log::debug!("index worker started");

    loop {
        let wait = match debouncer.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => PERSIST_INTERVAL,
        };

        match rx.recv_timeout(wait) {
            Ok(IndexCommand::Watch(event)) => {
                debouncer.observe(&event.path, event.kind, event.observed_at);
            }
            Ok(IndexCommand::Index(path)) => {
                index.sync_path(vault, &path);
            }
            Ok(IndexCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                log::debug!("flushing {} pending changes", debouncer.pending_count());
                // no point waiting out timers on the way down
                for (path, kind) in debouncer.due(Instant::now() + quiet) {
                    fire(vault, index, &path, kind);
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        for (path, kind) in debouncer.due(Instant::now()) {
            fire(vault, index, &path, kind);
        }

        if last_persist.elapsed() >= PERSIST_INTERVAL {
            persist(index);
            last_persist = Instant::now();
        }
    }

    persist(index);
    log::debug!("index worker stopped");
}

/// The effective action for a path whose quiet period ended: whatever the
/// file looks like now decides between upsert and delete.
fn fire(vault: &Vault, index: &IndexStore, path: &str, kind: WatchKind) {
    match index.index_file(vault, path) {
        Ok(IndexOutcome::Indexed { chunks }) => {
            log::info!("re-indexed {path} after external change ({chunks} chunks)")
        }
        Ok(IndexOutcome::Removed) => log::info!("dropped {path} from index"),
        Ok(outcome) => log::debug!("{path} ({kind:?}): {outcome:?}"),
        Err(e) => log::debug!("watch update for {path} not applied: {e}"),
    }
}

fn persist(index: &IndexStore) {
    if let Err(e) = index.persist_if_dirty() {
        log::warn!("failed to save index: {e}");
    }
}

/// Start the OS watcher for the vault, feeding the worker. Dropping the
/// returned watcher stops it.
pub fn watch_vault(vault: Arc<Vault>, sender: IndexSender) -> notify::Result<RecommendedWatcher> {
    let root = vault.root().to_path_buf();
    let handler_vault = vault.clone();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for watch_event in translate(&handler_vault, &event) {
                let path = watch_event.path.clone();
                if !sender.send(IndexCommand::Watch(watch_event)) {
                    log::warn!(
                        "dropped change for {path}; run reconciliation or a rebuild to catch up"
                    );
                }
            }
        }
        Err(e) => log::warn!("File watcher error: {e}"),
    })?;

    watcher.watch(&root, RecursiveMode::Recursive)?;
    log::info!("Watching {}", root.display());
    Ok(watcher)
}

/// Vault-relative watch events for the note paths of a notify event.
fn translate(vault: &Vault, event: &Event) -> Vec<WatchEvent> {
    let observed_at = Instant::now();

    event
        .paths
        .iter()
        .filter_map(|abs| {
            let kind = classify(&event.kind, abs)?;
            let rel = vault.relative(abs)?;

            if vault.is_ingest(&rel) {
                if kind == WatchKind::Created {
                    log::info!("{rel} dropped for ingestion, left to the ingest pipeline");
                }
                return None;
            }
            if !vault.is_indexable(&rel) {
                return None;
            }

            Some(WatchEvent {
                path: rel,
                kind,
                observed_at,
            })
        })
        .collect()
}

fn classify(kind: &EventKind, abs: &Path) -> Option<WatchKind> {
    match kind {
        EventKind::Create(_) => Some(WatchKind::Created),
        EventKind::Remove(_) => Some(WatchKind::Deleted),
        // either side of a rename; the file tells which one it is
        EventKind::Modify(ModifyKind::Name(_)) => Some(if abs.exists() {
            WatchKind::Created
        } else {
            WatchKind::Deleted
        }),
        EventKind::Modify(_) => Some(WatchKind::Modified),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub reindexed: usize,
    pub removed: usize,
    pub failed: Vec<String>,
    /// False when the deadline cut the pass short or the index is unavailable
    pub completed: bool,
    pub elapsed_ms: u64,
}

/// Bring the index in line with files changed while the server was down.
/// Stops at `deadline`, leaving the rest to a manual rebuild.
pub fn reconcile(vault: &Vault, index: &IndexStore, deadline: Instant) -> ReconcileReport {
    let started = Instant::now();
    let mut report = ReconcileReport::default();

    if !index.is_available() {
        log::warn!("Index unavailable, skipping reconciliation; run `vaultd reindex` to build it");
        return report;
    }

    let files: Vec<_> = vault
        .notes()
        .into_iter()
        .filter(|f| vault.is_indexable(&f.rel_path))
        .collect();
    let on_disk: HashSet<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();

    let mut timed_out = false;

    for file in &files {
        if Instant::now() >= deadline {
            timed_out = true;
            break;
        }

        let stale = match index.recorded_modified_at(&file.rel_path) {
            Some(recorded) => file.modified_at > recorded,
            None => true,
        };
        if !stale {
            continue;
        }

        match index.index_file(vault, &file.rel_path) {
            Ok(IndexOutcome::Indexed { .. }) => report.reindexed += 1,
            Ok(_) => {}
            Err(e) => {
                log::debug!("reconcile {}: {e}", file.rel_path);
                report.failed.push(file.rel_path.clone());
            }
        }
    }

    if !timed_out {
        for path in index.recorded_paths() {
            if on_disk.contains(path.as_str()) {
                continue;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            match index.remove_file(&path) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    log::debug!("reconcile remove {path}: {e}");
                    report.failed.push(path);
                }
            }
        }
    }

    report.completed = !timed_out;
    report.elapsed_ms = started.elapsed().as_millis() as u64;

    if timed_out {
        log::warn!(
            "Reconciliation stopped after {}ms with work left; index freshness is degraded until `vaultd reindex` runs",
            report.elapsed_ms
        );
    } else {
        log::info!(
            "Reconciliation done: {} re-indexed, {} removed, {} failed in {}ms",
            report.reindexed,
            report.removed,
            report.failed.len(),
            report.elapsed_ms
        );
    }

    if let Err(e) = index.persist_if_dirty() {
        log::warn!("failed to save index after reconciliation: {e}");
    }

    report
}

/// Run `reconcile` on its own thread.
pub fn spawn_reconciliation(
    vault: Arc<Vault>,
    index: Arc<IndexStore>,
    timeout: Duration,
) -> std::io::Result<JoinHandle<ReconcileReport>> {
    thread::Builder::new()
        .name("reconcile".to_string())
        .spawn(move || reconcile(&vault, &index, Instant::now() + timeout))
}
