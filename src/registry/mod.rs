//! Run Registry: the single keyed store of Runs.
//!
//! Every change goes through [`RunRegistry::mutate`], which applies the edit,
//! broadcasts the updated Run and schedules a debounced write of the whole
//! registry file. Components receive the registry as an `Arc` and never keep
//! their own copies of Run state.

pub mod persist;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::RegistryError;
use crate::run::{LogEntry, Run};
use persist::PersistScheduler;

const EVENT_CAPACITY: usize = 1024;

/// What subscribers see.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Created(Box<Run>),
    Updated(Box<Run>),
    Log { run_id: String, entry: LogEntry },
}

pub struct RunRegistry {
    runs: Arc<DashMap<String, Run>>,
    events: broadcast::Sender<RunEvent>,
    persist: PersistScheduler,
    path: PathBuf,
    _lock: File,
}

impl RunRegistry {
    /// Take the registry lock, load `path` and start the writer task. Must be
    /// called inside a tokio runtime.
    pub fn open(path: &Path, debounce: Duration) -> Result<Arc<Self>, RegistryError> {
        let lock = persist::acquire_lock(path)?;
        let loaded = persist::load_runs(path)?;
        info!(path = %path.display(), runs = loaded.len(), "registry loaded");

        let runs = Arc::new(DashMap::new());
        for run in loaded {
            runs.insert(run.id.clone(), run);
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let persist = PersistScheduler::spawn(path.to_path_buf(), runs.clone(), debounce);
        Ok(Arc::new(Self {
            runs,
            events,
            persist,
            path: path.to_path_buf(),
            _lock: lock,
        }))
    }

    /// Read the registry file without locking it, for read-only views while
    /// another process owns the registry.
    pub fn read_snapshot(path: &Path) -> Result<Vec<Run>, RegistryError> {
        let mut runs = persist::load_runs(path)?;
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&self, run: Run) -> Run {
        debug!(run_id = %run.id, "run registered");
        self.runs.insert(run.id.clone(), run.clone());
        let _ = self.events.send(RunEvent::Created(Box::new(run.clone())));
        self.persist.schedule();
        run
    }

    pub fn get(&self, id: &str) -> Option<Run> {
        self.runs.get(id).map(|r| r.value().clone())
    }

    /// Exact id, or a unique id prefix.
    pub fn find(&self, id_or_prefix: &str) -> Option<Run> {
        if let Some(run) = self.get(id_or_prefix) {
            return Some(run);
        }
        find_by_prefix(self.list(), id_or_prefix)
    }

    /// All runs, oldest first.
    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Apply `f` to the Run, then broadcast and schedule persistence.
    /// Returns the updated Run and `f`'s result, or `None` if the id is unknown.
    pub fn mutate<R>(&self, id: &str, f: impl FnOnce(&mut Run) -> R) -> Option<(Run, R)> {
        let (snapshot, result) = {
            let mut entry = self.runs.get_mut(id)?;
            let result = f(entry.value_mut());
            entry.updated_at = Utc::now();
            (entry.value().clone(), result)
        };
        let _ = self.events.send(RunEvent::Updated(Box::new(snapshot.clone())));
        self.persist.schedule();
        Some((snapshot, result))
    }

    /// Broadcast log entries already appended to the Run by a mutation.
    pub fn publish_logs(&self, run_id: &str, entries: Vec<LogEntry>) {
        for entry in entries {
            let _ = self.events.send(RunEvent::Log {
                run_id: run_id.to_string(),
                entry,
            });
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Force any pending write and wait for it.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        self.persist.flush().await
    }
}

/// The single run whose id starts with `prefix`.
pub fn find_by_prefix(runs: Vec<Run>, prefix: &str) -> Option<Run> {
    if prefix.is_empty() {
        return None;
    }
    let mut matches = runs.into_iter().filter(|r| r.id.starts_with(prefix));
    let first = matches.next()?;
    match matches.next() {
        Some(_) => None,
        None => Some(first),
    }
}
