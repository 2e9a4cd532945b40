//! Durable registry file and its single-writer scheduler.
//!
//! `runs.json` holds the complete list of Runs ordered by creation time. It is
//! always replaced whole: serialize to a temp file in the same directory, then
//! rename over the old file. Writes are requested with [`PersistScheduler::schedule`]
//! and performed by one background task, so at most one write is ever in
//! flight and bursts of mutations coalesce into one write per debounce window.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use fs2::FileExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::errors::RegistryError;
use crate::run::Run;

/// Read every Run from `path`. A missing file is an empty registry.
pub fn load_runs(path: &Path) -> Result<Vec<Run>, RegistryError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(RegistryError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` with `runs`, sorted by creation time.
pub fn write_runs(path: &Path, mut runs: Vec<Run>) -> Result<(), RegistryError> {
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let write_err = |source: std::io::Error| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let json = serde_json::to_vec_pretty(&runs).map_err(|e| write_err(std::io::Error::other(e)))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(&json).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Exclusive advisory lock next to the registry file, held for the
/// registry's lifetime.
pub fn acquire_lock(path: &Path) -> Result<File, RegistryError> {
    let lock_path = lock_path(path);
    if let Some(dir) = lock_path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| RegistryError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|source| RegistryError::Write {
            path: lock_path.clone(),
            source,
        })?;
    file.try_lock_exclusive()
        .map_err(|_| RegistryError::Locked {
            path: path.to_path_buf(),
        })?;
    Ok(file)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

enum PersistRequest {
    Dirty,
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Handle to the writer task.
#[derive(Debug, Clone)]
pub struct PersistScheduler {
    tx: mpsc::UnboundedSender<PersistRequest>,
    path: PathBuf,
    writes: Arc<AtomicUsize>,
}

impl PersistScheduler {
    /// Spawn the writer task. It exits once every scheduler handle is dropped.
    pub fn spawn(path: PathBuf, runs: Arc<DashMap<String, Run>>, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writes = Arc::new(AtomicUsize::new(0));
        tokio::spawn(writer_loop(path.clone(), runs, debounce, rx, writes.clone()));
        Self { tx, path, writes }
    }

    /// Completed writes of the registry file so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Request a write soon. Never blocks and never writes inline.
    pub fn schedule(&self) {
        let _ = self.tx.send(PersistRequest::Dirty);
    }

    /// Write now (including anything pending) and wait for the result.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(PersistRequest::Flush(ack_tx))
            .map_err(|_| RegistryError::WriterClosed)?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(RegistryError::Write {
                path: self.path.clone(),
                source: std::io::Error::other(message),
            }),
            Err(_) => Err(RegistryError::WriterClosed),
        }
    }
}

async fn writer_loop(
    path: PathBuf,
    runs: Arc<DashMap<String, Run>>,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<PersistRequest>,
    writes: Arc<AtomicUsize>,
) {
    while let Some(request) = rx.recv().await {
        let mut acks = Vec::new();
        let mut coalesced = 0usize;
        match request {
            PersistRequest::Dirty => {
                // Wait out the debounce window, cut short only by a flush.
                let deadline = tokio::time::sleep(debounce);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        next = rx.recv() => match next {
                            Some(PersistRequest::Dirty) => coalesced += 1,
                            Some(PersistRequest::Flush(ack)) => {
                                acks.push(ack);
                                break;
                            }
                            None => break,
                        },
                    }
                }
            }
            PersistRequest::Flush(ack) => acks.push(ack),
        }
        while let Ok(request) = rx.try_recv() {
            coalesced += 1;
            if let PersistRequest::Flush(ack) = request {
                acks.push(ack);
            }
        }

        let snapshot: Vec<Run> = runs.iter().map(|entry| entry.value().clone()).collect();
        let count = snapshot.len();
        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || write_runs(&target, snapshot))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));
        match &result {
            Ok(()) => {
                writes.fetch_add(1, Ordering::Relaxed);
                debug!(runs = count, coalesced, path = %path.display(), "registry written")
            }
            Err(e) => error!(error = %e, path = %path.display(), "registry write failed"),
        }
        for ack in acks {
            let _ = ack.send(result.clone());
        }
    }
}
