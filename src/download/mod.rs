use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::CatalogEntry;
use crate::crypto;
use crate::error::DownloadError;
use crate::events::{DownloadState, EngineEvent, EventBus};
use crate::host::NetworkGate;

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub download_dir: PathBuf,
    pub extension: String,
    pub workers: usize,
    /// Minimum number of new bytes between two progress events
    pub progress_step: u64,
}

impl QueueOptions {
    pub fn from_settings(settings: &settings::SettingsYaml) -> Self {
        QueueOptions {
            download_dir: PathBuf::from(&settings.download_dir),
            extension: settings.package_extension.trim_start_matches('.').to_string(),
            workers: settings.parallel_downloads,
            progress_step: settings.progress_step_bytes,
        }
    }
}

/// Observer for per-item transitions, called from the worker tasks.
///
/// Implementations must not call back into the queue.
pub trait DownloadListener: Send + Sync {
    fn state_changed(&self, _key: &str, _state: DownloadState) {}
    fn completed(&self, _key: &str, _entry: &CatalogEntry, _path: &Path, _size: u64) {}
    fn failed(&self, _key: &str, _message: &str) {}
}

/// Read-only view of a running transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveDownload {
    pub key: String,
    pub canonical_name: String,
    pub bytes: u64,
    pub total: Option<u64>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
struct QueueItem {
    key: String,
    normalized: String,
    entry: CatalogEntry,
    cancel: CancellationToken,
}

struct ActiveSlot {
    view: ActiveDownload,
    cancel: CancellationToken,
    temp_path: PathBuf,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueItem>,
    active: HashMap<String, ActiveSlot>,
}

impl QueueState {
    fn contains(&self, normalized: &str) -> bool {
        self.active.contains_key(normalized)
            || self.pending.iter().any(|item| item.normalized == normalized)
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }
}

struct Shared {
    client: Client,
    options: QueueOptions,
    gate: Arc<dyn NetworkGate>,
    events: EventBus,
    listener: Option<Arc<dyn DownloadListener>>,
    state: Mutex<QueueState>,
    wake: Notify,
    idle: Notify,
    shutdown: CancellationToken,
}

fn normalize(key: &str) -> String {
    key.trim().to_lowercase()
}

// Canonical names come from the network; keep them inside the download dir
fn file_name_for(canonical_name: &str, extension: &str) -> String {
    let safe: String = canonical_name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let safe = safe.trim_start_matches('.');
    format!("{safe}.{extension}")
}

// Partial files this queue writes: `<name>.<extension>.tmp`
fn is_partial_name(name: &str, extension: &str) -> bool {
    let suffix = format!(".{extension}{TEMP_SUFFIX}").to_lowercase();
    let name = name.to_lowercase();
    name.len() > suffix.len() && name.ends_with(&suffix)
}

// Rename over an existing file, removing it first only where rename refuses
async fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if tokio::fs::try_exists(to).await.unwrap_or(false) => {
            debug!("Rename onto {} failed ({e}), replacing", to.display());
            tokio::fs::remove_file(to).await?;
            tokio::fs::rename(from, to).await
        }
        Err(e) => Err(e),
    }
}

fn temp_path_for(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    destination.with_file_name(name)
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn destination(&self, entry: &CatalogEntry) -> PathBuf {
        self.options
            .download_dir
            .join(file_name_for(&entry.canonical_name, &self.options.extension))
    }

    // Listener first, so subscribers reacting to the event see updated state
    fn set_state(&self, key: &str, state: DownloadState) {
        if let Some(listener) = &self.listener {
            listener.state_changed(key, state);
        }
        self.events.download_state(key, state);
    }

    // Moves the oldest pending item into the active set
    fn take_next(&self) -> Option<(QueueItem, PathBuf)> {
        let mut state = self.lock();
        let item = state.pending.pop_front()?;
        let temp_path = temp_path_for(&self.destination(&item.entry));
        state.active.insert(
            item.normalized.clone(),
            ActiveSlot {
                view: ActiveDownload {
                    key: item.key.clone(),
                    canonical_name: item.entry.canonical_name.clone(),
                    bytes: 0,
                    total: item.entry.size,
                    started_at: Utc::now(),
                },
                cancel: item.cancel.clone(),
                temp_path: temp_path.clone(),
            },
        );
        self.set_state(&item.key, DownloadState::Downloading);
        Some((item, temp_path))
    }

    // Frees the key and publishes the terminal state under one lock, so a
    // re-enqueue's Queued always follows it
    fn release(&self, item: &QueueItem, terminal: DownloadState) {
        let idle = {
            let mut state = self.lock();
            state.active.remove(&item.normalized);
            self.set_state(&item.key, terminal);
            state.is_idle()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    // Drops every pending item and reports each as cancelled
    fn drain_pending(&self) {
        let (dropped, idle) = {
            let mut state = self.lock();
            let dropped: Vec<QueueItem> = state.pending.drain(..).collect();
            (dropped, state.is_idle())
        };
        for item in &dropped {
            self.set_state(&item.key, DownloadState::Cancelled);
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn report(&self, item: &QueueItem, bytes: u64, total: Option<u64>, source: &str) {
        if let Some(slot) = self.lock().active.get_mut(&item.normalized) {
            slot.view.bytes = bytes;
            slot.view.total = total;
        }
        self.events.publish(EngineEvent::DownloadProgress {
            key: item.key.clone(),
            bytes,
            total,
            source: source.to_string(),
        });
    }

    async fn run(&self, item: QueueItem, temp_path: PathBuf) {
        let destination = self.destination(&item.entry);
        let result = self.download(&item, &temp_path, &destination).await;
        if result.is_err()
            && let Err(e) = tokio::fs::remove_file(&temp_path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove partial file {}: {e}", temp_path.display());
        }

        let terminal = match result {
            Ok(size) => {
                info!(key = %item.key, size, "Download complete: {}", destination.display());
                self.events.publish(EngineEvent::DownloadCompleted {
                    key: item.key.clone(),
                    path: destination.clone(),
                    size,
                });
                if let Some(listener) = &self.listener {
                    listener.completed(&item.key, &item.entry, &destination, size);
                }
                DownloadState::Completed
            }
            Err(DownloadError::Cancelled) => {
                info!(key = %item.key, "Download cancelled");
                DownloadState::Cancelled
            }
            Err(e) => {
                let message = e.to_string();
                warn!(key = %item.key, "Download failed: {message}");
                self.events.publish(EngineEvent::DownloadError {
                    key: item.key.clone(),
                    message: message.clone(),
                });
                if let Some(listener) = &self.listener {
                    listener.failed(&item.key, &message);
                }
                DownloadState::Failed
            }
        };
        self.release(&item, terminal);
    }

    async fn download(
        &self,
        item: &QueueItem,
        temp_path: &Path,
        destination: &Path,
    ) -> Result<u64, DownloadError> {
        if !self.gate.network_access_granted() {
            return Err(DownloadError::NetworkDenied);
        }
        tokio::fs::create_dir_all(&self.options.download_dir).await?;

        let size = self.stream_to_file(item, temp_path).await?;

        if let Some(expected) = item.entry.sha256.clone() {
            let path = temp_path.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || crypto::calculate_sha256(path))
                .await
                .map_err(io::Error::other)??;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(DownloadError::Checksum { expected, actual });
            }
        }

        if item.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        replace_file(temp_path, destination).await?;
        Ok(size)
    }

    async fn stream_to_file(&self, item: &QueueItem, temp_path: &Path) -> Result<u64, DownloadError> {
        debug!(key = %item.key, "Requesting {}", item.entry.download_url);
        let response = tokio::select! {
            biased;
            _ = item.cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.client.get(&item.entry.download_url).send() => response?,
        };
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }

        let total = response.content_length().or(item.entry.size);
        let source = response
            .url()
            .host_str()
            .unwrap_or("unknown")
            .to_string();
        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        let mut reported = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = item.cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if downloaded - reported >= self.options.progress_step {
                reported = downloaded;
                self.report(item, downloaded, total, &source);
            }
        }
        file.flush().await?;
        drop(file);

        if reported != downloaded {
            self.report(item, downloaded, total, &source);
        }
        Ok(downloaded)
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "Download worker started");
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        let Some((item, temp_path)) = shared.take_next() else {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = shared.wake.notified() => continue,
            }
        };
        shared.run(item, temp_path).await;
    }
    debug!(worker, "Download worker stopped");
}

/// Bounded pool of download workers fed from a FIFO queue.
///
/// Keys are compared case-insensitively. Every operation returns
/// immediately; results arrive as [`EngineEvent`]s and through the
/// optional [`DownloadListener`].
pub struct DownloadQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadQueue {
    pub fn new(
        client: Client,
        options: QueueOptions,
        gate: Arc<dyn NetworkGate>,
        events: EventBus,
        listener: Option<Arc<dyn DownloadListener>>,
    ) -> Self {
        DownloadQueue {
            shared: Arc::new(Shared {
                client,
                options,
                gate,
                events,
                listener,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker pool on the current tokio runtime. Idempotent.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() || self.shared.shutdown.is_cancelled() {
            return;
        }
        match self.sweep_partials() {
            Ok(removed) if !removed.is_empty() => {
                info!("Removed {} stale partial downloads", removed.len());
            }
            Ok(_) => {}
            Err(e) => debug!("Skipped partial download sweep: {e}"),
        }
        let count = self.shared.options.workers.max(1);
        for worker in 0..count {
            workers.push(tokio::spawn(worker_loop(self.shared.clone(), worker)));
        }
        info!(workers = count, "Download queue started");
    }

    /// Queues `entry` under `key`. False if the key is already pending or
    /// active, or the queue has been shut down.
    pub fn enqueue(&self, key: &str, entry: CatalogEntry) -> bool {
        let normalized = normalize(key);
        if normalized.is_empty() || self.shared.shutdown.is_cancelled() {
            return false;
        }
        {
            let mut state = self.shared.lock();
            if state.contains(&normalized) {
                return false;
            }
            state.pending.push_back(QueueItem {
                key: key.trim().to_string(),
                normalized,
                entry,
                cancel: self.shared.shutdown.child_token(),
            });
            // Published under the lock so no worker can report first
            self.shared.set_state(key.trim(), DownloadState::Queued);
        }
        self.shared.wake.notify_one();
        true
    }

    /// Drops a pending item. Active transfers are not touched.
    pub fn remove_from_queue(&self, key: &str) -> bool {
        let normalized = normalize(key);
        let (removed, idle) = {
            let mut state = self.shared.lock();
            let position = state
                .pending
                .iter()
                .position(|item| item.normalized == normalized);
            let removed = position.and_then(|index| state.pending.remove(index));
            (removed, state.is_idle())
        };
        let Some(item) = removed else {
            return false;
        };
        self.shared.set_state(&item.key, DownloadState::Cancelled);
        if idle {
            self.shared.idle.notify_waiters();
        }
        true
    }

    /// Signals an active transfer to stop. The worker removes the partial
    /// file and reports `Cancelled`.
    pub fn cancel_download(&self, key: &str) -> bool {
        let state = self.shared.lock();
        match state.active.get(&normalize(key)) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every active transfer and drops every pending item.
    pub fn clear_queue(&self) {
        for slot in self.shared.lock().active.values() {
            slot.cancel.cancel();
        }
        self.shared.drain_pending();
    }

    pub fn active_downloads(&self) -> Vec<ActiveDownload> {
        let state = self.shared.lock();
        let mut active: Vec<ActiveDownload> =
            state.active.values().map(|slot| slot.view.clone()).collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Pending keys in start order.
    pub fn pending(&self) -> Vec<String> {
        self.shared
            .lock()
            .pending
            .iter()
            .map(|item| item.key.clone())
            .collect()
    }

    pub fn is_queued(&self, key: &str) -> bool {
        self.shared.lock().contains(&normalize(key))
    }

    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    /// Resolves once nothing is pending or active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            // Re-check periodically in case a wakeup raced a new enqueue
            let _ = tokio::time::timeout(Duration::from_millis(500), notified).await;
        }
    }

    /// Where a finished download of `entry` is written.
    pub fn destination(&self, entry: &CatalogEntry) -> PathBuf {
        self.shared.destination(entry)
    }

    /// Deletes `*.<extension>.tmp` leftovers in the download directory that
    /// no active transfer owns. Other files are never touched.
    pub fn sweep_partials(&self) -> io::Result<Vec<PathBuf>> {
        let dir = &self.shared.options.download_dir;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let owned: Vec<PathBuf> = self
            .shared
            .lock()
            .active
            .values()
            .map(|slot| slot.temp_path.clone())
            .collect();
        let mut removed = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_partial = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| is_partial_name(name, &self.shared.options.extension));
            if is_partial && path.is_file() && !owned.contains(&path) {
                fs::remove_file(&path)?;
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Cancels active transfers, drops pending items and stops the workers.
    /// Later enqueues are rejected.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.drain_pending();
    }
}

impl Drop for DownloadQueue {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
