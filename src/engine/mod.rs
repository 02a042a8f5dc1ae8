use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use settings::SettingsYaml;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::{CatalogEntry, CatalogOptions, RemoteCatalog};
use crate::download::{ActiveDownload, DownloadListener, DownloadQueue, QueueOptions};
use crate::error::EngineError;
use crate::events::{DownloadState, EngineEvent, EventBus};
use crate::host::{CompletionCallback, NetworkGate};
use crate::local::{LocalIndex, LocalPackage, LocalResolver, split_version_suffix};
use crate::parser::{self, PackageIdentity, PackageVersion};
use crate::search::{ResultSet, SearchResult};

// Keeps result rows and the local index in step with the download queue
struct CompletionTracker {
    results: Arc<ResultSet>,
    local: Arc<LocalResolver>,
    on_complete: Option<CompletionCallback>,
}

impl DownloadListener for CompletionTracker {
    fn state_changed(&self, key: &str, state: DownloadState) {
        self.results.update_by_key(key, |row| {
            row.download_state = state;
            if state == DownloadState::Queued {
                row.last_error = None;
            }
        });
    }

    fn completed(&self, key: &str, entry: &CatalogEntry, path: &Path, size: u64) {
        if self.local.register(path).is_none() {
            debug!("{} is not a package file, index unchanged", path.display());
        }
        self.results.update_by_key(key, |row| {
            row.is_local = true;
            row.local_name = Some(entry.canonical_name.clone());
            row.local_path = Some(path.to_path_buf());
            row.local_version = split_version_suffix(&entry.canonical_name).1;
            row.size_bytes = Some(size);
            row.last_error = None;
            row.refresh_update_flag();
        });
        if let Some(callback) = &self.on_complete {
            callback(&entry.canonical_name, path);
        }
    }

    fn failed(&self, key: &str, message: &str) {
        self.results.update_by_key(key, |row| {
            row.last_error = Some(message.to_string());
        });
    }
}

/// Session object owning one instance of every component.
///
/// Resolution is driven by the caller; downloads run on the queue's own
/// workers and outlive any resolution cancel token.
pub struct Engine {
    settings: SettingsYaml,
    events: EventBus,
    gate: Arc<dyn NetworkGate>,
    local: Arc<LocalResolver>,
    catalog: Arc<RemoteCatalog>,
    queue: DownloadQueue,
    results: Arc<ResultSet>,
}

impl Engine {
    pub fn new(
        settings: SettingsYaml,
        gate: Arc<dyn NetworkGate>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<Self, EngineError> {
        let extension = settings.package_extension.trim_start_matches('.');
        if extension.is_empty() {
            return Err(EngineError::Settings(String::from(
                "package_extension must not be empty",
            )));
        }
        if settings.download_dir.trim().is_empty() {
            return Err(EngineError::Settings(String::from(
                "download_dir must not be empty",
            )));
        }

        let timeout = Duration::from_secs(settings.request_timeout_secs.max(1));
        let client = Client::builder()
            .user_agent(concat!("varsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        // The settings switch overrides whatever the host would answer
        let gate: Arc<dyn NetworkGate> = if settings.allow_network {
            gate
        } else {
            Arc::new(|| false)
        };

        let events = EventBus::new();
        let results = Arc::new(ResultSet::new(events.clone()));
        let local = Arc::new(LocalResolver::new(settings.package_roots(), extension));
        let catalog = Arc::new(RemoteCatalog::new(
            client.clone(),
            CatalogOptions::from_settings(&settings),
            gate.clone(),
            events.clone(),
        ));
        let tracker = CompletionTracker {
            results: results.clone(),
            local: local.clone(),
            on_complete,
        };
        let queue = DownloadQueue::new(
            client,
            QueueOptions::from_settings(&settings),
            gate.clone(),
            events.clone(),
            Some(Arc::new(tracker)),
        );

        Ok(Engine {
            settings,
            events,
            gate,
            local,
            catalog,
            queue,
            results,
        })
    }

    pub fn settings(&self) -> &SettingsYaml {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn local(&self) -> &LocalResolver {
        &self.local
    }

    pub fn catalog(&self) -> &RemoteCatalog {
        &self.catalog
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.queue
    }

    pub fn network_allowed(&self) -> bool {
        self.gate.network_access_granted()
    }

    /// Parses `input` and resolves every name locally, then remotely.
    ///
    /// Returns the rows for the names found in `input`, in input order.
    /// Cancelling `cancel` skips the remaining remote work but leaves the
    /// local results in place.
    pub async fn resolve(&self, input: &str, cancel: &CancellationToken) -> Vec<SearchResult> {
        let names = parser::parse(input);
        if names.is_empty() {
            return Vec::new();
        }
        info!("Resolving {} package names", names.len());

        let index = self.local.rebuild().await;
        for name in &names {
            let package = Self::resolve_local(&index, name);
            self.results.upsert(name, |row| row.apply_local(package));
        }

        if cancel.is_cancelled() {
            return self.rows_for(&names);
        }

        let loaded = self
            .catalog
            .load(&self.settings.catalog_url, false, cancel)
            .await;
        if loaded && !cancel.is_cancelled() {
            for name in &names {
                let base = PackageIdentity::parse(name).base_name;
                let entry = self.catalog.lookup(&base);
                self.results.upsert(name, |row| row.apply_remote(entry.as_ref()));
            }
        } else {
            debug!("Remote catalog unavailable, results are local only");
        }

        self.rows_for(&names)
    }

    fn resolve_local<'a>(index: &'a LocalIndex, name: &str) -> Option<&'a LocalPackage> {
        let identity = PackageIdentity::parse(name);
        match identity.version {
            PackageVersion::Latest => index.resolve(&identity.base_name),
            _ => index.resolve(name),
        }
    }

    fn rows_for(&self, names: &[String]) -> Vec<SearchResult> {
        names.iter().filter_map(|name| self.results.get(name)).collect()
    }

    pub fn results(&self) -> Vec<SearchResult> {
        self.results.all()
    }

    pub fn result(&self, requested_name: &str) -> Option<SearchResult> {
        self.results.get(requested_name)
    }

    pub fn results_revision(&self) -> u64 {
        self.results.revision()
    }

    pub fn clear_results(&self) {
        self.results.clear();
    }

    /// Forces a network reload of the catalog, falling back to the cache.
    pub async fn refresh_catalog(&self, cancel: &CancellationToken) -> bool {
        self.catalog
            .load(&self.settings.catalog_url, true, cancel)
            .await
    }

    /// Queues the remote package of every named result. Names without a
    /// remote entry are skipped. Returns how many were queued.
    pub fn download<S: AsRef<str>>(&self, requested_names: &[S]) -> usize {
        let entries: Vec<CatalogEntry> = requested_names
            .iter()
            .filter_map(|name| self.results.get(name.as_ref()))
            .filter_map(|row| self.entry_for(&row))
            .collect();

        self.queue.start();
        entries
            .into_iter()
            .filter(|entry| self.queue.enqueue(&entry.canonical_name, entry.clone()))
            .count()
    }

    // Full catalog row when available so checksum and size come along
    fn entry_for(&self, row: &SearchResult) -> Option<CatalogEntry> {
        let canonical = row.remote_canonical_name.as_deref()?;
        match self.catalog.lookup(&PackageIdentity::parse(canonical).base_name) {
            Some(entry) if entry.canonical_name.eq_ignore_ascii_case(canonical) => Some(entry),
            _ => Some(CatalogEntry::new(canonical, row.download_url.as_deref()?)),
        }
    }

    pub fn cancel_download(&self, key: &str) -> bool {
        self.queue.cancel_download(key)
    }

    pub fn remove_from_queue(&self, key: &str) -> bool {
        self.queue.remove_from_queue(key)
    }

    pub fn clear_queue(&self) {
        self.queue.clear_queue();
    }

    pub fn active_downloads(&self) -> Vec<ActiveDownload> {
        self.queue.active_downloads()
    }

    pub fn pending_downloads(&self) -> Vec<String> {
        self.queue.pending()
    }

    pub async fn wait_for_downloads(&self) {
        self.queue.wait_idle().await;
    }

    pub fn sweep_partials(&self) -> std::io::Result<Vec<PathBuf>> {
        self.queue.sweep_partials()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn settings_in(dir: &Path) -> SettingsYaml {
        let packages = dir.join("AddonPackages");
        SettingsYaml {
            package_roots: vec![packages.to_string_lossy().to_string()],
            download_dir: packages.to_string_lossy().to_string(),
            catalog_cache_path: dir.join("catalog.json").to_string_lossy().to_string(),
            ..SettingsYaml::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_against_local_and_cached_catalog() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        fs::create_dir_all(&settings.download_dir).unwrap();
        fs::write(dir.path().join("AddonPackages/Creator.Pack.5.var"), b"five").unwrap();
        fs::write(
            dir.path().join("catalog.json"),
            br#"{"packages":[{"name":"Creator.Pack.9","url":"http://127.0.0.1:9/Creator.Pack.9.var"}]}"#,
        )
        .unwrap();

        let engine = Engine::new(settings, Arc::new(|| false), None).unwrap();
        let results = engine
            .resolve("- Creator.Pack\n- Other.Thing.2", &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 2);
        let pack = &results[0];
        assert!(pack.is_local);
        assert_eq!(pack.local_version, Some(5));
        assert_eq!(pack.size_bytes, Some(4));
        assert!(pack.is_available_remotely);
        assert_eq!(pack.remote_canonical_name.as_deref(), Some("Creator.Pack.9"));
        assert!(pack.has_newer_remote_version);

        let other = &results[1];
        assert!(!other.is_local);
        assert!(!other.is_available_remotely);
        assert!(!other.has_newer_remote_version);
    }

    #[tokio::test]
    async fn test_cancelled_resolve_keeps_local_results() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        fs::create_dir_all(&settings.download_dir).unwrap();
        fs::write(dir.path().join("AddonPackages/Creator.Pack.1.var"), b"1").unwrap();

        let engine = Engine::new(settings, Arc::new(|| true), None).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = engine.resolve("Creator.Pack.1", &cancel).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].is_local);
        assert!(!results[0].is_available_remotely);
        assert_eq!(engine.catalog().count(), 0);
    }

    #[tokio::test]
    async fn test_download_skips_rows_without_remote_entry() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(settings_in(dir.path()), Arc::new(|| false), None).unwrap();
        engine.resolve("Creator.Pack", &CancellationToken::new()).await;

        assert_eq!(engine.download(&["Creator.Pack", "Missing.Pack"]), 0);
        assert!(engine.pending_downloads().is_empty());
    }

    #[tokio::test]
    async fn test_completion_updates_result_and_index() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(dir.path());
        fs::create_dir_all(&settings.download_dir).unwrap();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let callback_seen = seen.clone();
        let callback: CompletionCallback = Arc::new(move |name: &str, _path: &Path| {
            callback_seen.lock().unwrap().push(name.to_string());
        });
        let engine = Engine::new(settings, Arc::new(|| false), Some(callback.clone())).unwrap();

        let tracker = CompletionTracker {
            results: engine.results.clone(),
            local: engine.local.clone(),
            on_complete: Some(callback),
        };
        engine.results.upsert("Creator.Pack", |row| {
            row.apply_remote(Some(&CatalogEntry::new("Creator.Pack.3", "http://host/3")));
        });
        let path = dir.path().join("AddonPackages/Creator.Pack.3.var");
        fs::write(&path, b"three").unwrap();

        tracker.completed(
            "Creator.Pack.3",
            &CatalogEntry::new("Creator.Pack.3", "http://host/3"),
            &path,
            5,
        );

        let row = engine.result("creator.pack").unwrap();
        assert!(row.is_local);
        assert_eq!(row.local_version, Some(3));
        assert!(!row.has_newer_remote_version);
        assert_eq!(engine.local().snapshot().resolve("Creator.Pack").unwrap().path, path);
        assert_eq!(*seen.lock().unwrap(), vec!["Creator.Pack.3"]);
    }

    #[test]
    fn test_empty_extension_is_rejected() {
        let settings = SettingsYaml {
            package_extension: String::new(),
            ..SettingsYaml::default()
        };
        assert!(matches!(
            Engine::new(settings, Arc::new(|| true), None),
            Err(EngineError::Settings(_))
        ));

        let settings = SettingsYaml {
            download_dir: String::from("  "),
            ..SettingsYaml::default()
        };
        match Engine::new(settings, Arc::new(|| true), None) {
            Err(EngineError::Settings(message)) => assert!(message.contains("download_dir")),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("blank download_dir was accepted"),
        }
    }
}
