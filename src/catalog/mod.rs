use std::cmp::Ordering as VersionOrdering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::error::CatalogError;
use crate::events::{CatalogPhase, EventBus};
use crate::host::NetworkGate;
use crate::versioning::{compare, extract_version, strip_version};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One row of the remote package database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Full name including version, e.g. `Creator.Pack.9`
    #[serde(rename = "name", alias = "canonical_name", alias = "canonicalName")]
    pub canonical_name: String,
    #[serde(rename = "url", alias = "download_url", alias = "downloadUrl")]
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl CatalogEntry {
    pub fn new(canonical_name: &str, download_url: &str) -> Self {
        CatalogEntry {
            canonical_name: canonical_name.to_string(),
            download_url: download_url.to_string(),
            sha256: None,
            size: None,
        }
    }

    pub fn base_name(&self) -> &str {
        strip_version(&self.canonical_name)
    }
}

// Plaintext layout: either {"packages": [...]} or a bare array
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    Wrapped { packages: Vec<CatalogEntry> },
    Rows(Vec<CatalogEntry>),
}

pub fn parse_catalog(plaintext: &[u8]) -> Result<Vec<CatalogEntry>, CatalogError> {
    let rows = match serde_json::from_slice::<CatalogDocument>(plaintext)? {
        CatalogDocument::Wrapped { packages } => packages,
        CatalogDocument::Rows(rows) => rows,
    };
    Ok(rows)
}

/// Immutable catalog snapshot keyed by lowercase base name.
#[derive(Debug, Default)]
pub struct CatalogTable {
    entries: HashMap<String, CatalogEntry>,
    generation: u64,
    from_remote: bool,
    loaded_at: Option<DateTime<Utc>>,
}

impl CatalogTable {
    /// Builds a table; rows sharing a base name keep the highest version.
    pub fn from_rows(rows: Vec<CatalogEntry>, generation: u64, from_remote: bool) -> Self {
        let mut entries: HashMap<String, CatalogEntry> = HashMap::with_capacity(rows.len());
        for row in rows {
            let name = row.canonical_name.trim();
            if name.is_empty() || row.download_url.trim().is_empty() {
                continue;
            }
            let key = strip_version(name).to_lowercase();
            let keep_existing = entries.get(&key).is_some_and(|existing| {
                compare(
                    &extract_version(&existing.canonical_name),
                    &extract_version(&row.canonical_name),
                ) != VersionOrdering::Less
            });
            if !keep_existing {
                entries.insert(key, row);
            }
        }
        CatalogTable {
            entries,
            generation,
            from_remote,
            loaded_at: Some(Utc::now()),
        }
    }

    pub fn get(&self, base_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(&base_name.trim().to_lowercase())
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn from_remote(&self) -> bool {
        self.from_remote
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }
}

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    pub cache_path: PathBuf,
    pub passphrase: String,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
}

impl CatalogOptions {
    pub fn from_settings(settings: &settings::SettingsYaml) -> Self {
        CatalogOptions {
            cache_path: PathBuf::from(&settings.catalog_cache_path),
            passphrase: settings.catalog_passphrase.clone(),
            retry_attempts: settings.catalog_retry_attempts,
            retry_backoff: Duration::from_millis(settings.catalog_retry_backoff_ms),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        }
    }
}

/// Loads and answers queries against the encrypted remote package database.
pub struct RemoteCatalog {
    client: Client,
    options: CatalogOptions,
    gate: Arc<dyn NetworkGate>,
    events: EventBus,
    table: RwLock<Arc<CatalogTable>>,
    generation: AtomicU64,
    last_remote: AtomicBool,
    // One load at a time; lookups never wait on it
    load_lock: Mutex<()>,
}

impl RemoteCatalog {
    pub fn new(
        client: Client,
        options: CatalogOptions,
        gate: Arc<dyn NetworkGate>,
        events: EventBus,
    ) -> Self {
        RemoteCatalog {
            client,
            options,
            gate,
            events,
            table: RwLock::new(Arc::new(CatalogTable::default())),
            generation: AtomicU64::new(0),
            last_remote: AtomicBool::new(false),
            load_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<CatalogTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.snapshot().len()
    }

    /// Case-insensitive exact match on the base name.
    pub fn lookup(&self, base_name: &str) -> Option<CatalogEntry> {
        self.snapshot().get(base_name).cloned()
    }

    pub fn last_load_was_remote(&self) -> bool {
        self.last_remote.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot().loaded_at()
    }

    pub fn cache_path(&self) -> &Path {
        &self.options.cache_path
    }

    fn install(&self, rows: Vec<CatalogEntry>, from_remote: bool) -> usize {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let table = Arc::new(CatalogTable::from_rows(rows, generation, from_remote));
        let count = table.len();
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = table;
        self.last_remote.store(from_remote, Ordering::Release);
        count
    }

    /// Makes the catalog available, preferring memory, then the on-disk
    /// cache, then the network.
    ///
    /// Returns `false` when no table could be installed by this call; never
    /// errors. Progress is published as [`CatalogPhase`] status events.
    pub async fn load(&self, url: &str, force_refresh: bool, cancel: &CancellationToken) -> bool {
        let _guard = self.load_lock.lock().await;

        if !force_refresh && self.count() > 0 {
            return true;
        }
        if !force_refresh && self.load_cache().await {
            return true;
        }

        match self.fetch_with_retry(url, cancel).await {
            Ok((rows, plaintext)) => {
                let count = self.install(rows, true);
                if let Err(e) = self.write_cache(&plaintext).await {
                    warn!("Failed to save catalog cache: {e}");
                }
                info!(count, "Loaded package catalog from {url}");
                self.events.catalog_status(
                    CatalogPhase::Ready,
                    format!("Loaded {count} packages from the remote catalog"),
                );
                true
            }
            Err(CatalogError::Cancelled) => {
                self.events
                    .catalog_status(CatalogPhase::Cancelled, "Catalog load cancelled");
                false
            }
            Err(e) => {
                if force_refresh && self.count() == 0 && self.load_cache().await {
                    warn!("Remote catalog unavailable ({e}), using cached copy");
                    return true;
                }
                let phase = match e {
                    CatalogError::NoUrl | CatalogError::NetworkDenied => CatalogPhase::Offline,
                    _ => CatalogPhase::Failed,
                };
                warn!("Catalog load failed: {e}");
                self.events
                    .catalog_status(phase, format!("Package catalog unavailable: {e}"));
                false
            }
        }
    }

    async fn load_cache(&self) -> bool {
        let path = &self.options.cache_path;
        self.events.catalog_status(
            CatalogPhase::ReadingCache,
            format!("Reading cached catalog {}", path.display()),
        );
        let plaintext = match tokio::fs::read(path).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!("No usable catalog cache at {}: {e}", path.display());
                return false;
            }
        };
        let rows = match parse_catalog(&plaintext) {
            Ok(rows) if !rows.is_empty() => rows,
            Ok(_) => return false,
            Err(e) => {
                warn!("Ignoring corrupt catalog cache {}: {e}", path.display());
                return false;
            }
        };
        let count = self.install(rows, false);
        info!(count, "Loaded package catalog from cache");
        self.events.catalog_status(
            CatalogPhase::Ready,
            format!("Loaded {count} packages from the cached catalog"),
        );
        count > 0
    }

    async fn write_cache(&self, plaintext: &[u8]) -> Result<(), CatalogError> {
        let path = &self.options.cache_path;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, plaintext).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(Vec<CatalogEntry>, Vec<u8>), CatalogError> {
        if url.trim().is_empty() {
            return Err(CatalogError::NoUrl);
        }
        let attempts = self.options.retry_attempts.max(1);
        let mut delay = self.options.retry_backoff;
        let mut last_error = CatalogError::Empty;

        for attempt in 1..=attempts {
            if !self.gate.network_access_granted() {
                return Err(CatalogError::NetworkDenied);
            }
            self.events.catalog_status(
                CatalogPhase::Connecting,
                format!("Downloading package catalog (attempt {attempt} of {attempts})"),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CatalogError::Cancelled),
                result = self.fetch_once(url) => result,
            };
            match result {
                Ok(fetched) => return Ok(fetched),
                Err(e) => {
                    warn!(attempt, attempts, "Catalog fetch failed: {e}");
                    if attempt < attempts {
                        self.events.catalog_status(
                            CatalogPhase::WaitingForNetwork,
                            format!(
                                "{e}; retrying in {:.1}s (allow network access if your firewall asks)",
                                delay.as_secs_f32()
                            ),
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(CatalogError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(MAX_BACKOFF);
                    }
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn fetch_once(&self, url: &str) -> Result<(Vec<CatalogEntry>, Vec<u8>), CatalogError> {
        let response = self
            .client
            .get(url)
            .timeout(self.options.request_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status()));
        }
        let payload = response.bytes().await?;

        self.events
            .catalog_status(CatalogPhase::Decrypting, "Decrypting package catalog");
        let plaintext = crypto::open_catalog(&payload, &self.options.passphrase)?;
        let rows = parse_catalog(&plaintext)?;
        if rows.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok((rows, plaintext))
    }
}

/// Encrypts a plaintext catalog for publishing, after checking it parses.
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, CatalogError> {
    let rows = parse_catalog(plaintext)?;
    if rows.is_empty() {
        return Err(CatalogError::Empty);
    }
    Ok(crypto::seal_catalog(plaintext, passphrase)?)
}
