use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use crate::catalog::CatalogEntry;
use crate::events::{DownloadState, EngineEvent, EventBus};
use crate::local::LocalPackage;
use crate::versioning::is_newer;

/// Everything known about one requested package name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub requested_name: String,
    pub is_local: bool,
    /// File stem of the installed package, e.g. `Creator.Pack.5`
    pub local_name: Option<String>,
    pub local_path: Option<PathBuf>,
    pub local_version: Option<u64>,
    pub size_bytes: Option<u64>,
    pub is_available_remotely: bool,
    pub remote_canonical_name: Option<String>,
    pub download_url: Option<String>,
    pub has_newer_remote_version: bool,
    pub download_state: DownloadState,
    pub last_error: Option<String>,
}

impl SearchResult {
    pub fn new(requested_name: &str) -> Self {
        SearchResult {
            requested_name: requested_name.to_string(),
            ..Default::default()
        }
    }

    pub fn apply_local(&mut self, package: Option<&LocalPackage>) {
        match package {
            Some(package) => {
                self.is_local = true;
                self.local_name = Some(package.name.clone());
                self.local_path = Some(package.path.clone());
                self.local_version = package.version;
                self.size_bytes = Some(package.size);
            }
            None => {
                self.is_local = false;
                self.local_name = None;
                self.local_path = None;
                self.local_version = None;
                self.size_bytes = None;
            }
        }
        self.refresh_update_flag();
    }

    pub fn apply_remote(&mut self, entry: Option<&CatalogEntry>) {
        match entry {
            Some(entry) => {
                self.is_available_remotely = true;
                self.remote_canonical_name = Some(entry.canonical_name.clone());
                self.download_url = Some(entry.download_url.clone());
            }
            None => {
                self.is_available_remotely = false;
                self.remote_canonical_name = None;
                self.download_url = None;
            }
        }
        self.refresh_update_flag();
    }

    /// Only meaningful when the package is both installed and listed remotely.
    pub fn refresh_update_flag(&mut self) {
        self.has_newer_remote_version = match (&self.local_name, &self.remote_canonical_name) {
            (Some(local), Some(remote)) if self.is_local && self.is_available_remotely => {
                is_newer(remote, local)
            }
            _ => false,
        };
    }

    /// Key the download queue uses for this row.
    pub fn download_key(&self) -> Option<&str> {
        self.remote_canonical_name.as_deref()
    }

    pub fn matches_key(&self, key: &str) -> bool {
        self.download_key()
            .is_some_and(|own| own.eq_ignore_ascii_case(key.trim()))
    }
}

/// Session table of [`SearchResult`]s, one per requested name.
///
/// Rows are never removed individually. Each change bumps the revision and
/// publishes [`EngineEvent::ResultUpdated`].
pub struct ResultSet {
    rows: RwLock<Vec<SearchResult>>,
    revision: AtomicU64,
    events: EventBus,
}

impl ResultSet {
    pub fn new(events: EventBus) -> Self {
        ResultSet {
            rows: RwLock::new(Vec::new()),
            revision: AtomicU64::new(0),
            events,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn bump(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn announce(&self, changed: Vec<String>) {
        for requested_name in changed {
            let revision = self.bump();
            self.events.publish(EngineEvent::ResultUpdated {
                requested_name,
                revision,
            });
        }
    }

    /// Applies `f` to the row for `requested_name`, creating it first if
    /// needed. Returns the row as it is afterwards.
    pub fn upsert(&self, requested_name: &str, f: impl FnOnce(&mut SearchResult)) -> SearchResult {
        let (row, changed) = {
            let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
            let (index, created) = match rows
                .iter()
                .position(|row| row.requested_name.eq_ignore_ascii_case(requested_name))
            {
                Some(index) => (index, false),
                None => {
                    rows.push(SearchResult::new(requested_name));
                    (rows.len() - 1, true)
                }
            };
            let before = rows[index].clone();
            f(&mut rows[index]);
            let row = rows[index].clone();
            let changed = created || row != before;
            (row, changed)
        };
        if changed {
            self.announce(vec![row.requested_name.clone()]);
        }
        row
    }

    /// Applies `f` to every row whose download key is `key`. Returns how
    /// many rows changed.
    pub fn update_by_key(&self, key: &str, mut f: impl FnMut(&mut SearchResult)) -> usize {
        let changed: Vec<String> = {
            let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
            rows.iter_mut()
                .filter(|row| row.matches_key(key))
                .filter_map(|row| {
                    let before = row.clone();
                    f(row);
                    (*row != before).then(|| row.requested_name.clone())
                })
                .collect()
        };
        let count = changed.len();
        self.announce(changed);
        count
    }

    pub fn get(&self, requested_name: &str) -> Option<SearchResult> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|row| row.requested_name.eq_ignore_ascii_case(requested_name.trim()))
            .cloned()
    }

    /// All rows in request order.
    pub fn all(&self) -> Vec<SearchResult> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.bump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn local(name: &str, version: Option<u64>) -> LocalPackage {
        LocalPackage {
            name: name.to_string(),
            path: Path::new("/packages").join(format!("{name}.var")),
            size: 42,
            version,
            root: 0,
        }
    }

    #[test]
    fn test_newer_remote_version_is_flagged() {
        let mut result = SearchResult::new("Creator.Pack");
        result.apply_local(Some(&local("Creator.Pack.5", Some(5))));
        assert!(!result.has_newer_remote_version);

        result.apply_remote(Some(&CatalogEntry::new("Creator.Pack.9", "http://host/9")));
        assert!(result.has_newer_remote_version);

        result.apply_remote(Some(&CatalogEntry::new("Creator.Pack.5", "http://host/5")));
        assert!(!result.has_newer_remote_version);
    }

    #[test]
    fn test_update_flag_needs_both_sides() {
        let mut result = SearchResult::new("Creator.Pack");
        result.apply_remote(Some(&CatalogEntry::new("Creator.Pack.9", "http://host/9")));
        assert!(!result.has_newer_remote_version);

        result.apply_local(Some(&local("Creator.Pack.1", Some(1))));
        assert!(result.has_newer_remote_version);
        result.apply_local(None);
        assert!(!result.has_newer_remote_version);
        assert!(!result.is_local);
    }

    #[tokio::test]
    async fn test_changes_publish_revisions() {
        let events = EventBus::new();
        let mut receiver = events.subscribe();
        let results = ResultSet::new(events);

        results.upsert("Creator.Pack", |row| {
            row.apply_remote(Some(&CatalogEntry::new("Creator.Pack.2", "http://host/2")));
        });
        let updated = results.update_by_key("creator.pack.2", |row| {
            row.download_state = DownloadState::Queued;
        });
        assert_eq!(updated, 1);
        // Same value again is not a change
        assert_eq!(
            results.update_by_key("Creator.Pack.2", |row| row.download_state = DownloadState::Queued),
            0
        );

        for expected in [1, 2] {
            assert_eq!(
                receiver.recv().await.unwrap(),
                EngineEvent::ResultUpdated {
                    requested_name: String::from("Creator.Pack"),
                    revision: expected,
                }
            );
        }
        assert_eq!(results.revision(), 2);
        assert_eq!(
            results.get("CREATOR.PACK").unwrap().download_state,
            DownloadState::Queued
        );
    }

    #[test]
    fn test_rows_keep_request_order() {
        let results = ResultSet::new(EventBus::new());
        results.upsert("B.Pack", |_| {});
        results.upsert("A.Pack", |_| {});
        results.upsert("b.pack", |row| row.last_error = Some(String::from("boom")));

        let names: Vec<String> = results.all().into_iter().map(|r| r.requested_name).collect();
        assert_eq!(names, vec!["B.Pack", "A.Pack"]);
        assert_eq!(results.get("B.Pack").unwrap().last_error.as_deref(), Some("boom"));

        results.clear();
        assert!(results.is_empty());
    }
}
