use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, error, info};
use walkdir::WalkDir;

/// A package file found under one of the scanned roots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalPackage {
    /// File name without extension, e.g. `Creator.Pack.5`
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub version: Option<u64>,
    /// Index of the owning root, lower wins ties
    pub root: usize,
}

/// Splits `Creator.Pack.5` into `("Creator.Pack", Some(5))`.
///
/// Only the final dot-segment is considered; if it is not a non-negative
/// integer the whole name is the base.
pub fn split_version_suffix(name: &str) -> (&str, Option<u64>) {
    if let Some((base, last)) = name.rsplit_once('.')
        && !base.is_empty()
        && !last.is_empty()
        && last.bytes().all(|b| b.is_ascii_digit())
        && let Ok(version) = last.parse::<u64>()
    {
        return (base, Some(version));
    }
    (name, None)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

/// Immutable lookup tables over the installed packages.
///
/// Built once per resolution pass; replaced wholesale, never edited while
/// shared.
#[derive(Clone, Debug, Default)]
pub struct LocalIndex {
    // lowercase file stem -> first file registered under that stem
    exact: HashMap<String, LocalPackage>,
    // lowercase base name -> variants, best first
    by_base: HashMap<String, Vec<LocalPackage>>,
    generation: u64,
    files: usize,
}

impl LocalIndex {
    /// Scans `roots` in priority order for `*.{extension}` files.
    ///
    /// Missing roots are skipped. Within a root, entries are visited in
    /// file-name order so ties resolve the same way on every platform.
    pub fn build(roots: &[PathBuf], extension: &str, generation: u64) -> Self {
        let mut index = LocalIndex {
            generation,
            ..Default::default()
        };
        for (priority, root) in roots.iter().enumerate() {
            if !root.is_dir() {
                debug!(root = %root.display(), "Skipping missing package root");
                continue;
            }
            for entry in WalkDir::new(root)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() || !has_extension(entry.path(), extension) {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if let Some(package) = Self::package_for(entry.path(), size, priority) {
                    index.insert(package);
                }
            }
        }
        index.order_variants();
        info!(
            files = index.files,
            bases = index.by_base.len(),
            generation,
            "Built local package index"
        );
        index
    }

    fn package_for(path: &Path, size: u64, root: usize) -> Option<LocalPackage> {
        let name = path.file_stem()?.to_str()?.to_string();
        let (_, version) = split_version_suffix(&name);
        Some(LocalPackage {
            name,
            path: path.to_path_buf(),
            size,
            version,
            root,
        })
    }

    fn insert(&mut self, package: LocalPackage) {
        let (base, _) = split_version_suffix(&package.name);
        let base = base.to_lowercase();
        let exact = self
            .exact
            .entry(package.name.to_lowercase())
            .or_insert_with(|| package.clone());
        if exact.path == package.path {
            *exact = package.clone();
        }
        let variants = self.by_base.entry(base).or_default();
        // Re-registering a rewritten file replaces its old record
        match variants.iter_mut().find(|known| known.path == package.path) {
            Some(known) => *known = package,
            None => {
                variants.push(package);
                self.files += 1;
            }
        }
    }

    // Highest version first; then root priority; then scan order (stable sort)
    fn order_variants(&mut self) {
        for variants in self.by_base.values_mut() {
            variants.sort_by(|a, b| b.version.cmp(&a.version).then(a.root.cmp(&b.root)));
        }
    }

    /// Finds the file for `name`.
    ///
    /// An exact file-stem match wins (names that already carry a version);
    /// otherwise the highest version registered under `name` as a base.
    pub fn resolve(&self, name: &str) -> Option<&LocalPackage> {
        let key = name.trim().to_lowercase();
        if let Some(package) = self.exact.get(&key) {
            return Some(package);
        }
        self.by_base.get(&key).and_then(|variants| variants.first())
    }

    /// Every variant installed for a base name, best first.
    pub fn variants(&self, base_name: &str) -> &[LocalPackage] {
        self.by_base
            .get(&base_name.trim().to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn packages(&self) -> impl Iterator<Item = &LocalPackage> {
        self.by_base.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// Files registered since some scan started, replayed onto that scan's result
#[derive(Default)]
struct Registrations {
    // (generation at registration, package)
    since_scan: Vec<(u64, LocalPackage)>,
    // Start generation of the newest scan that was installed
    last_scan: u64,
}

/// Owns the package roots and the current [`LocalIndex`] snapshot.
///
/// Generations only grow. A scan that finishes after a newer scan is
/// discarded, and files registered while a scan runs are carried over.
pub struct LocalResolver {
    roots: Vec<PathBuf>,
    extension: String,
    current: RwLock<Arc<LocalIndex>>,
    generation: AtomicU64,
    registrations: Mutex<Registrations>,
}

impl LocalResolver {
    pub fn new(roots: Vec<PathBuf>, extension: &str) -> Self {
        LocalResolver {
            roots,
            extension: extension.trim_start_matches('.').to_string(),
            current: RwLock::new(Arc::new(LocalIndex::default())),
            generation: AtomicU64::new(0),
            registrations: Mutex::new(Registrations::default()),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// The current snapshot. Cheap; holders keep it alive across rebuilds.
    pub fn snapshot(&self) -> Arc<LocalIndex> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    // `scan` carries the generation taken when its walk started
    fn install(&self, mut scan: LocalIndex) -> Arc<LocalIndex> {
        let started = scan.generation;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if started < registrations.last_scan {
            debug!(started, newer = registrations.last_scan, "Discarding stale local scan");
            return current.clone();
        }
        registrations.last_scan = started;

        let mut replayed = false;
        for (_, package) in registrations
            .since_scan
            .iter()
            .filter(|(registered, _)| *registered > started)
        {
            scan.insert(package.clone());
            replayed = true;
        }
        if replayed {
            scan.order_variants();
        }
        registrations
            .since_scan
            .retain(|(registered, _)| *registered > started);

        scan.generation = self.next_generation();
        let scan = Arc::new(scan);
        *current = scan.clone();
        scan
    }

    pub fn rebuild_blocking(&self) -> Arc<LocalIndex> {
        let index = LocalIndex::build(&self.roots, &self.extension, self.next_generation());
        self.install(index)
    }

    /// Rescans the roots on the blocking pool and swaps the result in.
    pub async fn rebuild(&self) -> Arc<LocalIndex> {
        let roots = self.roots.clone();
        let extension = self.extension.clone();
        let generation = self.next_generation();
        match tokio::task::spawn_blocking(move || LocalIndex::build(&roots, &extension, generation))
            .await
        {
            Ok(index) => self.install(index),
            Err(e) => {
                error!("Local index build failed: {e}");
                self.snapshot()
            }
        }
    }

    /// Adds a freshly written package file by publishing a new snapshot.
    pub fn register(&self, path: &Path) -> Option<Arc<LocalIndex>> {
        if !has_extension(path, &self.extension) {
            return None;
        }
        let size = std::fs::metadata(path).map(|m| m.len()).ok()?;
        let root = self
            .roots
            .iter()
            .position(|root| path.starts_with(root))
            .unwrap_or(self.roots.len());
        let package = LocalIndex::package_for(path, size, root)?;

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = LocalIndex::clone(&current);
        next.generation = self.next_generation();
        next.insert(package.clone());
        next.order_variants();
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .since_scan
            .push((next.generation, package));
        let next = Arc::new(next);
        *current = next.clone();
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![0u8; bytes]).unwrap();
        path
    }

    #[test]
    fn test_split_version_suffix() {
        assert_eq!(split_version_suffix("A.B.3"), ("A.B", Some(3)));
        assert_eq!(split_version_suffix("A.B"), ("A.B", None));
        assert_eq!(split_version_suffix("A.B.x3"), ("A.B.x3", None));
        assert_eq!(split_version_suffix("7"), ("7", None));
    }

    #[test]
    fn test_highest_version_wins() {
        let root = TempDir::new().unwrap();
        touch(root.path(), "A.B.3.var", 10);
        touch(root.path(), "sub/A.B.7.var", 20);
        touch(root.path(), "A.B.5.txt", 5);

        let index = LocalIndex::build(&[root.path().to_path_buf()], "var", 1);
        let found = index.resolve("A.B").unwrap();
        assert_eq!(found.version, Some(7));
        assert_eq!(found.size, 20);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_exact_name_first() {
        let root = TempDir::new().unwrap();
        touch(root.path(), "A.B.3.var", 10);
        touch(root.path(), "A.B.7.var", 20);

        let index = LocalIndex::build(&[root.path().to_path_buf()], "var", 1);
        assert_eq!(index.resolve("A.B.3").unwrap().version, Some(3));
        assert_eq!(index.resolve("a.b.3").unwrap().version, Some(3));
        assert!(index.resolve("A.B.4").is_none());
    }

    #[test]
    fn test_earlier_root_wins_ties() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let preferred = touch(first.path(), "A.B.2.var", 1);
        touch(second.path(), "A.B.2.var", 2);

        let roots = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let index = LocalIndex::build(&roots, "var", 1);
        assert_eq!(index.resolve("A.B").unwrap().path, preferred);
        assert_eq!(index.resolve("A.B.2").unwrap().path, preferred);
        assert_eq!(index.variants("A.B").len(), 2);
    }

    #[test]
    fn test_missing_roots_are_skipped() {
        let index = LocalIndex::build(&[PathBuf::from("/definitely/not/here")], "var", 1);
        assert!(index.is_empty());
        assert!(index.resolve("A.B").is_none());
    }

    #[test]
    fn test_register_publishes_new_snapshot() {
        let root = TempDir::new().unwrap();
        touch(root.path(), "A.B.3.var", 1);
        let resolver = LocalResolver::new(vec![root.path().to_path_buf()], ".var");
        let before = resolver.rebuild_blocking();

        let added = touch(root.path(), "A.B.4.var", 1);
        let after = resolver.register(&added).unwrap();

        assert_eq!(before.resolve("A.B").unwrap().version, Some(3));
        assert_eq!(after.resolve("A.B").unwrap().version, Some(4));
        assert!(after.generation() > before.generation());
        assert_eq!(resolver.snapshot().generation(), after.generation());
    }

    #[tokio::test]
    async fn test_async_rebuild() {
        let root = TempDir::new().unwrap();
        touch(root.path(), "X.Y.1.var", 1);
        let resolver = LocalResolver::new(vec![root.path().to_path_buf()], "var");
        assert!(resolver.snapshot().is_empty());
        let index = resolver.rebuild().await;
        assert_eq!(index.len(), 1);
        // One generation to start the scan, one to publish it
        assert_eq!(resolver.generation(), 2);
        assert_eq!(index.generation(), 2);
    }

    #[test]
    fn test_register_during_scan_survives_install() {
        let root = TempDir::new().unwrap();
        touch(root.path(), "A.B.3.var", 1);
        let resolver = LocalResolver::new(vec![root.path().to_path_buf()], "var");

        // Scan finishes before the download lands, install happens after
        let started = resolver.next_generation();
        let scan = LocalIndex::build(resolver.roots(), resolver.extension(), started);
        let added = touch(root.path(), "A.B.9.var", 1);
        let registered = resolver.register(&added).unwrap();
        assert_eq!(registered.resolve("A.B").unwrap().version, Some(9));

        let installed = resolver.install(scan);
        assert_eq!(installed.resolve("A.B").unwrap().version, Some(9));
        assert_eq!(installed.variants("A.B").len(), 2);
        assert!(installed.generation() > registered.generation());
        assert_eq!(resolver.snapshot().generation(), installed.generation());
    }

    #[test]
    fn test_stale_scan_is_discarded() {
        let root = TempDir::new().unwrap();
        touch(root.path(), "A.B.3.var", 1);
        let resolver = LocalResolver::new(vec![root.path().to_path_buf()], "var");

        let older = resolver.next_generation();
        let stale = LocalIndex::build(resolver.roots(), resolver.extension(), older);
        touch(root.path(), "A.B.4.var", 1);
        let fresh = resolver.rebuild_blocking();

        let kept = resolver.install(stale);
        assert_eq!(kept.generation(), fresh.generation());
        assert_eq!(resolver.snapshot().resolve("A.B").unwrap().version, Some(4));
    }
}
