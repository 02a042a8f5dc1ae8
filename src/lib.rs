pub mod catalog;
pub mod crypto;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod local;
pub mod logging;
pub mod parser;
pub mod search;
pub mod versioning;

pub use catalog::{CatalogEntry, RemoteCatalog};
pub use download::{ActiveDownload, DownloadQueue};
pub use engine::Engine;
pub use events::{CatalogPhase, DownloadState, EngineEvent, EventBus};
pub use host::{CompletionCallback, NetworkGate};
pub use local::{LocalIndex, LocalPackage, LocalResolver};
pub use parser::{PackageIdentity, PackageVersion, parse};
pub use search::{ResultSet, SearchResult};
pub use versioning::{VersionTuple, compare, extract_version, is_newer};
