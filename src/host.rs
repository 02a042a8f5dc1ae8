use std::path::Path;
use std::sync::Arc;

/// Permission check supplied by the host application.
///
/// The engine asks before every network request and never touches the
/// network while this returns `false`. Plain closures implement it.
pub trait NetworkGate: Send + Sync {
    fn network_access_granted(&self) -> bool;
}

impl<F> NetworkGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn network_access_granted(&self) -> bool {
        self()
    }
}

/// Called once per finished download with `(canonical_name, path)`.
pub type CompletionCallback = Arc<dyn Fn(&str, &Path) + Send + Sync>;
