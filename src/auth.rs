//! Admission control for the encrypted endpoint.
//!
//! The `zeromq` crate backing this broker (see `Cargo.toml`) does not
//! implement the CURVE security mechanism, so "encrypted endpoint" in this
//! codebase denotes a second plaintext ROUTER endpoint gated by this
//! authenticator rather than a literal encrypted socket transport — the
//! callback-based admission check the distilled spec treats as an opaque
//! external collaborator. See DESIGN.md for the full rationale.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

/// A user-supplied verdict function: given a peer identity, accept or
/// reject it on the encrypted endpoint.
pub type AuthCallback = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

enum Policy {
    AllowAny,
    Directory {
        path: PathBuf,
        allowed: RwLock<HashSet<Vec<u8>>>,
        file_count: RwLock<usize>,
    },
    Callback(AuthCallback),
}

/// Broker-wide peer admission check for the encrypted endpoint.
pub struct Authenticator {
    policy: Policy,
}

impl Authenticator {
    /// Accept every peer. Default when neither a directory nor a callback
    /// is configured.
    pub fn allow_any() -> Self {
        Self {
            policy: Policy::AllowAny,
        }
    }

    /// Load an allow-list of identities from the files present in `path`.
    pub fn from_directory(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let (allowed, count) = load_directory(&path)?;
        Ok(Self {
            policy: Policy::Directory {
                path,
                allowed: RwLock::new(allowed),
                file_count: RwLock::new(count),
            },
        })
    }

    /// Use a caller-supplied verdict function. Mutually exclusive with
    /// `from_directory` at the configuration layer (see `config.rs`).
    pub fn from_callback(callback: AuthCallback) -> Self {
        Self {
            policy: Policy::Callback(callback),
        }
    }

    /// Consulted once per newly observed identity on the encrypted endpoint.
    pub async fn authorize(&self, identity: &[u8]) -> bool {
        match &self.policy {
            Policy::AllowAny => true,
            Policy::Directory { allowed, .. } => allowed.read().await.contains(identity),
            Policy::Callback(cb) => cb(identity),
        }
    }

    /// Reconcile the credential directory if its file count has changed,
    /// called from the heartbeat tick per §4.6. No-op for other policies.
    /// A reload failure is logged by the caller and the previous set kept.
    pub async fn reconcile(&self) -> std::io::Result<()> {
        let Policy::Directory {
            path,
            allowed,
            file_count,
        } = &self.policy
        else {
            return Ok(());
        };
        let current = std::fs::read_dir(path)?.count();
        let mut cached = file_count.write().await;
        if *cached == current {
            return Ok(());
        }
        let (new_set, new_count) = load_directory(path)?;
        *allowed.write().await = new_set;
        *cached = new_count;
        Ok(())
    }
}

fn load_directory(path: &Path) -> std::io::Result<(HashSet<Vec<u8>>, usize)> {
    let mut set = HashSet::new();
    let mut count = 0usize;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            count += 1;
            if let Some(name) = entry.file_name().to_str() {
                set.insert(name.as_bytes().to_vec());
            }
        }
    }
    Ok((set, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_any_accepts_everyone() {
        let auth = Authenticator::allow_any();
        assert!(auth.authorize(b"anyone").await);
    }

    #[tokio::test]
    async fn callback_controls_admission() {
        let auth = Authenticator::from_callback(Arc::new(|id: &[u8]| id == b"ok-client"));
        assert!(auth.authorize(b"ok-client").await);
        assert!(!auth.authorize(b"other").await);
    }

    #[tokio::test]
    async fn directory_allows_only_listed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("client-a"), b"").unwrap();
        let auth = Authenticator::from_directory(dir.path()).unwrap();
        assert!(auth.authorize(b"client-a").await);
        assert!(!auth.authorize(b"client-b").await);
    }

    #[tokio::test]
    async fn directory_reload_picks_up_new_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("client-a"), b"").unwrap();
        let auth = Authenticator::from_directory(dir.path()).unwrap();
        assert!(!auth.authorize(b"client-b").await);

        std::fs::write(dir.path().join("client-b"), b"").unwrap();
        auth.reconcile().await.unwrap();
        assert!(auth.authorize(b"client-b").await);
    }

    #[tokio::test]
    async fn directory_reconcile_is_noop_without_file_count_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("client-a"), b"").unwrap();
        let auth = Authenticator::from_directory(dir.path()).unwrap();
        auth.reconcile().await.unwrap();
        assert!(auth.authorize(b"client-a").await);
    }
}
