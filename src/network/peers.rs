use log::{info, warn};
use thiserror::Error;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::blockchain::storage::{BlockchainStorage, StorageError};

/// Errors that can occur when registering a peer
#[derive(Debug, Error)]
pub enum PeerSetError {
    #[error("Invalid peer URL: {0}")]
    InvalidUrl(String),

    #[error("Refusing to register own URL {0} as a peer")]
    SelfAddress(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Known peer URLs, deduplicated and kept in insertion order.
///
/// Peers are never removed; an unreachable peer stays in the set and is
/// retried on the next round.
#[derive(Debug, Clone)]
pub struct PeerSet {
    peers: Arc<RwLock<Vec<String>>>,

    /// This node's public URL, if announced
    self_url: Option<String>,

    storage: Option<Arc<BlockchainStorage>>,
}

impl PeerSet {
    pub fn new(self_url: Option<String>) -> Self {
        PeerSet {
            peers: Arc::new(RwLock::new(Vec::new())),
            self_url: self_url.and_then(|url| normalize(&url).ok()),
            storage: None,
        }
    }

    /// Loads the persisted peer list; invalid entries are dropped with a warning
    pub fn with_storage(self_url: Option<String>, storage: Arc<BlockchainStorage>) -> Result<Self, StorageError> {
        let mut set = PeerSet::new(self_url);
        let mut peers = Vec::new();

        for url in storage.load_peers()? {
            match set.check(&url) {
                Ok(url) if !peers.contains(&url) => peers.push(url),
                Ok(_) => {}
                Err(err) => warn!("Dropping stored peer: {}", err),
            }
        }

        info!("Loaded {} peers from storage", peers.len());
        set.peers = Arc::new(RwLock::new(peers));
        set.storage = Some(storage);
        Ok(set)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<String>> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<String>> {
        self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, url: &str) -> Result<String, PeerSetError> {
        let url = normalize(url)?;
        if self.self_url.as_deref() == Some(url.as_str()) {
            return Err(PeerSetError::SelfAddress(url));
        }
        Ok(url)
    }

    /// Adds a peer. Returns `false` if it was already known.
    pub fn add(&self, url: &str) -> Result<bool, PeerSetError> {
        let url = self.check(url)?;

        let mut peers = self.write();
        if peers.contains(&url) {
            return Ok(false);
        }
        peers.push(url.clone());

        if let Some(storage) = &self.storage {
            if let Err(err) = storage.save_peers(&peers) {
                peers.pop();
                return Err(err.into());
            }
        }

        info!("Added peer {}", url);
        Ok(true)
    }

    /// Snapshot of all peers in insertion order
    pub fn all(&self) -> Vec<String> {
        self.read().clone()
    }

    pub fn self_url(&self) -> Option<&str> {
        self.self_url.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Trims whitespace and trailing slashes; only `http://` and `https://` URLs
/// with a host are accepted
pub fn normalize(url: &str) -> Result<String, PeerSetError> {
    let trimmed = url.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .ok_or_else(|| PeerSetError::InvalidUrl(url.to_string()))?;

    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return Err(PeerSetError::InvalidUrl(url.to_string()));
    }

    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_deduplicates_in_order() {
        let peers = PeerSet::new(None);

        assert!(peers.add("http://b:8000").unwrap());
        assert!(peers.add("http://a:8000/").unwrap());
        assert!(!peers.add("http://b:8000").unwrap());

        assert_eq!(peers.all(), vec!["http://b:8000", "http://a:8000"]);
    }

    #[test]
    fn test_rejects_invalid_and_self() {
        let peers = PeerSet::new(Some("http://me:8000/".into()));

        assert!(matches!(peers.add("ftp://x"), Err(PeerSetError::InvalidUrl(_))));
        assert!(matches!(peers.add("http://"), Err(PeerSetError::InvalidUrl(_))));
        assert!(matches!(peers.add("http://me:8000"), Err(PeerSetError::SelfAddress(_))));
        assert!(peers.is_empty());
    }

    #[test]
    fn test_peers_survive_restart() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(BlockchainStorage::new(dir.path()).unwrap());

        let peers = PeerSet::with_storage(None, storage.clone()).unwrap();
        peers.add("http://a:8000").unwrap();
        peers.add("https://b.example").unwrap();

        let reloaded = PeerSet::with_storage(None, storage).unwrap();
        assert_eq!(reloaded.all(), vec!["http://a:8000", "https://b.example"]);
    }
}
