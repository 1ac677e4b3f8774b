use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::client::PeerClient;
use super::peers::{PeerSet, PeerSetError};
use crate::blockchain::{validate_chain, AppendOutcome, Block, Blockchain, BlockchainError};

/// Where this node stands relative to its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// No peers registered
    Solo,
    /// A chain pull is in progress, or peers exist but none was checked yet
    Syncing,
    /// No peer was ahead at the last check
    Converged,
}

/// What happened to a block pushed by a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    AlreadyKnown,
    Appended,
    /// The block did not fit; a longer valid chain was adopted instead
    Replaced,
    Rejected(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub height: u64,
    pub peers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Port assumed for hosts that push blocks without registering
    pub peer_port: u16,

    /// Minimum delay between background pulls
    pub pull_cooldown: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            peer_port: 8000,
            pull_cooldown: Duration::from_secs(60),
        }
    }
}

/// Keeps the local chain converged with the peer set: appends pushed blocks,
/// floods accepted ones, and adopts the longest valid peer chain when behind.
pub struct SyncEngine {
    blockchain: Blockchain,
    peers: PeerSet,
    client: Arc<dyn PeerClient>,
    settings: SyncSettings,
    state: Mutex<SyncState>,
    last_pull: Mutex<Option<Instant>>,
    pulling: AtomicBool,
}

/// Clears the pull flag when a pull ends, however it ends
struct PullGuard<'a>(&'a AtomicBool);

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(blockchain: Blockchain, peers: PeerSet, client: Arc<dyn PeerClient>, settings: SyncSettings) -> Self {
        SyncEngine {
            blockchain,
            peers,
            client,
            settings,
            state: Mutex::new(SyncState::Syncing),
            last_pull: Mutex::new(None),
            pulling: AtomicBool::new(false),
        }
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn state(&self) -> SyncState {
        if self.peers.is_empty() {
            return SyncState::Solo;
        }
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            state: self.state(),
            height: self.blockchain.height(),
            peers: self.peers.all(),
        }
    }

    /// Registers a peer and, if it is new, announces our own URL to it
    pub async fn add_peer(&self, url: &str) -> Result<bool, PeerSetError> {
        let added = self.peers.add(url)?;

        if added {
            if let Some(own_url) = self.peers.self_url() {
                let peer = super::peers::normalize(url)?;
                if let Err(err) = self.client.announce(&peer, own_url).await {
                    warn!("Could not announce ourselves to {}: {}", peer, err);
                }
            }
        }

        Ok(added)
    }

    /// Handles a block pushed by a peer.
    ///
    /// The sender, if known, is registered at the conventional peer port. A
    /// block that extends the head is appended and flooded onward; anything
    /// else triggers a full pull from all peers.
    pub async fn receive_block(&self, block: Block, remote: Option<IpAddr>) -> Result<ReceiveOutcome, BlockchainError> {
        let origin = remote.map(|ip| match ip {
            IpAddr::V4(v4) => format!("http://{}:{}", v4, self.settings.peer_port),
            IpAddr::V6(v6) => format!("http://[{}]:{}", v6, self.settings.peer_port),
        });
        if let Some(origin) = &origin {
            match self.peers.add(origin) {
                Ok(true) => info!("Registered block sender {} as a peer", origin),
                Ok(false) => {}
                Err(err) => debug!("Not registering block sender: {}", err),
            }
        }

        info!("Received block {} with hash {}", block.index, block.hash);
        let worker = self.blockchain.clone();
        let offered = block.clone();
        let appended = tokio::task::spawn_blocking(move || worker.append_block(offered))
            .await
            .map_err(|e| BlockchainError::SystemError(format!("append task failed: {}", e)))?;

        match appended {
            Ok(AppendOutcome::AlreadyKnown) => Ok(ReceiveOutcome::AlreadyKnown),
            Ok(AppendOutcome::Appended) => {
                info!("Appended block {} from peer", block.index);
                self.broadcast(&block, origin.as_deref()).await;
                Ok(ReceiveOutcome::Appended)
            }
            Err(err @ (BlockchainError::ConsensusConflict(_) | BlockchainError::Validation(_))) => {
                warn!("Block {} does not fit the local chain ({}), pulling from peers", block.index, err);
                if self.pull_longest().await? {
                    Ok(ReceiveOutcome::Replaced)
                } else {
                    Ok(ReceiveOutcome::Rejected(err.to_string()))
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Sends a block to every peer except `skip`; failures are only logged
    pub async fn broadcast(&self, block: &Block, skip: Option<&str>) {
        let targets: Vec<String> = self
            .peers
            .all()
            .into_iter()
            .filter(|peer| Some(peer.as_str()) != skip)
            .collect();

        let results = join_all(targets.iter().map(|peer| self.client.push_block(peer, block))).await;
        for result in results {
            if let Err(err) = result {
                warn!("Broadcast of block {} failed: {}", block.index, err);
            }
        }
    }

    /// Fetches every peer's chain concurrently and adopts the longest one
    /// that validates and is strictly longer than ours. Ties go to the peer
    /// registered first. Returns whether the chain was replaced.
    pub async fn pull_longest(&self) -> Result<bool, BlockchainError> {
        if self.pulling.swap(true, Ordering::SeqCst) {
            debug!("Pull already in progress");
            return Ok(false);
        }
        let _guard = PullGuard(&self.pulling);
        self.set_state(SyncState::Syncing);

        let peers = self.peers.all();
        let fetched = join_all(peers.iter().map(|peer| self.client.full_chain(peer))).await;
        *self.last_pull.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());

        let local_height = self.blockchain.height() as usize;
        let mut reachable = 0;
        let mut candidates: Vec<(&String, Vec<Block>)> = Vec::new();
        for (peer, result) in peers.iter().zip(fetched) {
            match result {
                Ok(chain) => {
                    reachable += 1;
                    if chain.len() > local_height {
                        candidates.push((peer, chain));
                    }
                }
                Err(err) => warn!("Sync fetch failed: {}", err),
            }
        }
        // Converged only if some peer answered and none had a longer chain
        let mut converged = reachable > 0 && candidates.is_empty();
        // Stable sort keeps peer order among equal lengths
        candidates.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        for (peer, chain) in candidates {
            let params = self.blockchain.params().clone();
            let length = chain.len();
            let validated = tokio::task::spawn_blocking(move || {
                let ledger = validate_chain(&chain, &params);
                (chain, ledger)
            })
            .await
            .map_err(|e| BlockchainError::SystemError(format!("validation task failed: {}", e)))?;

            match validated {
                (chain, Ok(ledger)) => {
                    let worker = self.blockchain.clone();
                    let replaced = tokio::task::spawn_blocking(move || worker.replace_chain(chain, ledger))
                        .await
                        .map_err(|e| BlockchainError::SystemError(format!("replace task failed: {}", e)))??;

                    if replaced {
                        info!("Local chain replaced by chain of length {} from {}", length, peer);
                        self.set_state(SyncState::Converged);
                        return Ok(true);
                    }
                    // We grew past it while validating; nothing shorter will do
                    converged = true;
                    break;
                }
                (_, Err(err)) => warn!("Rejected chain of length {} from {}: {}", length, peer, err),
            }
        }

        if converged {
            self.set_state(SyncState::Converged);
        } else {
            warn!("No peer offered a usable longer chain, staying in sync mode");
        }
        Ok(false)
    }

    /// One background round: ask every peer for its height and pull only if
    /// someone is ahead and the cooldown has passed.
    pub async fn reconcile(&self) -> Result<bool, BlockchainError> {
        let peers = self.peers.all();
        if peers.is_empty() {
            return Ok(false);
        }

        let heights = join_all(peers.iter().map(|peer| self.client.height(peer))).await;
        let local_height = self.blockchain.height();
        let mut reachable = 0;
        let mut ahead = false;
        for (peer, result) in peers.iter().zip(heights) {
            match result {
                Ok(height) => {
                    reachable += 1;
                    ahead |= height > local_height;
                }
                Err(err) => warn!("Height query to {} failed: {}", peer, err),
            }
        }

        if reachable == 0 {
            return Ok(false);
        }
        if !ahead {
            self.set_state(SyncState::Converged);
            return Ok(false);
        }

        let cooling = self
            .last_pull
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| at.elapsed() < self.settings.pull_cooldown)
            .unwrap_or(false);
        if cooling {
            debug!("A peer is ahead but the last pull was too recent");
            return Ok(false);
        }

        self.pull_longest().await
    }
}
