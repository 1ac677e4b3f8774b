use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

use crate::blockchain::Block;

/// Failures talking to a peer. The peer stays registered either way.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("Peer {peer} sent an unusable response: {reason}")]
    InvalidResponse { peer: String, reason: String },
}

/// Body of `GET /fullchain`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullChain {
    pub length: usize,
    pub chain: Vec<Block>,
}

/// Body of `GET /height`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeightResponse {
    pub height: u64,
}

/// Body of `POST /add_peer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPeerRequest {
    pub url: String,
}

/// Outbound side of the peer protocol
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Chain length reported by the peer
    async fn height(&self, peer: &str) -> Result<u64, PeerError>;

    /// The peer's whole chain
    async fn full_chain(&self, peer: &str) -> Result<Vec<Block>, PeerError>;

    /// Offers a block to the peer
    async fn push_block(&self, peer: &str, block: &Block) -> Result<(), PeerError>;

    /// Asks the peer to register `own_url`
    async fn announce(&self, peer: &str, own_url: &str) -> Result<(), PeerError>;
}

/// `PeerClient` over HTTP/JSON with a per-request timeout
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    /// Every request, connect included, is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(HttpPeerClient { client })
    }
}

fn unreachable(peer: &str, err: reqwest::Error) -> PeerError {
    PeerError::Unreachable {
        peer: peer.to_string(),
        reason: err.to_string(),
    }
}

fn invalid(peer: &str, err: reqwest::Error) -> PeerError {
    PeerError::InvalidResponse {
        peer: peer.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn height(&self, peer: &str) -> Result<u64, PeerError> {
        let response = self
            .client
            .get(format!("{}/height", peer))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable(peer, e))?;

        let body: HeightResponse = response.json().await.map_err(|e| invalid(peer, e))?;
        Ok(body.height)
    }

    async fn full_chain(&self, peer: &str) -> Result<Vec<Block>, PeerError> {
        let response = self
            .client
            .get(format!("{}/fullchain", peer))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable(peer, e))?;

        let body: FullChain = response.json().await.map_err(|e| invalid(peer, e))?;
        if body.length != body.chain.len() {
            return Err(PeerError::InvalidResponse {
                peer: peer.to_string(),
                reason: format!("declared length {} but sent {} blocks", body.length, body.chain.len()),
            });
        }

        Ok(body.chain)
    }

    async fn push_block(&self, peer: &str, block: &Block) -> Result<(), PeerError> {
        // A rejection is the peer's business; only transport failures matter here
        self.client
            .post(format!("{}/sync", peer))
            .json(block)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;

        Ok(())
    }

    async fn announce(&self, peer: &str, own_url: &str) -> Result<(), PeerError> {
        self.client
            .post(format!("{}/add_peer", peer))
            .json(&AddPeerRequest {
                url: own_url.to_string(),
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| unreachable(peer, e))?;

        Ok(())
    }
}
