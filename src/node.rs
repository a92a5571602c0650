//! Node facade
//!
//! Ties the block store to the peer network. `get` serves from local disk
//! when it can and otherwise asks the directly connected peers, caching the
//! first verified answer.

use crate::cas::{BlockMetadata, BlockStore, ContentId, StoreError, StoreStats};
use crate::config::Config;
use crate::p2p::{self, LinkError, PeerInfo, PeerListener, PeerNetwork};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced to callers of node operations
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid content identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("peer link error: {0}")]
    Link(#[from] LinkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<StoreError> for NodeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidIdentifier(id) => NodeError::InvalidIdentifier(id),
            other => NodeError::Storage(other),
        }
    }
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

/// Liveness summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub node_id: String,
    pub peer_count: usize,
    pub block_count: usize,
}

/// A running node: local block store plus peer network
pub struct Node {
    store: Arc<BlockStore>,
    network: PeerNetwork,
    config: Config,
}

impl Node {
    /// Open the block store described by `config`. No sockets are touched.
    pub fn open(config: Config) -> NodeResult<Self> {
        let store = Arc::new(BlockStore::new(&config.node.data_dir)?);
        let local_id = config
            .node
            .name
            .clone()
            .unwrap_or_else(p2p::generate_node_id);
        let network = PeerNetwork::new(local_id, Arc::clone(&store), config.network.request_timeout());

        log::info!(
            "Opened node {} with data directory {:?}",
            network.local_id(),
            config.node.data_dir
        );

        Ok(Self {
            store,
            network,
            config,
        })
    }

    /// Start accepting peer links on `addr`, returning the bound address
    pub async fn listen(&self, addr: &str) -> NodeResult<SocketAddr> {
        let listener = PeerListener::bind(addr, self.network.clone()).await?;
        let local = listener.local_addr()?;
        tokio::spawn(listener.run());
        Ok(local)
    }

    /// Listen on the configured address and dial the configured peers.
    /// Peers that cannot be reached are logged and skipped.
    pub async fn start(&self) -> NodeResult<SocketAddr> {
        let local = self.listen(&self.config.node.listen).await?;

        for peer in &self.config.network.peers {
            if let Err(e) = self.connect_peer(peer).await {
                log::warn!("Skipping peer {}: {}", peer, e);
            }
        }

        Ok(local)
    }

    /// Store a payload locally and announce it to peers
    pub async fn store(
        &self,
        payload: Vec<u8>,
        filename: Option<String>,
        mime_type: Option<String>,
    ) -> NodeResult<ContentId> {
        let (id, metadata) = self
            .blocking(move |store| {
                let id = store.store(&payload, filename, mime_type)?;
                let metadata = store.stat(id.as_str())?;
                Ok((id, metadata))
            })
            .await?;

        if let Some(metadata) = metadata {
            self.announce(metadata);
        }
        Ok(id)
    }

    /// Fetch a payload from the local store or, failing that, from peers.
    /// `Ok(None)` means no reachable node holds it.
    pub async fn get(&self, id: &str) -> NodeResult<Option<Vec<u8>>> {
        let id = ContentId::parse(id)?;

        let local_id = id.clone();
        if let Some(payload) = self
            .blocking(move |store| store.retrieve(local_id.as_str()))
            .await?
        {
            return Ok(Some(payload));
        }

        let Some(block) = self.network.fetch(&id).await else {
            log::debug!("{} not found locally or on {} peer(s)", id, self.network.peer_count());
            return Ok(None);
        };

        log::info!("Received file {} from peer {}", id, block.peer_id);
        let (filename, mime_type) = match block.metadata {
            Some(meta) => (meta.filename, Some(meta.mime_type)),
            None => (None, None),
        };

        let payload = block.payload;
        let cached = payload.clone();
        self.blocking(move |store| store.store(&cached, filename, mime_type))
            .await?;

        Ok(Some(payload))
    }

    pub async fn stat(&self, id: &str) -> NodeResult<Option<BlockMetadata>> {
        let id = id.to_string();
        self.blocking(move |store| store.stat(&id)).await
    }

    pub async fn exists(&self, id: &str) -> NodeResult<bool> {
        let id = id.to_string();
        self.blocking(move |store| Ok(store.exists(&id))).await
    }

    /// Local blocks, newest first
    pub async fn list(&self) -> NodeResult<Vec<BlockMetadata>> {
        self.blocking(|store| store.list()).await
    }

    pub async fn delete(&self, id: &str) -> NodeResult<bool> {
        let id = id.to_string();
        self.blocking(move |store| store.delete(&id)).await
    }

    pub async fn stats(&self) -> NodeResult<StoreStats> {
        self.blocking(|store| store.stats()).await
    }

    /// Dial a peer; a no-op when already connected to that address
    pub async fn connect_peer(&self, address: &str) -> NodeResult<()> {
        self.network.connect(address).await?;
        Ok(())
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.network.peers()
    }

    /// Broadcast a stored block's metadata to every peer
    pub fn announce(&self, metadata: BlockMetadata) {
        self.network.announce(metadata);
    }

    pub async fn health(&self) -> NodeResult<Health> {
        let block_count = self.stats().await?.count;
        Ok(Health {
            node_id: self.network.local_id().to_string(),
            peer_count: self.network.peer_count(),
            block_count,
        })
    }

    pub fn network(&self) -> &PeerNetwork {
        &self.network
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run a store operation off the async executor
    async fn blocking<T, F>(&self, f: F) -> NodeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&BlockStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || f(&store)).await?;
        Ok(result?)
    }
}
