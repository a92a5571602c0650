//! Content-addressed object store with a peer-to-peer retrieval overlay
//!
//! Blocks are stored on local disk under an identifier derived from their
//! bytes. Nodes link to each other over WebSocket and, when a block is
//! missing locally, ask their direct peers for it.

pub mod cas;
pub mod config;
pub mod node;
pub mod p2p;

pub use cas::{BlockMetadata, BlockStore, ContentId, StoreError, StoreStats};
pub use config::Config;
pub use node::{Node, NodeError};
pub use p2p::{PeerInfo, PeerNetwork};
