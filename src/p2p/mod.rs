//! Peer network
//!
//! Tracks live links to directly connected peers, routes every inbound
//! message through one dispatcher, and fans file requests out to all peers
//! when a block is missing locally.
//!
//! Peer identities are random local tokens exchanged in advisory
//! `welcome`/`introduction` messages. Nothing binds a peer to its claims, so
//! any peer may answer for any content; callers verify payload digests.

mod link;
pub mod pending;
pub mod protocol;
pub mod server;

pub use pending::{Outcome, PendingTable};
pub use protocol::{FileAnnouncement, FileRequest, FileResponse, Hello, Message, ProtocolError};
pub use server::PeerListener;

use crate::cas::{BlockMetadata, BlockStore, ContentId, StoreResult};
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;

/// Announcements remembered before the oldest are evicted
pub const MAX_ANNOUNCEMENTS: usize = 1024;

/// Peer link errors. Only surfaced when dialling; failures on an
/// established link just remove that peer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid peer address: {0:?}")]
    InvalidAddress(String),

    #[error("failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Snapshot of one peer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub address: String,
    pub direction: Direction,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub open: bool,
}

/// Latest announcement heard for a block
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub hash: ContentId,
    pub peer_id: String,
    pub metadata: BlockMetadata,
    pub received_at: DateTime<Utc>,
}

/// A verified block obtained from a peer
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    pub payload: Vec<u8>,
    pub metadata: Option<BlockMetadata>,
    pub peer_id: String,
}

struct PeerEntry {
    address: String,
    direction: Direction,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    outbox: mpsc::UnboundedSender<Message>,
    /// Dial key to release when an outbound link goes away
    dial_key: Option<String>,
}

/// State shared by the network handle and the link tasks
pub(crate) struct Registry {
    local_id: String,
    store: Arc<BlockStore>,
    request_timeout: Duration,
    peers: Mutex<HashMap<String, PeerEntry>>,
    /// Outbound addresses that are connected or being dialled
    dialing: Mutex<HashSet<String>>,
    pending: PendingTable,
    announcements: Mutex<AnnouncementLog>,
}

impl Registry {
    fn register(
        &self,
        address: String,
        direction: Direction,
        dial_key: Option<String>,
    ) -> (String, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Utc::now();

        let mut peers = self.peers.lock().unwrap();
        let peer_id = loop {
            let candidate = generate_peer_id();
            if !peers.contains_key(&candidate) {
                break candidate;
            }
        };

        peers.insert(
            peer_id.clone(),
            PeerEntry {
                address,
                direction,
                connected_at: now,
                last_activity: now,
                outbox: tx,
                dial_key,
            },
        );

        (peer_id, rx)
    }

    /// Forget a peer. Safe to call more than once.
    pub(crate) fn deregister(&self, peer_id: &str) {
        let Some(entry) = self.peers.lock().unwrap().remove(peer_id) else {
            return;
        };

        if let Some(key) = &entry.dial_key {
            self.dialing.lock().unwrap().remove(key);
        }

        let abandoned = self.pending.abandon_peer(peer_id);
        log::info!(
            "Peer disconnected: {} ({}), {} pending request(s) abandoned",
            peer_id,
            entry.address,
            abandoned
        );
    }

    /// Queue a message for a peer. Dropped (and logged) when the link is gone.
    fn send(&self, peer_id: &str, message: Message) -> bool {
        let kind = message.kind();
        let mut peers = self.peers.lock().unwrap();

        let Some(peer) = peers.get_mut(peer_id) else {
            log::debug!("Dropping {} for unknown peer {}", kind, peer_id);
            return false;
        };

        if peer.outbox.send(message).is_err() {
            log::debug!("Dropping {} for peer {}: link closed", kind, peer_id);
            return false;
        }

        peer.last_activity = Utc::now();
        true
    }

    fn broadcast(&self, message: &Message) -> usize {
        let mut peers = self.peers.lock().unwrap();
        let mut delivered = 0;

        for (peer_id, peer) in peers.iter_mut() {
            if peer.outbox.send(message.clone()).is_ok() {
                peer.last_activity = Utc::now();
                delivered += 1;
            } else {
                log::debug!("Dropping {} for peer {}: link closed", message.kind(), peer_id);
            }
        }

        delivered
    }

    fn touch(&self, peer_id: &str) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(peer_id) {
            peer.last_activity = Utc::now();
        }
    }

    /// Single entry point for every inbound message
    pub(crate) async fn dispatch(&self, peer_id: &str, message: Message) {
        self.touch(peer_id);

        match message {
            Message::Welcome(hello) | Message::Introduction(hello) => {
                log::info!("Received hello from peer {} (calls itself {})", peer_id, hello.peer_id);
            }
            Message::RequestFile(request) => self.answer_request(peer_id, request).await,
            Message::FileResponse(response) => {
                let request_id = response.request_id.clone();
                if !self.pending.resolve(peer_id, response) {
                    log::debug!("Ignoring unmatched fileResponse {} from peer {}", request_id, peer_id);
                }
            }
            Message::AnnounceFile(announcement) => self.record_announcement(peer_id, announcement),
        }
    }

    async fn answer_request(&self, peer_id: &str, request: FileRequest) {
        let store = Arc::clone(&self.store);
        let id = request.hash.clone();
        let lookup = tokio::task::spawn_blocking(move || -> StoreResult<_> {
            match store.retrieve(id.as_str())? {
                Some(payload) => Ok(Some((payload, store.stat(id.as_str())?))),
                None => Ok(None),
            }
        })
        .await;

        let response = match lookup {
            Ok(Ok(Some((payload, metadata)))) => {
                log::debug!("Serving {} ({} bytes) to peer {}", request.hash, payload.len(), peer_id);
                FileResponse::found(request.request_id, request.hash, &payload, metadata)
            }
            Ok(Ok(None)) => FileResponse::missing(request.request_id, request.hash),
            Ok(Err(e)) => {
                log::error!("Failed to read {} for peer {}: {}", request.hash, peer_id, e);
                FileResponse::missing(request.request_id, request.hash)
            }
            Err(e) => {
                log::error!("Block lookup task failed: {}", e);
                FileResponse::missing(request.request_id, request.hash)
            }
        };

        self.send(peer_id, Message::FileResponse(response));
    }

    fn record_announcement(&self, peer_id: &str, announcement: FileAnnouncement) {
        log::info!(
            "Peer {} announced file: {} ({})",
            peer_id,
            announcement.hash,
            announcement.metadata.filename.as_deref().unwrap_or("unnamed")
        );

        self.announcements.lock().unwrap().record(Announcement {
            hash: announcement.hash,
            peer_id: peer_id.to_string(),
            metadata: announcement.metadata,
            received_at: Utc::now(),
        });
    }
}

/// Latest announcement per block, bounded to the most recently heard blocks
#[derive(Default)]
struct AnnouncementLog {
    latest: HashMap<ContentId, Announcement>,
    /// Oldest first
    order: VecDeque<ContentId>,
}

impl AnnouncementLog {
    fn record(&mut self, announcement: Announcement) {
        let hash = announcement.hash.clone();
        if self.latest.insert(hash.clone(), announcement).is_some() {
            self.order.retain(|known| known != &hash);
        }
        self.order.push_back(hash);

        while self.order.len() > MAX_ANNOUNCEMENTS {
            if let Some(oldest) = self.order.pop_front() {
                self.latest.remove(&oldest);
            }
        }
    }

    /// Most recent first
    fn snapshot(&self) -> Vec<Announcement> {
        self.order
            .iter()
            .rev()
            .filter_map(|hash| self.latest.get(hash).cloned())
            .collect()
    }
}

/// Handle to the peer registry and link manager
#[derive(Clone)]
pub struct PeerNetwork {
    registry: Arc<Registry>,
}

impl PeerNetwork {
    pub fn new(local_id: impl Into<String>, store: Arc<BlockStore>, request_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                local_id: local_id.into(),
                store,
                request_timeout,
                peers: Mutex::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                pending: PendingTable::new(),
                announcements: Mutex::new(AnnouncementLog::default()),
            }),
        }
    }

    /// Identity advertised to peers
    pub fn local_id(&self) -> &str {
        &self.registry.local_id
    }

    pub fn request_timeout(&self) -> Duration {
        self.registry.request_timeout
    }

    /// Register an inbound link and greet it. Returns the new peer id.
    pub fn accept_link<S>(&self, ws: WebSocketStream<S>, remote_address: impl Into<String>) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let remote_address = remote_address.into();
        let (peer_id, outbox) = self.registry.register(remote_address.clone(), Direction::Inbound, None);
        log::info!("New peer connected: {} from {}", peer_id, remote_address);

        self.registry
            .send(&peer_id, Message::Welcome(Hello::new(&self.registry.local_id)));
        link::spawn(Arc::downgrade(&self.registry), peer_id.clone(), ws, outbox);
        peer_id
    }

    /// Dial a peer unless already connected (or connecting) to that address.
    ///
    /// Returns the new peer id, or `None` when the address was already taken care of.
    pub async fn connect(&self, address: &str) -> Result<Option<String>, LinkError> {
        let url = normalize_address(address)?;

        if !self.registry.dialing.lock().unwrap().insert(url.clone()) {
            log::debug!("Already connected or connecting to {}", url);
            return Ok(None);
        }

        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(source) => {
                self.registry.dialing.lock().unwrap().remove(&url);
                log::error!("Connection error to {}: {}", url, source);
                return Err(LinkError::Dial { address: url, source });
            }
        };

        let (peer_id, outbox) = self
            .registry
            .register(url.clone(), Direction::Outbound, Some(url.clone()));
        log::info!("Connected to peer: {} as {}", url, peer_id);

        self.registry
            .send(&peer_id, Message::Introduction(Hello::new(&self.registry.local_id)));
        link::spawn(Arc::downgrade(&self.registry), peer_id.clone(), ws, outbox);
        Ok(Some(peer_id))
    }

    /// Close a link locally
    pub fn disconnect(&self, peer_id: &str) -> bool {
        let known = self.registry.peers.lock().unwrap().contains_key(peer_id);
        self.registry.deregister(peer_id);
        known
    }

    /// Best-effort delivery to one peer; no retry
    pub fn send(&self, peer_id: &str, message: Message) -> bool {
        self.registry.send(peer_id, message)
    }

    /// Best-effort delivery to every peer. Returns how many links accepted it.
    pub fn broadcast(&self, message: Message) -> usize {
        self.registry.broadcast(&message)
    }

    /// Tell every peer about a newly stored block
    pub fn announce(&self, metadata: BlockMetadata) -> usize {
        let id = metadata.id.clone();
        let delivered = self.broadcast(Message::AnnounceFile(FileAnnouncement::new(metadata)));
        log::debug!("Announced {} to {} peer(s)", id, delivered);
        delivered
    }

    /// Current peers, oldest link first
    pub fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.registry.peers.lock().unwrap();
        let mut infos: Vec<PeerInfo> = peers
            .iter()
            .map(|(peer_id, peer)| PeerInfo {
                peer_id: peer_id.clone(),
                address: peer.address.clone(),
                direction: peer.direction,
                connected_at: peer.connected_at,
                last_activity: peer.last_activity,
                open: !peer.outbox.is_closed(),
            })
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.peer_id.cmp(&b.peer_id)));
        infos
    }

    pub fn peer_count(&self) -> usize {
        self.registry.peers.lock().unwrap().len()
    }

    /// Announcements heard so far, most recent per block
    pub fn announcements(&self) -> Vec<Announcement> {
        self.registry.announcements.lock().unwrap().snapshot()
    }

    /// Requests still waiting for an answer
    pub fn pending_requests(&self) -> usize {
        self.registry.pending.len()
    }

    /// Ask every peer for a block and take the first verified answer.
    ///
    /// Each peer gets its own deadline; a silent peer only delays the result
    /// until then and never blocks the others. Answers whose payload does not
    /// hash to `id` are discarded.
    pub async fn fetch(&self, id: &ContentId) -> Option<FetchedBlock> {
        let peer_ids: Vec<String> = self.registry.peers.lock().unwrap().keys().cloned().collect();
        if peer_ids.is_empty() {
            return None;
        }

        let mut branches = FuturesUnordered::new();
        for peer_id in peer_ids {
            let waiter = self
                .registry
                .pending
                .register(&peer_id, id, self.registry.request_timeout);
            let request = Message::RequestFile(FileRequest::new(waiter.request_id(), id.clone()));

            // An unsent request is cancelled when its waiter drops here
            if self.registry.send(&peer_id, request) {
                branches.push(async move { (peer_id, waiter.outcome().await) });
            }
        }

        while let Some((peer_id, outcome)) = branches.next().await {
            match outcome {
                Outcome::Answered(response) => match verify_response(id, response) {
                    Ok(Some((payload, metadata))) => {
                        return Some(FetchedBlock {
                            payload,
                            metadata,
                            peer_id,
                        });
                    }
                    Ok(None) => log::debug!("Peer {} does not have {}", peer_id, id),
                    Err(e) => log::warn!("Rejecting response from peer {}: {}", peer_id, e),
                },
                Outcome::TimedOut => log::debug!("Peer {} timed out on {}", peer_id, id),
                Outcome::Closed => log::debug!("Peer {} went away before answering for {}", peer_id, id),
            }
        }

        None
    }
}

/// Check a response's payload against the identifier it was requested under
fn verify_response(
    id: &ContentId,
    response: FileResponse,
) -> Result<Option<(Vec<u8>, Option<BlockMetadata>)>, ProtocolError> {
    let Some(payload) = response.payload()? else {
        return Ok(None);
    };

    let actual = ContentId::derive(&payload);
    if &actual != id {
        return Err(ProtocolError::DigestMismatch {
            expected: id.clone(),
            actual,
        });
    }

    // Only keep metadata that describes this block
    let metadata = response.metadata.filter(|m| &m.id == id);
    Ok(Some((payload, metadata)))
}

/// Peer addresses are WebSocket URLs; bare `host:port` gets `ws://`
pub fn normalize_address(address: &str) -> Result<String, LinkError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(LinkError::InvalidAddress(address.to_string()));
    }

    if let Some(rest) = address.strip_prefix("ws://") {
        if rest.is_empty() {
            return Err(LinkError::InvalidAddress(address.to_string()));
        }
        return Ok(address.to_string());
    }

    if address.contains("://") {
        return Err(LinkError::InvalidAddress(address.to_string()));
    }

    Ok(format!("ws://{}", address))
}

/// Random 12-character lowercase token
fn generate_peer_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Default node identity when none is configured
pub fn generate_node_id() -> String {
    format!("node-{}", generate_peer_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::BlockStore;
    use tempfile::TempDir;

    fn create_test_network() -> (TempDir, PeerNetwork) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(BlockStore::new(temp.path()).unwrap());
        (temp, PeerNetwork::new("node-test", store, Duration::from_millis(200)))
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("127.0.0.1:9081").unwrap(), "ws://127.0.0.1:9081");
        assert_eq!(normalize_address(" ws://peer:9000 ").unwrap(), "ws://peer:9000");
        assert!(normalize_address("").is_err());
        assert!(normalize_address("ws://").is_err());
        assert!(normalize_address("http://peer:9000").is_err());
    }

    #[test]
    fn test_generated_ids() {
        let a = generate_peer_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a, generate_peer_id());
        assert!(generate_node_id().starts_with("node-"));
    }

    #[test]
    fn test_verify_response() {
        let id = ContentId::derive(b"genuine");
        let meta = BlockMetadata::new(id.clone(), 7, Some("g.txt".into()), None);

        let good = FileResponse::found("r", id.clone(), b"genuine", Some(meta.clone()));
        let (payload, metadata) = verify_response(&id, good).unwrap().unwrap();
        assert_eq!(payload, b"genuine");
        assert_eq!(metadata, Some(meta));

        let forged = FileResponse::found("r", id.clone(), b"forged", None);
        assert!(matches!(
            verify_response(&id, forged),
            Err(ProtocolError::DigestMismatch { .. })
        ));

        let missing = FileResponse::missing("r", id.clone());
        assert!(verify_response(&id, missing).unwrap().is_none());
    }

    #[test]
    fn test_send_to_unknown_peer_is_dropped() {
        let (_temp, network) = create_test_network();
        assert!(!network.send("ghost", Message::Welcome(Hello::new("x"))));
        assert_eq!(network.broadcast(Message::Welcome(Hello::new("x"))), 0);
    }

    #[test]
    fn test_announcements_are_bounded() {
        let (_temp, network) = create_test_network();
        let total = MAX_ANNOUNCEMENTS + 5;

        for i in 0..total {
            let id = ContentId::derive(format!("announced {}", i).as_bytes());
            let meta = BlockMetadata::new(id.clone(), 1, None, None);
            network
                .registry
                .record_announcement("peer-1", FileAnnouncement::new(meta));
        }

        let announcements = network.announcements();
        assert_eq!(announcements.len(), MAX_ANNOUNCEMENTS);

        // The first ones heard are the ones dropped
        let first = ContentId::derive(b"announced 0");
        let last = ContentId::derive(format!("announced {}", total - 1).as_bytes());
        assert!(!announcements.iter().any(|ann| ann.hash == first));
        assert_eq!(announcements[0].hash, last);

        // Hearing about a block again refreshes it instead of adding an entry
        let again = ContentId::derive(b"announced 10");
        let meta = BlockMetadata::new(again.clone(), 1, Some("again.txt".into()), None);
        network
            .registry
            .record_announcement("peer-2", FileAnnouncement::new(meta));

        let announcements = network.announcements();
        assert_eq!(announcements.len(), MAX_ANNOUNCEMENTS);
        assert_eq!(announcements[0].hash, again);
        assert_eq!(announcements[0].peer_id, "peer-2");
    }

    #[tokio::test]
    async fn test_fetch_without_peers() {
        let (_temp, network) = create_test_network();
        assert!(network.fetch(&ContentId::derive(b"nothing")).await.is_none());
        assert_eq!(network.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_address() {
        let (_temp, network) = create_test_network();
        assert!(matches!(
            network.connect("ftp://nowhere").await,
            Err(LinkError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_dial_releases_address() {
        let (_temp, network) = create_test_network();

        // Grab a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            network.connect(&addr.to_string()).await,
            Err(LinkError::Dial { .. })
        ));
        // A second attempt dials again instead of being treated as connected
        assert!(matches!(
            network.connect(&addr.to_string()).await,
            Err(LinkError::Dial { .. })
        ));
        assert_eq!(network.peer_count(), 0);
    }
}
