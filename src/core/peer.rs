use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identity and reachability of a remote host, as learned from its
/// discovery announcements.
///
/// `id` is self-asserted and stable for the peer-process lifetime;
/// `(ip_address, port)` is refreshed on every announcement. `port` is the
/// peer's TCP transfer port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub platform: String,
    pub version: String,
    /// Epoch millis of the last announcement received.
    pub last_seen: i64,
}

impl PeerInfo {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

/// Peer table keyed by peer id. Owned exclusively by the discovery
/// service; everything handed out is a snapshot.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Insert or refresh a peer. Returns true on first appearance.
    pub fn upsert(&mut self, peer: PeerInfo) -> bool {
        self.peers.insert(peer.id.clone(), peer).is_none()
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.get(peer_id).cloned()
    }

    /// Remove and return every peer not seen within `timeout_ms`.
    pub fn remove_expired(&mut self, now_ms: i64, timeout_ms: u64) -> Vec<PeerInfo> {
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, peer)| now_ms - peer.last_seen > timeout_ms as i64)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.peers.remove(id))
            .collect()
    }

    /// Snapshot of live peers. Entries past the timeout are excluded even
    /// if the sweeper has not run yet.
    pub fn snapshot(&self, now_ms: i64, timeout_ms: u64) -> Vec<PeerInfo> {
        self.peers
            .values()
            .filter(|peer| now_ms - peer.last_seen <= timeout_ms as i64)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
