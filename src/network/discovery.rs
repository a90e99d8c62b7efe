use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::core::config::{Config, DEFAULT_DISCOVERY_PORT};
use crate::core::peer::{PeerInfo, PeerTable};
use crate::network::socket::{DataCallback, SocketEngine};
use crate::platform::Platform;
use crate::utils::{now_millis, Result};

/// Presence datagram, one JSON object per broadcast. The advertised
/// `port` is the peer's TCP transfer port. Receivers tolerate extra
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename = "announcement", rename_all = "camelCase")]
pub struct Announcement {
    pub peer_id: String,
    pub name: String,
    pub port: u16,
    pub platform: String,
    pub version: String,
    pub timestamp: i64,
}

pub type PeerDiscoveredCallback = Arc<dyn Fn(&PeerInfo, bool) + Send + Sync>;
pub type PeerLostCallback = Arc<dyn Fn(&str) + Send + Sync>;

type SharedPeers = Arc<Mutex<PeerTable>>;
type SharedDiscoveredCb = Arc<Mutex<Option<PeerDiscoveredCallback>>>;
type SharedLostCb = Arc<Mutex<Option<PeerLostCallback>>>;

/// Maintains the live view of reachable peers.
///
/// Once started, two tasks run until `stop`: an announcer broadcasting
/// our presence every `announce_interval_ms`, and a sweeper dropping
/// peers not heard from within `timeout_ms`. Inbound announcements are
/// handled on the UDP receive path. Callbacks fire outside the peer
/// table lock and may run on any worker thread.
pub struct DiscoveryService {
    socket: Arc<SocketEngine>,
    platform: Arc<dyn Platform>,
    discovery_port: u16,
    transfer_port: u16,
    announce_interval_ms: u64,
    timeout_ms: u64,
    announce_target: Option<(String, u16)>,
    peer_id: String,
    display_name: Arc<Mutex<String>>,
    peers: SharedPeers,
    discovered_cb: SharedDiscoveredCb,
    lost_cb: SharedLostCb,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(socket: Arc<SocketEngine>, platform: Arc<dyn Platform>, config: &Config) -> Self {
        // The reserved default maps to a random high port; any other
        // value is used verbatim.
        let discovery_port = if config.discovery_port == DEFAULT_DISCOVERY_PORT {
            let port = rand::thread_rng().gen_range(40000..=49999);
            info!(
                "Reserved discovery port {} requested; using random port {}",
                DEFAULT_DISCOVERY_PORT, port
            );
            port
        } else {
            config.discovery_port
        };

        let announce_target = config.announce_target.as_ref().and_then(|target| {
            match target.rsplit_once(':').and_then(|(host, port)| {
                port.parse::<u16>().ok().map(|p| (host.to_string(), p))
            }) {
                Some(parsed) => Some(parsed),
                None => {
                    warn!("Ignoring malformed announce target: {}", target);
                    None
                }
            }
        });

        let peer_id = Uuid::new_v4().to_string();
        let display_name = config
            .display_name
            .clone()
            .unwrap_or_else(|| format!("User on {}", platform.name()));

        debug!("Discovery service created with peer id {}", peer_id);

        Self {
            socket,
            platform,
            discovery_port,
            transfer_port: config.transfer_port,
            announce_interval_ms: config.announce_interval_ms,
            timeout_ms: config.peer_timeout_ms,
            announce_target,
            peer_id,
            display_name: Arc::new(Mutex::new(display_name)),
            peers: Arc::new(Mutex::new(PeerTable::new())),
            discovered_cb: Arc::new(Mutex::new(None)),
            lost_cb: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Discovery service already running");
            return Ok(());
        }

        info!(
            "Starting discovery on UDP port {} (announcing transfer port {})",
            self.discovery_port, self.transfer_port
        );

        let own_id = self.peer_id.clone();
        let peers = self.peers.clone();
        let discovered_cb = self.discovered_cb.clone();
        let on_data: DataCallback = Arc::new(move |bytes, endpoint| {
            handle_datagram(bytes, endpoint, &own_id, &peers, &discovered_cb);
        });

        if let Err(e) = self.socket.init_udp_socket(self.discovery_port, on_data).await {
            error!("Failed to open discovery socket: {}", e);
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_announcer());
        tasks.push(self.spawn_sweeper());
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("Discovery service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The actual UDP port in use, after any reserved-port remap.
    pub fn discovery_port(&self) -> u16 {
        self.discovery_port
    }

    pub fn display_name(&self) -> String {
        self.display_name.lock().unwrap().clone()
    }

    /// Update the advertised name; re-announces immediately while running.
    pub fn set_display_name(&self, name: impl Into<String>) {
        *self.display_name.lock().unwrap() = name.into();
        if self.is_running() {
            let socket = self.socket.clone();
            let target = self.announce_target.clone();
            let port = self.discovery_port;
            let announcement = self.build_announcement();
            tokio::spawn(async move {
                send_announcement(&socket, &target, port, &announcement).await;
            });
        }
    }

    /// Snapshot of peers heard from within the timeout window.
    pub fn known_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .lock()
            .unwrap()
            .snapshot(now_millis(), self.timeout_ms)
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.lock().unwrap().get(peer_id)
    }

    pub fn on_peer_discovered(&self, callback: PeerDiscoveredCallback) {
        *self.discovered_cb.lock().unwrap() = Some(callback);
    }

    pub fn on_peer_lost(&self, callback: PeerLostCallback) {
        *self.lost_cb.lock().unwrap() = Some(callback);
    }

    fn build_announcement(&self) -> Announcement {
        Announcement {
            peer_id: self.peer_id.clone(),
            name: self.display_name(),
            port: self.transfer_port,
            platform: self.platform.name(),
            version: crate::VERSION.to_string(),
            timestamp: now_millis(),
        }
    }

    fn spawn_announcer(&self) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let target = self.announce_target.clone();
        let discovery_port = self.discovery_port;
        let transfer_port = self.transfer_port;
        let interval_ms = self.announce_interval_ms;
        let peer_id = self.peer_id.clone();
        let display_name = self.display_name.clone();
        let platform_name = self.platform.name();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let announcement = Announcement {
                    peer_id: peer_id.clone(),
                    name: display_name.lock().unwrap().clone(),
                    port: transfer_port,
                    platform: platform_name.clone(),
                    version: crate::VERSION.to_string(),
                    timestamp: now_millis(),
                };
                send_announcement(&socket, &target, discovery_port, &announcement).await;
            }
        })
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let peers = self.peers.clone();
        let lost_cb = self.lost_cb.clone();
        let timeout_ms = self.timeout_ms;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;

                let removed = peers.lock().unwrap().remove_expired(now_millis(), timeout_ms);
                if removed.is_empty() {
                    continue;
                }

                let callback = lost_cb.lock().unwrap().clone();
                for peer in removed {
                    info!(
                        "Peer lost: {} ({}) at {}",
                        peer.name,
                        peer.id,
                        peer.endpoint()
                    );
                    if let Some(cb) = &callback {
                        cb(&peer.id);
                    }
                }
            }
        })
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn send_announcement(
    socket: &SocketEngine,
    target: &Option<(String, u16)>,
    discovery_port: u16,
    announcement: &Announcement,
) {
    let data = match serde_json::to_vec(announcement) {
        Ok(data) => data,
        Err(e) => {
            error!("Failed to encode announcement: {}", e);
            return;
        }
    };

    let sent = match target {
        Some((host, port)) => socket.send_udp(host, *port, &data).await,
        None => socket.send_udp_broadcast(discovery_port, &data).await,
    };

    if sent < 0 {
        error!("Failed to send discovery announcement");
    } else {
        debug!("Sent discovery announcement ({} bytes)", sent);
    }
}

/// Handle one inbound datagram: upsert the peer table and notify.
/// The sender's IP comes from the socket address; the advertised port
/// comes from the payload. Announcements carrying our own id are dropped.
fn handle_datagram(
    bytes: &[u8],
    endpoint: &str,
    own_id: &str,
    peers: &SharedPeers,
    discovered_cb: &SharedDiscoveredCb,
) {
    let announcement: Announcement = match serde_json::from_slice(bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Ignoring malformed discovery datagram from {}: {}", endpoint, e);
            return;
        }
    };

    if announcement.peer_id == own_id {
        return;
    }

    let ip_address = endpoint
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| endpoint.to_string());

    let peer = PeerInfo {
        id: announcement.peer_id,
        name: announcement.name,
        ip_address,
        port: announcement.port,
        platform: announcement.platform,
        version: announcement.version,
        last_seen: now_millis(),
    };

    let is_new = {
        let mut table = peers.lock().unwrap();
        table.upsert(peer.clone())
    };

    if is_new {
        info!(
            "New peer discovered: {} ({}) at {}",
            peer.name,
            peer.id,
            peer.endpoint()
        );
    } else {
        debug!("Peer updated: {} at {}", peer.id, peer.endpoint());
    }

    let callback = discovered_cb.lock().unwrap().clone();
    if let Some(cb) = callback {
        cb(&peer, is_new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NativePlatform;
    use std::sync::atomic::AtomicUsize;

    fn service_with_port(port: u16) -> DiscoveryService {
        let config = Config {
            discovery_port: port,
            ..Config::default()
        };
        DiscoveryService::new(
            Arc::new(SocketEngine::new()),
            Arc::new(NativePlatform::new()),
            &config,
        )
    }

    #[test]
    fn reserved_port_is_remapped_to_random_range() {
        let service = service_with_port(DEFAULT_DISCOVERY_PORT);
        assert!((40000..=49999).contains(&service.discovery_port()));
    }

    #[test]
    fn explicit_port_is_used_verbatim() {
        assert_eq!(service_with_port(41234).discovery_port(), 41234);
    }

    #[test]
    fn peer_id_is_rfc4122_v4() {
        let service = service_with_port(41234);
        let parsed = Uuid::parse_str(service.peer_id()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn announcement_json_shape() {
        let announcement = Announcement {
            peer_id: "p1".to_string(),
            name: "Alice".to_string(),
            port: 34568,
            platform: "linux".to_string(),
            version: "0.1.0".to_string(),
            timestamp: 1234,
        };

        let value: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&announcement).unwrap()).unwrap();
        assert_eq!(value["type"], "announcement");
        assert_eq!(value["peerId"], "p1");
        assert_eq!(value["port"], 34568);
    }

    #[test]
    fn announcement_tolerates_extra_fields() {
        let raw = br#"{"type":"announcement","peerId":"x","name":"n","port":1,
                       "platform":"linux","version":"9","timestamp":5,"extra":true}"#;
        let parsed: Announcement = serde_json::from_slice(raw).unwrap();
        assert_eq!(parsed.peer_id, "x");
    }

    #[test]
    fn datagram_handling_upserts_and_notifies() {
        let peers: SharedPeers = Arc::new(Mutex::new(PeerTable::new()));
        let discovered: SharedDiscoveredCb = Arc::new(Mutex::new(None));

        let new_count = Arc::new(AtomicUsize::new(0));
        let update_count = Arc::new(AtomicUsize::new(0));
        let (nc, uc) = (new_count.clone(), update_count.clone());
        *discovered.lock().unwrap() = Some(Arc::new(move |_peer: &PeerInfo, is_new: bool| {
            if is_new {
                nc.fetch_add(1, Ordering::SeqCst);
            } else {
                uc.fetch_add(1, Ordering::SeqCst);
            }
        }) as PeerDiscoveredCallback);

        let announcement = Announcement {
            peer_id: "remote".to_string(),
            name: "Bob".to_string(),
            port: 34568,
            platform: "linux".to_string(),
            version: "0.1.0".to_string(),
            timestamp: 0,
        };
        let bytes = serde_json::to_vec(&announcement).unwrap();

        handle_datagram(&bytes, "192.168.1.5:41000", "me", &peers, &discovered);
        handle_datagram(&bytes, "192.168.1.5:41000", "me", &peers, &discovered);

        assert_eq!(new_count.load(Ordering::SeqCst), 1);
        assert_eq!(update_count.load(Ordering::SeqCst), 1);

        let stored = peers.lock().unwrap().get("remote").unwrap();
        assert_eq!(stored.ip_address, "192.168.1.5");
        assert_eq!(stored.port, 34568);
    }

    #[test]
    fn own_announcements_are_ignored() {
        let peers: SharedPeers = Arc::new(Mutex::new(PeerTable::new()));
        let discovered: SharedDiscoveredCb = Arc::new(Mutex::new(None));

        let announcement = Announcement {
            peer_id: "me".to_string(),
            name: "self".to_string(),
            port: 1,
            platform: "linux".to_string(),
            version: "0.1.0".to_string(),
            timestamp: 0,
        };
        let bytes = serde_json::to_vec(&announcement).unwrap();

        handle_datagram(&bytes, "127.0.0.1:40000", "me", &peers, &discovered);
        assert!(peers.lock().unwrap().is_empty());
    }
}
