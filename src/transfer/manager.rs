use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::protocol::{self, Envelope, FrameDecoder, MessageBody};
use crate::network::discovery::DiscoveryService;
use crate::network::socket::{ConnectionStatus, DataCallback, SocketEngine, StatusCallback};
use crate::storage::FileIo;
use crate::transfer::receiver::ReassemblyBuffer;
use crate::transfer::{sender, TransferDirection, TransferInfo, TransferStatus};
use crate::utils::{crypto, now_millis};

/// Status snapshots are delivered on every state or progress change.
pub type TransferStatusCallback = Arc<dyn Fn(&TransferInfo) + Send + Sync>;

/// Acceptance decision for an incoming request. May block; it runs on a
/// blocking worker, but inbound processing waits for the verdict.
pub type TransferRequestCallback = Arc<dyn Fn(&TransferInfo) -> bool + Send + Sync>;

const EVENT_QUEUE_DEPTH: usize = 4096;

pub(crate) enum NetEvent {
    Data(Vec<u8>, String),
    Status(ConnectionStatus, String, String),
}

#[derive(Default, Clone)]
pub(crate) struct EncryptionSettings {
    pub(crate) enabled: bool,
    pub(crate) password: String,
}

pub(crate) struct ManagerInner {
    pub(crate) file_io: Arc<FileIo>,
    pub(crate) socket: Arc<SocketEngine>,
    pub(crate) discovery: Arc<DiscoveryService>,
    pub(crate) download_dir: Mutex<PathBuf>,
    pub(crate) encryption: Mutex<EncryptionSettings>,
    pub(crate) transfers: Mutex<HashMap<String, TransferInfo>>,
    pub(crate) reassembly: Mutex<HashMap<String, ReassemblyBuffer>>,
    decoders: Mutex<HashMap<String, FrameDecoder>>,
    pub(crate) tasks: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    status_cb: Mutex<Option<TransferStatusCallback>>,
    pub(crate) request_cb: Mutex<Option<TransferRequestCallback>>,
    events_tx: mpsc::Sender<NetEvent>,
}

/// Negotiates, streams, cancels, and finalizes file transfers.
///
/// Owns the transfer registry and the reassembly buffers. All socket
/// events funnel through one bounded queue drained by a single event
/// task; outgoing transfers additionally get one chunk-streaming task
/// each, tracked by transfer id.
pub struct TransferManager {
    inner: Arc<ManagerInner>,
    server_port: u16,
    initialized: AtomicBool,
    events_rx: Mutex<Option<mpsc::Receiver<NetEvent>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransferManager {
    pub fn new(
        file_io: Arc<FileIo>,
        socket: Arc<SocketEngine>,
        discovery: Arc<DiscoveryService>,
        server_port: u16,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let download_dir = file_io.default_download_dir();

        Self {
            inner: Arc::new(ManagerInner {
                file_io,
                socket,
                discovery,
                download_dir: Mutex::new(download_dir),
                encryption: Mutex::new(EncryptionSettings::default()),
                transfers: Mutex::new(HashMap::new()),
                reassembly: Mutex::new(HashMap::new()),
                decoders: Mutex::new(HashMap::new()),
                tasks: tokio::sync::Mutex::new(HashMap::new()),
                status_cb: Mutex::new(None),
                request_cb: Mutex::new(None),
                events_tx,
            }),
            server_port,
            initialized: AtomicBool::new(false),
            events_rx: Mutex::new(Some(events_rx)),
            event_task: Mutex::new(None),
        }
    }

    /// Bind the transfer port and start processing. Returns false if the
    /// server could not be started.
    pub async fn init(&self) -> bool {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("Transfer manager already initialized");
            return true;
        }

        let (on_data, on_status) = self.inner.socket_callbacks();
        if let Err(e) = self
            .inner
            .socket
            .init_tcp_server(self.server_port, on_data, on_status)
            .await
        {
            error!("Failed to initialize TCP server: {}", e);
            self.initialized.store(false, Ordering::SeqCst);
            return false;
        }

        let mut events_rx = match self.events_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                error!("Transfer manager event queue already consumed");
                self.initialized.store(false, Ordering::SeqCst);
                return false;
            }
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    NetEvent::Data(bytes, endpoint) => {
                        ManagerInner::handle_data(&inner, &bytes, &endpoint).await
                    }
                    NetEvent::Status(status, endpoint, message) => {
                        inner.handle_connection_status(status, &endpoint, &message).await
                    }
                }
            }
        });
        *self.event_task.lock().unwrap() = Some(handle);

        info!("Transfer manager listening on port {}", self.server_port);
        true
    }

    /// Cancel every active transfer and wait for the chunk tasks to
    /// observe the cancellation. The socket engine is not ours to stop.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down transfer manager");

        let active: Vec<String> = {
            let transfers = self.inner.transfers.lock().unwrap();
            transfers
                .values()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.id.clone())
                .collect()
        };

        for id in active {
            self.cancel_transfer(&id).await;
        }

        let handles: Vec<(String, JoinHandle<()>)> =
            self.inner.tasks.lock().await.drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Chunk task for {} ended abnormally: {}", id, e);
                }
            }
        }

        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }

        self.inner.reassembly.lock().unwrap().clear();
        self.inner.decoders.lock().unwrap().clear();

        info!("Transfer manager shutdown complete");
    }

    /// Start sending a file to a discovered peer. Returns the transfer id,
    /// or an empty string when preflight fails (unknown peer, missing
    /// file, connect or request-send failure).
    pub async fn send_file(&self, peer_id: &str, path: &Path) -> String {
        if !self.initialized.load(Ordering::SeqCst) {
            error!("Transfer manager not initialized");
            return String::new();
        }

        if !self.inner.file_io.file_exists(path) {
            error!("File doesn't exist: {}", path.display());
            return String::new();
        }

        let Some(peer) = self.inner.discovery.peer(peer_id) else {
            error!("Peer not found: {}", peer_id);
            return String::new();
        };

        let (on_data, on_status) = self.inner.socket_callbacks();
        if let Err(e) = self
            .inner
            .socket
            .connect_tcp(&peer.ip_address, peer.port, on_data, on_status)
            .await
        {
            error!("Failed to connect to peer {} ({}): {}", peer.name, peer.id, e);
            return String::new();
        }

        let file_info = match self.inner.file_io.file_info(path).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to stat {}: {}", path.display(), e);
                return String::new();
            }
        };
        let file_hash = crypto::sha256_file(path).await.unwrap_or_default();

        let transfer_id = Uuid::new_v4().to_string();
        let endpoint = peer.endpoint();

        let transfer = TransferInfo {
            id: transfer_id.clone(),
            peer_id: peer.id.clone(),
            peer_name: peer.name.clone(),
            peer_address: endpoint.clone(),
            direction: TransferDirection::Outgoing,
            status: TransferStatus::Initializing,
            file_path: path.display().to_string(),
            file_name: file_info.name.clone(),
            file_size: file_info.size,
            bytes_transferred: 0,
            progress: 0.0,
            start_time: now_millis(),
            end_time: 0,
            error_message: String::new(),
        };

        self.inner
            .transfers
            .lock()
            .unwrap()
            .insert(transfer_id.clone(), transfer.clone());
        self.inner.emit_status(&transfer);

        let request = Envelope::new(
            transfer_id.as_str(),
            MessageBody::TransferRequest {
                sender_id: self.inner.discovery.peer_id().to_string(),
                sender_name: self.inner.discovery.display_name(),
                file_name: file_info.name.clone(),
                file_size: file_info.size,
                file_hash,
            },
        );

        if self.inner.send_envelope(&endpoint, &request).await < 0 {
            error!("Failed to send transfer request to {}", endpoint);
            self.inner.update_status(
                transfer_id.as_str(),
                TransferStatus::Failed,
                Some("Failed to send transfer request"),
            );
            return String::new();
        }

        self.inner
            .update_status(&transfer_id, TransferStatus::Waiting, None);
        info!(
            "Transfer request sent to {}: {}",
            peer.name, file_info.name
        );

        transfer_id
    }

    /// Cancel an active transfer. Returns false for unknown ids and
    /// transfers already in a terminal state. The transfer becomes
    /// Canceled whether or not the cancel message could be delivered.
    pub async fn cancel_transfer(&self, transfer_id: &str) -> bool {
        let Some(transfer) = self.inner.transfer_snapshot(transfer_id) else {
            error!("Transfer not found: {}", transfer_id);
            return false;
        };

        if transfer.status.is_terminal() {
            warn!("Transfer already completed or canceled: {}", transfer_id);
            return false;
        }

        let cancel = Envelope::new(
            transfer_id,
            MessageBody::TransferCancel {
                reason: "Canceled by user".to_string(),
            },
        );
        if self.inner.send_envelope(&transfer.peer_address, &cancel).await < 0 {
            warn!(
                "Could not deliver cancel for {} to {}",
                transfer_id, transfer.peer_address
            );
        }

        self.inner
            .update_status(transfer_id, TransferStatus::Canceled, Some("Canceled by user"));
        self.inner.drop_reassembly(transfer_id);

        info!("Transfer canceled: {}", transfer_id);
        true
    }

    pub fn transfer(&self, transfer_id: &str) -> Option<TransferInfo> {
        self.inner.transfer_snapshot(transfer_id)
    }

    pub fn all_transfers(&self) -> Vec<TransferInfo> {
        self.inner.transfers.lock().unwrap().values().cloned().collect()
    }

    pub fn on_status(&self, callback: TransferStatusCallback) {
        *self.inner.status_cb.lock().unwrap() = Some(callback);
    }

    pub fn on_request(&self, callback: TransferRequestCallback) {
        *self.inner.request_cb.lock().unwrap() = Some(callback);
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.inner.download_dir.lock().unwrap().clone()
    }

    pub fn set_default_download_dir(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        debug!("Default download directory set to {}", dir.display());
        *self.inner.download_dir.lock().unwrap() = dir;
    }

    pub fn set_encryption_enabled(&self, enabled: bool) {
        self.inner.encryption.lock().unwrap().enabled = enabled;
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.inner.encryption.lock().unwrap().enabled
    }

    pub fn set_encryption_password(&self, password: impl Into<String>) {
        self.inner.encryption.lock().unwrap().password = password.into();
    }

    /// Update both encryption fields under one lock acquisition.
    pub fn set_encryption(&self, enabled: bool, password: impl Into<String>) {
        let mut settings = self.inner.encryption.lock().unwrap();
        settings.enabled = enabled;
        settings.password = password.into();
    }
}

impl ManagerInner {
    /// Callbacks that forward socket events into the bounded queue. Used
    /// for the server and for every outbound connection.
    fn socket_callbacks(&self) -> (DataCallback, StatusCallback) {
        let data_tx = self.events_tx.clone();
        let on_data: DataCallback = Arc::new(move |bytes, endpoint| {
            if data_tx
                .try_send(NetEvent::Data(bytes.to_vec(), endpoint.to_string()))
                .is_err()
            {
                warn!("Transfer event queue full; dropping {} bytes", bytes.len());
            }
        });

        let status_tx = self.events_tx.clone();
        let on_status: StatusCallback = Arc::new(move |status, endpoint, message| {
            if status_tx
                .try_send(NetEvent::Status(status, endpoint.to_string(), message.to_string()))
                .is_err()
            {
                warn!("Transfer event queue full; dropping status event");
            }
        });

        (on_data, on_status)
    }

    async fn handle_data(inner: &Arc<Self>, bytes: &[u8], endpoint: &str) {
        let envelopes = {
            let mut decoders = inner.decoders.lock().unwrap();
            let decoder = decoders.entry(endpoint.to_string()).or_default();
            decoder.push(bytes)
        };

        let envelopes = match envelopes {
            Ok(envelopes) => envelopes,
            Err(e) => {
                error!("Protocol error from {}: {}", endpoint, e);
                inner.decoders.lock().unwrap().remove(endpoint);
                inner
                    .fail_endpoint_transfers(endpoint, &format!("Protocol error: {}", e))
                    .await;
                return;
            }
        };

        for envelope in envelopes {
            Self::dispatch(inner, envelope, endpoint).await;
        }
    }

    async fn dispatch(inner: &Arc<Self>, envelope: Envelope, endpoint: &str) {
        let transfer_id = envelope.transfer_id;
        match envelope.body {
            MessageBody::TransferRequest {
                sender_id,
                sender_name,
                file_name,
                file_size,
                file_hash,
            } => {
                inner
                    .process_transfer_request(
                        transfer_id,
                        sender_id,
                        sender_name,
                        file_name,
                        file_size,
                        file_hash,
                        endpoint,
                    )
                    .await
            }
            MessageBody::TransferResponse { accepted, receiver_name, .. } => {
                Self::process_transfer_response(inner, &transfer_id, accepted, &receiver_name)
                    .await
            }
            MessageBody::FileData {
                chunk_index,
                total_chunks,
                data,
            } => {
                inner
                    .process_file_data(&transfer_id, chunk_index, total_chunks, data, endpoint)
                    .await
            }
            MessageBody::TransferComplete { success, file_hash } => {
                inner
                    .process_transfer_complete(&transfer_id, success, &file_hash)
                    .await
            }
            MessageBody::TransferCancel { reason } => {
                inner.process_transfer_cancel(&transfer_id, &reason)
            }
        }
    }

    /// Sender side: the receiver's verdict on our request.
    async fn process_transfer_response(
        inner: &Arc<Self>,
        transfer_id: &str,
        accepted: bool,
        receiver_name: &str,
    ) {
        let Some(transfer) = inner.transfer_snapshot(transfer_id) else {
            error!("Received response for unknown transfer: {}", transfer_id);
            return;
        };

        info!(
            "Transfer response received from {}: {}",
            receiver_name,
            if accepted { "accepted" } else { "rejected" }
        );

        if !accepted {
            inner.update_status(
                transfer_id,
                TransferStatus::Canceled,
                Some("Transfer rejected by recipient"),
            );
            return;
        }

        if transfer.status != TransferStatus::Waiting {
            warn!(
                "Ignoring response for transfer {} in state {}",
                transfer_id, transfer.status
            );
            return;
        }

        inner.update_status(transfer_id, TransferStatus::InProgress, None);

        let handle = sender::spawn(
            inner.clone(),
            transfer_id.to_string(),
            transfer.peer_address.clone(),
            PathBuf::from(&transfer.file_path),
        );
        inner
            .tasks
            .lock()
            .await
            .insert(transfer_id.to_string(), handle);
    }

    fn process_transfer_cancel(&self, transfer_id: &str, reason: &str) {
        let message = format!("Canceled by peer: {}", reason);
        info!("Transfer {} canceled by peer: {}", transfer_id, reason);
        self.update_status(transfer_id, TransferStatus::Canceled, Some(&message));
        self.drop_reassembly(transfer_id);
    }

    async fn handle_connection_status(
        &self,
        status: ConnectionStatus,
        endpoint: &str,
        message: &str,
    ) {
        match status {
            ConnectionStatus::Connected => {
                debug!("Connection established: {}", endpoint);
            }
            ConnectionStatus::Disconnected => {
                debug!("Connection closed: {}", endpoint);
                self.decoders.lock().unwrap().remove(endpoint);
                self.fail_endpoint_transfers(endpoint, "Connection closed unexpectedly")
                    .await;
            }
            ConnectionStatus::Error => {
                error!("Connection error on {}: {}", endpoint, message);
                self.decoders.lock().unwrap().remove(endpoint);
                self.fail_endpoint_transfers(endpoint, &format!("Connection error: {}", message))
                    .await;
            }
        }
    }

    /// Fail every non-terminal transfer bound to an endpoint.
    async fn fail_endpoint_transfers(&self, endpoint: &str, message: &str) {
        let affected: Vec<String> = {
            let transfers = self.transfers.lock().unwrap();
            transfers
                .values()
                .filter(|t| t.peer_address == endpoint && !t.status.is_terminal())
                .map(|t| t.id.clone())
                .collect()
        };

        for id in affected {
            self.update_status(&id, TransferStatus::Failed, Some(message));
            self.drop_reassembly(&id);
        }
    }

    /// Set a transfer's status and notify. Terminal states stamp the end
    /// time; once terminal, further updates are ignored so observers
    /// never see a transition out of a terminal state.
    pub(crate) fn update_status(
        &self,
        transfer_id: &str,
        status: TransferStatus,
        error_message: Option<&str>,
    ) {
        let snapshot = {
            let mut transfers = self.transfers.lock().unwrap();
            let Some(transfer) = transfers.get_mut(transfer_id) else {
                return;
            };
            if transfer.status.is_terminal() {
                return;
            }

            transfer.status = status;
            if let Some(message) = error_message {
                transfer.error_message = message.to_string();
            }
            if status.is_terminal() {
                transfer.end_time = now_millis();
            }
            transfer.clone()
        };

        self.emit_status(&snapshot);
    }

    /// Record transferred bytes and derive the progress percentage.
    pub(crate) fn update_progress(&self, transfer_id: &str, bytes_transferred: u64) {
        let snapshot = {
            let mut transfers = self.transfers.lock().unwrap();
            let Some(transfer) = transfers.get_mut(transfer_id) else {
                return;
            };

            transfer.bytes_transferred = bytes_transferred.min(transfer.file_size);
            transfer.progress = if transfer.file_size > 0 {
                100.0 * transfer.bytes_transferred as f32 / transfer.file_size as f32
            } else {
                100.0
            };
            transfer.clone()
        };

        self.emit_status(&snapshot);
    }

    pub(crate) fn transfer_snapshot(&self, transfer_id: &str) -> Option<TransferInfo> {
        self.transfers.lock().unwrap().get(transfer_id).cloned()
    }

    pub(crate) fn transfer_status(&self, transfer_id: &str) -> Option<TransferStatus> {
        self.transfers
            .lock()
            .unwrap()
            .get(transfer_id)
            .map(|t| t.status)
    }

    pub(crate) fn emit_status(&self, transfer: &TransferInfo) {
        let callback = self.status_cb.lock().unwrap().clone();
        if let Some(cb) = callback {
            cb(transfer);
        }
    }

    /// Password to use for transfers, if encryption is configured.
    pub(crate) fn encryption_password(&self) -> Option<String> {
        let settings = self.encryption.lock().unwrap();
        if settings.enabled && !settings.password.is_empty() {
            Some(settings.password.clone())
        } else {
            None
        }
    }

    pub(crate) fn drop_reassembly(&self, transfer_id: &str) {
        self.reassembly.lock().unwrap().remove(transfer_id);
    }

    pub(crate) async fn send_envelope(&self, endpoint: &str, envelope: &Envelope) -> i64 {
        match protocol::encode_frame(envelope) {
            Ok(frame) => self.socket.send_tcp(endpoint, frame).await,
            Err(e) => {
                error!("Failed to encode message for {}: {}", endpoint, e);
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::platform::NativePlatform;

    fn manager() -> TransferManager {
        let socket = Arc::new(SocketEngine::new());
        let platform = Arc::new(NativePlatform::new());
        let discovery = Arc::new(DiscoveryService::new(
            socket.clone(),
            platform.clone(),
            &Config::default(),
        ));
        let file_io = Arc::new(FileIo::new(platform));
        TransferManager::new(file_io, socket, discovery, 0)
    }

    fn seed_transfer(manager: &TransferManager, id: &str, file_size: u64) {
        let transfer = TransferInfo {
            id: id.to_string(),
            peer_id: "peer".to_string(),
            peer_name: "Peer".to_string(),
            peer_address: "127.0.0.1:9".to_string(),
            direction: TransferDirection::Outgoing,
            status: TransferStatus::Initializing,
            file_path: "/tmp/x".to_string(),
            file_name: "x".to_string(),
            file_size,
            bytes_transferred: 0,
            progress: 0.0,
            start_time: now_millis(),
            end_time: 0,
            error_message: String::new(),
        };
        manager
            .inner
            .transfers
            .lock()
            .unwrap()
            .insert(id.to_string(), transfer);
    }

    #[test]
    fn terminal_status_stamps_end_time_and_sticks() {
        let manager = manager();
        seed_transfer(&manager, "t", 10);

        manager
            .inner
            .update_status("t", TransferStatus::Waiting, None);
        assert_eq!(manager.transfer("t").unwrap().end_time, 0);

        manager
            .inner
            .update_status("t", TransferStatus::Failed, Some("boom"));
        let failed = manager.transfer("t").unwrap();
        assert!(failed.end_time > 0);
        assert_eq!(failed.error_message, "boom");

        // Terminal states admit no further transitions.
        manager
            .inner
            .update_status("t", TransferStatus::Completed, None);
        assert_eq!(manager.transfer("t").unwrap().status, TransferStatus::Failed);
    }

    #[test]
    fn progress_is_derived_from_bytes() {
        let manager = manager();
        seed_transfer(&manager, "t", 200);

        manager.inner.update_progress("t", 50);
        let transfer = manager.transfer("t").unwrap();
        assert_eq!(transfer.bytes_transferred, 50);
        assert!((transfer.progress - 25.0).abs() < f32::EPSILON);

        // Bytes are clamped to the declared size.
        manager.inner.update_progress("t", 500);
        assert_eq!(manager.transfer("t").unwrap().bytes_transferred, 200);
    }

    #[test]
    fn zero_size_transfer_reports_full_progress() {
        let manager = manager();
        seed_transfer(&manager, "t", 0);

        manager.inner.update_progress("t", 0);
        assert!((manager.transfer("t").unwrap().progress - 100.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn cancel_unknown_transfer_returns_false() {
        let manager = manager();
        assert!(!manager.cancel_transfer("missing").await);
    }

    #[tokio::test]
    async fn cancel_terminal_transfer_returns_false() {
        let manager = manager();
        seed_transfer(&manager, "t", 10);
        manager
            .inner
            .update_status("t", TransferStatus::Completed, None);
        assert!(!manager.cancel_transfer("t").await);
    }

    #[test]
    fn encryption_settings_update_atomically() {
        let manager = manager();
        assert!(manager.inner.encryption_password().is_none());

        manager.set_encryption_enabled(true);
        // Enabled with an empty password still means plaintext.
        assert!(manager.inner.encryption_password().is_none());

        manager.set_encryption(true, "correct horse");
        assert_eq!(
            manager.inner.encryption_password().as_deref(),
            Some("correct horse")
        );
        assert!(manager.is_encryption_enabled());

        manager.set_encryption(false, "correct horse");
        assert!(manager.inner.encryption_password().is_none());
    }
}
