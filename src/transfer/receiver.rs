use log::{debug, error, info, warn};
use std::path::Path;
use tokio::task;

use crate::core::protocol::{Envelope, MessageBody};
use crate::transfer::manager::ManagerInner;
use crate::transfer::{TransferDirection, TransferInfo, TransferStatus};
use crate::utils::{crypto, now_millis, LanError};

/// Ordered chunk slots for one incoming transfer. Each slot is written
/// exactly once, by chunk index; the buffer is dropped as soon as the
/// transfer reaches a terminal state.
pub(crate) struct ReassemblyBuffer {
    slots: Vec<Option<Vec<u8>>>,
    received: u32,
    bytes: u64,
}

impl ReassemblyBuffer {
    pub(crate) fn new(total_chunks: u32) -> Self {
        Self {
            slots: vec![None; total_chunks as usize],
            received: 0,
            bytes: 0,
        }
    }

    pub(crate) fn total_chunks(&self) -> u32 {
        self.slots.len() as u32
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes
    }

    /// Store a chunk. Returns true once every slot is filled. Rejects
    /// out-of-range indices and slots that were already written.
    pub(crate) fn insert(&mut self, index: u32, data: Vec<u8>) -> Result<bool, LanError> {
        let total = self.slots.len();
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| LanError::Parse(format!("chunk index {} out of range 0..{}", index, total)))?;

        if slot.is_some() {
            return Err(LanError::Parse(format!("duplicate chunk index {}", index)));
        }

        self.bytes += data.len() as u64;
        *slot = Some(data);
        self.received += 1;
        Ok(self.received as usize == self.slots.len())
    }

    /// Concatenate all slots in index order. Only valid once complete.
    pub(crate) fn assemble(self) -> Vec<u8> {
        let mut assembled = Vec::with_capacity(self.bytes as usize);
        for slot in self.slots {
            if let Some(chunk) = slot {
                assembled.extend_from_slice(&chunk);
            }
        }
        assembled
    }
}

impl ManagerInner {
    /// Receiver side: a peer wants to send us a file. The download path
    /// is resolved immediately so even a zero-byte transfer has one.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn process_transfer_request(
        &self,
        transfer_id: String,
        sender_id: String,
        sender_name: String,
        file_name: String,
        file_size: u64,
        _file_hash: String,
        endpoint: &str,
    ) {
        if self.transfers.lock().unwrap().contains_key(&transfer_id) {
            warn!("Duplicate transfer request ignored: {}", transfer_id);
            return;
        }

        info!(
            "Transfer request received from {} for file: {} ({} bytes)",
            sender_name, file_name, file_size
        );

        let download_dir = self.download_dir.lock().unwrap().clone();
        let unique = self.file_io.unique_name(&download_dir, &file_name);
        let file_path = download_dir.join(&unique);

        let transfer = TransferInfo {
            id: transfer_id.clone(),
            peer_id: sender_id,
            peer_name: sender_name,
            peer_address: endpoint.to_string(),
            direction: TransferDirection::Incoming,
            status: TransferStatus::Waiting,
            file_path: file_path.display().to_string(),
            file_name,
            file_size,
            bytes_transferred: 0,
            progress: 0.0,
            start_time: now_millis(),
            end_time: 0,
            error_message: String::new(),
        };

        self.transfers
            .lock()
            .unwrap()
            .insert(transfer_id.clone(), transfer.clone());
        self.emit_status(&transfer);

        // The collaborator decides; its callback may block, so it runs on
        // a blocking worker. No callback means accept.
        let callback = self.request_cb.lock().unwrap().clone();
        let accepted = match callback {
            Some(cb) => {
                let snapshot = transfer.clone();
                task::spawn_blocking(move || cb(&snapshot))
                    .await
                    .unwrap_or(false)
            }
            None => true,
        };

        let response = Envelope::new(
            transfer_id.as_str(),
            MessageBody::TransferResponse {
                accepted,
                receiver_id: self.discovery.peer_id().to_string(),
                receiver_name: self.discovery.display_name(),
                file_path: if accepted {
                    transfer.file_path.clone()
                } else {
                    String::new()
                },
            },
        );

        if self.send_envelope(endpoint, &response).await < 0 {
            error!("Failed to send transfer response to {}", endpoint);
            self.update_status(
                transfer_id.as_str(),
                TransferStatus::Failed,
                Some("Failed to send transfer response"),
            );
            return;
        }

        if accepted {
            info!("Transfer accepted: {}", transfer_id);
        } else {
            self.update_status(
                transfer_id.as_str(),
                TransferStatus::Canceled,
                Some("Transfer rejected by user"),
            );
            info!("Transfer rejected: {}", transfer_id);
        }
    }

    pub(crate) async fn process_file_data(
        &self,
        transfer_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: Vec<u8>,
        endpoint: &str,
    ) {
        let Some(transfer) = self.transfer_snapshot(transfer_id) else {
            warn!("File data for unknown transfer: {}", transfer_id);
            return;
        };

        if transfer.direction != TransferDirection::Incoming {
            warn!("File data for outgoing transfer {} ignored", transfer_id);
            return;
        }
        if transfer.status.is_terminal() {
            // Chunks in flight when we canceled or failed; drop them.
            debug!("Dropping late chunk {} for {}", chunk_index, transfer_id);
            return;
        }

        // The first chunk sizes the buffer; with encryption on, the
        // stream is longer than the declared file size, so the sender's
        // chunk count is authoritative.
        let insert_result = {
            let mut buffers = self.reassembly.lock().unwrap();
            let buffer = buffers
                .entry(transfer_id.to_string())
                .or_insert_with(|| ReassemblyBuffer::new(total_chunks));

            if buffer.total_chunks() != total_chunks {
                Err(LanError::Parse(format!(
                    "chunk count mismatch: expected {}, got {}",
                    buffer.total_chunks(),
                    total_chunks
                )))
            } else {
                buffer
                    .insert(chunk_index, data)
                    .map(|complete| (complete, buffer.bytes_received()))
            }
        };

        let (complete, bytes_received) = match insert_result {
            Ok(result) => result,
            Err(e) => {
                self.fail_with_cancel(transfer_id, endpoint, &e.to_string()).await;
                return;
            }
        };

        if transfer.status == TransferStatus::Waiting {
            self.update_status(transfer_id, TransferStatus::InProgress, None);
        }
        self.update_progress(transfer_id, bytes_received);

        if complete {
            self.finalize_incoming(transfer_id, &transfer, endpoint).await;
        }
    }

    /// All chunks are in: decrypt if configured, write to disk, report
    /// completion to the sender.
    async fn finalize_incoming(&self, transfer_id: &str, transfer: &TransferInfo, endpoint: &str) {
        let Some(buffer) = self.reassembly.lock().unwrap().remove(transfer_id) else {
            return;
        };
        let assembled = buffer.assemble();

        let payload = match self.encryption_password() {
            Some(password) => match crypto::decrypt(&assembled, &password) {
                Ok(decrypted) => decrypted,
                Err(e) => {
                    error!("Decryption failed for transfer {}: {}", transfer_id, e);
                    self.update_status(
                        transfer_id,
                        TransferStatus::Failed,
                        Some("Decryption failed: wrong password or corrupted data"),
                    );
                    return;
                }
            },
            None => assembled,
        };

        let path = Path::new(&transfer.file_path);
        if let Err(e) = self.file_io.write_file(path, &payload, None).await {
            self.update_status(
                transfer_id,
                TransferStatus::Failed,
                Some(&format!("Failed to write file: {}", e)),
            );
            return;
        }

        let receipt = Envelope::new(
            transfer_id,
            MessageBody::TransferComplete {
                success: true,
                file_hash: crypto::sha256_hex(&payload),
            },
        );
        if self.send_envelope(endpoint, &receipt).await < 0 {
            warn!("Could not deliver completion receipt for {}", transfer_id);
        }

        self.update_progress(transfer_id, transfer.file_size);
        self.update_status(transfer_id, TransferStatus::Completed, None);
        info!(
            "Transfer completed: {} -> {}",
            transfer_id, transfer.file_path
        );
    }

    pub(crate) async fn process_transfer_complete(
        &self,
        transfer_id: &str,
        success: bool,
        file_hash: &str,
    ) {
        let Some(transfer) = self.transfer_snapshot(transfer_id) else {
            debug!("Completion for unknown transfer: {}", transfer_id);
            return;
        };

        if transfer.direction == TransferDirection::Outgoing {
            debug!("Receiver confirmed transfer {}", transfer_id);
            return;
        }

        if !success && !transfer.status.is_terminal() {
            self.update_status(
                transfer_id,
                TransferStatus::Failed,
                Some("Sender reported failure"),
            );
            self.drop_reassembly(transfer_id);
            return;
        }

        if transfer.file_size == 0 && !transfer.status.is_terminal() {
            // Zero-byte transfers carry no FileData; the sender's
            // completion is the whole stream.
            self.drop_reassembly(transfer_id);

            let path = Path::new(&transfer.file_path);
            if let Err(e) = self.file_io.write_file(path, &[], None).await {
                self.update_status(
                    transfer_id,
                    TransferStatus::Failed,
                    Some(&format!("Failed to write file: {}", e)),
                );
                return;
            }

            let receipt = Envelope::new(
                transfer_id,
                MessageBody::TransferComplete {
                    success: true,
                    file_hash: crypto::sha256_hex(&[]),
                },
            );
            if self.send_envelope(&transfer.peer_address, &receipt).await < 0 {
                warn!("Could not deliver completion receipt for {}", transfer_id);
            }

            self.update_progress(transfer_id, 0);
            self.update_status(transfer_id, TransferStatus::Completed, None);
            return;
        }

        if transfer.status == TransferStatus::Completed && !file_hash.is_empty() {
            match crypto::sha256_file(Path::new(&transfer.file_path)).await {
                Ok(computed) if computed != file_hash => warn!(
                    "File hash mismatch for {}: expected {}, got {}",
                    transfer_id, file_hash, computed
                ),
                Ok(_) => debug!("File hash verified for {}", transfer_id),
                Err(e) => warn!("Could not verify hash for {}: {}", transfer_id, e),
            }
        }
    }

    async fn fail_with_cancel(&self, transfer_id: &str, endpoint: &str, message: &str) {
        error!("Protocol violation on transfer {}: {}", transfer_id, message);
        self.update_status(transfer_id, TransferStatus::Failed, Some(message));
        self.drop_reassembly(transfer_id);

        let cancel = Envelope::new(
            transfer_id,
            MessageBody::TransferCancel {
                reason: message.to_string(),
            },
        );
        let _ = self.send_envelope(endpoint, &cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_fill_exactly_once() {
        let mut buffer = ReassemblyBuffer::new(3);
        assert!(!buffer.insert(0, vec![1]).unwrap());
        assert!(buffer.insert(0, vec![1]).is_err());
        assert!(!buffer.insert(2, vec![3]).unwrap());
        assert!(buffer.insert(1, vec![2]).unwrap());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut buffer = ReassemblyBuffer::new(2);
        assert!(buffer.insert(2, vec![0]).is_err());
        assert!(ReassemblyBuffer::new(0).insert(0, vec![0]).is_err());
    }

    #[test]
    fn assembles_in_index_order() {
        let mut buffer = ReassemblyBuffer::new(3);
        buffer.insert(2, vec![5, 6]).unwrap();
        buffer.insert(0, vec![1, 2]).unwrap();
        buffer.insert(1, vec![3, 4]).unwrap();

        assert_eq!(buffer.bytes_received(), 6);
        assert_eq!(buffer.assemble(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn tracks_received_bytes() {
        let mut buffer = ReassemblyBuffer::new(2);
        buffer.insert(0, vec![0; 100]).unwrap();
        assert_eq!(buffer.bytes_received(), 100);
        buffer.insert(1, vec![0; 50]).unwrap();
        assert_eq!(buffer.bytes_received(), 150);
    }
}
