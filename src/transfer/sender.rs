use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::core::protocol::{Envelope, MessageBody};
use crate::storage::ProgressCallback;
use crate::transfer::manager::ManagerInner;
use crate::transfer::TransferStatus;
use crate::utils::crypto;

/// Fixed chunk size; the last chunk of a file may be shorter.
pub(crate) const CHUNK_SIZE: usize = 1024 * 1024;

/// Pause between chunks. Flow-control compromise, not a correctness
/// requirement.
const CHUNK_PACING_MS: u64 = 10;

pub(crate) fn total_chunks(len: u64) -> u32 {
    len.div_ceil(CHUNK_SIZE as u64) as u32
}

fn chunk_bounds(index: u32, len: usize) -> (usize, usize) {
    let start = index as usize * CHUNK_SIZE;
    (start, (start + CHUNK_SIZE).min(len))
}

/// Stream a file to the peer after the request was accepted. One task per
/// outgoing transfer; it checks the registry before every chunk and stops
/// as soon as the transfer leaves the active states.
pub(crate) fn spawn(
    inner: Arc<ManagerInner>,
    transfer_id: String,
    endpoint: String,
    path: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(inner, transfer_id, endpoint, path).await;
    })
}

async fn run(inner: Arc<ManagerInner>, transfer_id: String, endpoint: String, path: PathBuf) {
    let Some(transfer) = inner.transfer_snapshot(&transfer_id) else {
        return;
    };
    let file_size = transfer.file_size;

    // The first half of the progress range is credited to reading the
    // file, the second half to sending it.
    let progress_inner = inner.clone();
    let progress_id = transfer_id.clone();
    let read_progress: ProgressCallback = Arc::new(move |bytes_done, _total, _name| {
        progress_inner.update_progress(&progress_id, bytes_done / 2);
    });

    let contents = match inner.file_io.read_file(&path, Some(&read_progress)).await {
        Ok(contents) => contents,
        Err(e) => {
            inner.update_status(
                transfer_id.as_str(),
                TransferStatus::Failed,
                Some(&format!("Failed to read file: {}", e)),
            );
            return;
        }
    };

    let payload = match inner.encryption_password() {
        Some(password) => match crypto::encrypt(&contents, &password) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                inner.update_status(
                    transfer_id.as_str(),
                    TransferStatus::Failed,
                    Some(&format!("Encryption failed: {}", e)),
                );
                return;
            }
        },
        None => contents,
    };

    let chunk_count = total_chunks(payload.len() as u64);
    debug!(
        "Streaming {} in {} chunk(s) to {}",
        transfer.file_name, chunk_count, endpoint
    );

    for index in 0..chunk_count {
        match inner.transfer_status(&transfer_id) {
            Some(status) if !status.is_terminal() => {}
            _ => {
                debug!("Transfer {} no longer active; stopping stream", transfer_id);
                return;
            }
        }

        let (start, end) = chunk_bounds(index, payload.len());
        let chunk = Envelope::new(
            transfer_id.as_str(),
            MessageBody::FileData {
                chunk_index: index,
                total_chunks: chunk_count,
                data: payload[start..end].to_vec(),
            },
        );

        if inner.send_envelope(&endpoint, &chunk).await < 0 {
            inner.update_status(
                transfer_id.as_str(),
                TransferStatus::Failed,
                Some("Failed to send file data"),
            );
            return;
        }

        let sent = file_size / 2 + (file_size / 2) * (index as u64 + 1) / chunk_count as u64;
        inner.update_progress(&transfer_id, sent);

        sleep(Duration::from_millis(CHUNK_PACING_MS)).await;
    }

    let file_hash = crypto::sha256_file(&path).await.unwrap_or_default();
    let complete = Envelope::new(
        transfer_id.as_str(),
        MessageBody::TransferComplete {
            success: true,
            file_hash,
        },
    );

    if inner.send_envelope(&endpoint, &complete).await < 0 {
        inner.update_status(
            transfer_id.as_str(),
            TransferStatus::Failed,
            Some("Failed to send transfer complete message"),
        );
        return;
    }

    inner.update_progress(&transfer_id, file_size);
    inner.update_status(&transfer_id, TransferStatus::Completed, None);
    info!("Transfer completed: {}", transfer_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_boundaries() {
        assert_eq!(total_chunks(0), 0);
        assert_eq!(total_chunks(1), 1);
        assert_eq!(total_chunks(CHUNK_SIZE as u64), 1);
        assert_eq!(total_chunks(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(total_chunks(10 * CHUNK_SIZE as u64), 10);
    }

    #[test]
    fn last_chunk_may_be_short() {
        let len = CHUNK_SIZE + 1;
        assert_eq!(chunk_bounds(0, len), (0, CHUNK_SIZE));
        assert_eq!(chunk_bounds(1, len), (CHUNK_SIZE, CHUNK_SIZE + 1));
    }

    #[test]
    fn exact_multiple_has_full_chunks() {
        let len = 2 * CHUNK_SIZE;
        assert_eq!(chunk_bounds(1, len), (CHUNK_SIZE, 2 * CHUNK_SIZE));
    }
}
