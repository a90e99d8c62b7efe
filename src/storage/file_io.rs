use chrono::{DateTime, Local};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::platform::Platform;
use crate::utils::{LanError, Result};

/// Progress callback: (bytes_done, total_bytes, file_name).
pub type ProgressCallback = Arc<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Reads and writes report progress at this granularity.
pub const PROGRESS_CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub last_modified: String,
    pub mime_type: String,
}

/// File operations for the transfer engine: whole-file reads/writes with
/// progress reporting, collision-free download names, metadata lookup.
pub struct FileIo {
    platform: Arc<dyn Platform>,
}

impl FileIo {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    pub async fn file_info(&self, path: &Path) -> Result<FileInfo> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|_| LanError::FileNotFound(path.display().to_string()))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| LanError::Io(format!("no file name in {}", path.display())))?;

        let absolute = fs::canonicalize(path)
            .await
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| path.display().to_string());

        let last_modified = metadata
            .modified()
            .map(|t| {
                DateTime::<Local>::from(t)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default();

        Ok(FileInfo {
            mime_type: detect_mime_type(&name).to_string(),
            name,
            path: absolute,
            size: metadata.len(),
            last_modified,
        })
    }

    /// Read a whole file into memory, reporting progress at 1 MiB
    /// boundaries.
    pub async fn read_file(
        &self,
        path: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<Vec<u8>> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut file = fs::File::open(path)
            .await
            .map_err(|_| LanError::FileNotFound(path.display().to_string()))?;
        let size = file.metadata().await?.len();

        if let Some(cb) = progress {
            cb(0, size, &file_name);
        }

        let mut buffer = vec![0u8; size as usize];
        let mut read_total = 0u64;

        while read_total < size {
            let end = (read_total + PROGRESS_CHUNK_SIZE).min(size) as usize;
            let n = file.read(&mut buffer[read_total as usize..end]).await?;
            if n == 0 {
                return Err(LanError::Io(format!(
                    "unexpected end of file: {}",
                    path.display()
                )));
            }
            read_total += n as u64;

            if let Some(cb) = progress {
                cb(read_total, size, &file_name);
            }
        }

        debug!("File read complete: {} ({} bytes)", path.display(), size);
        Ok(buffer)
    }

    /// Write a buffer to disk, creating parent directories, reporting
    /// progress at 1 MiB boundaries.
    pub async fn write_file(
        &self,
        path: &Path,
        data: &[u8],
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let total = data.len() as u64;

        let mut file = fs::File::create(path).await?;

        if let Some(cb) = progress {
            cb(0, total, &file_name);
        }

        let mut written = 0u64;
        while written < total {
            let end = (written + PROGRESS_CHUNK_SIZE).min(total) as usize;
            file.write_all(&data[written as usize..end]).await?;
            written = end as u64;

            if let Some(cb) = progress {
                cb(written, total, &file_name);
            }
        }

        file.flush().await?;
        debug!("File write complete: {} ({} bytes)", path.display(), total);
        Ok(())
    }

    /// Find a file name that does not collide inside `dir`, by suffixing
    /// `_1`, `_2`, ... before the extension.
    pub fn unique_name(&self, dir: &Path, name: &str) -> String {
        if !dir.join(name).exists() {
            return name.to_string();
        }

        let original = Path::new(name);
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string());
        let extension = original
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut counter = 1;
        loop {
            let candidate = format!("{}_{}{}", stem, counter, extension);
            if !dir.join(&candidate).exists() {
                return candidate;
            }
            counter += 1;
        }
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.platform.default_download_directory()
    }

    pub fn open_file(&self, path: &Path) -> bool {
        self.platform.open_file(path)
    }
}

fn detect_mime_type(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NativePlatform;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn file_io() -> FileIo {
        FileIo::new(Arc::new(NativePlatform::new()))
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lanlink_io_{}_{}", tag, std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn read_write_roundtrip_with_progress() {
        let dir = scratch_dir("roundtrip");
        let path = dir.join("nested").join("blob.bin");
        let data: Vec<u8> = (0..3_000_000u32).map(|i| (i % 256) as u8).collect();

        let io = file_io();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let progress: ProgressCallback = Arc::new(move |done, total, _| {
            assert!(done <= total);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        io.write_file(&path, &data, Some(&progress)).await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);

        let back = io.read_file(&path, Some(&progress)).await.unwrap();
        assert_eq!(back, data);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn file_info_reports_metadata() {
        let dir = scratch_dir("info");
        let path = dir.join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let info = file_io().file_info(&path).await.unwrap();
        assert_eq!(info.name, "notes.txt");
        assert_eq!(info.size, 5);
        assert_eq!(info.mime_type, "text/plain");
        assert!(!info.last_modified.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn file_info_on_missing_file_fails() {
        let err = file_io()
            .file_info(Path::new("/nonexistent/nowhere.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, LanError::FileNotFound(_)));
    }

    #[test]
    fn unique_name_suffixes_before_extension() {
        let dir = scratch_dir("unique");
        let io = file_io();

        assert_eq!(io.unique_name(&dir, "hello.txt"), "hello.txt");

        std::fs::write(dir.join("hello.txt"), b"x").unwrap();
        assert_eq!(io.unique_name(&dir, "hello.txt"), "hello_1.txt");

        std::fs::write(dir.join("hello_1.txt"), b"x").unwrap();
        assert_eq!(io.unique_name(&dir, "hello.txt"), "hello_2.txt");

        std::fs::write(dir.join("noext"), b"x").unwrap();
        assert_eq!(io.unique_name(&dir, "noext"), "noext_1");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mime_detection_falls_back_to_octet_stream() {
        assert_eq!(detect_mime_type("a.png"), "image/png");
        assert_eq!(
            detect_mime_type("report.docx"),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(detect_mime_type("clip.avi"), "video/x-msvideo");
        assert_eq!(detect_mime_type("track.ogg"), "audio/ogg");
        assert_eq!(detect_mime_type("a.unknownext"), "application/octet-stream");
        assert_eq!(detect_mime_type("no_extension"), "application/octet-stream");
    }
}
