use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Host-OS facts and actions the engine needs but does not own: naming,
/// download location, interface addresses, opening files.
pub trait Platform: Send + Sync {
    fn name(&self) -> String;

    fn default_download_directory(&self) -> PathBuf;

    fn supports_feature(&self, feature: &str) -> bool;

    fn network_interfaces(&self) -> Vec<String>;

    fn interface_address(&self, interface: &str) -> Option<String>;

    /// Open a file with the default application. Returns false on failure.
    fn open_file(&self, path: &Path) -> bool;
}

pub struct NativePlatform;

impl NativePlatform {
    pub fn new() -> Self {
        Self
    }

    /// Local address used for outbound traffic, learned by "connecting"
    /// a UDP socket (no packets are sent).
    fn outbound_address() -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    }
}

impl Default for NativePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for NativePlatform {
    fn name(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn default_download_directory(&self) -> PathBuf {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from);

        match home {
            Some(dir) => dir.join("Downloads"),
            None => std::env::temp_dir(),
        }
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(feature, "broadcast" | "open-file")
    }

    fn network_interfaces(&self) -> Vec<String> {
        vec!["default".to_string()]
    }

    fn interface_address(&self, interface: &str) -> Option<String> {
        if interface != "default" {
            return None;
        }
        Self::outbound_address()
    }

    fn open_file(&self, path: &Path) -> bool {
        #[cfg(target_os = "macos")]
        let opener = "open";
        #[cfg(target_os = "windows")]
        let opener = "explorer";
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let opener = "xdg-open";

        Command::new(opener)
            .arg(path)
            .spawn()
            .map(|_| true)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_nonempty() {
        assert!(!NativePlatform::new().name().is_empty());
    }

    #[test]
    fn download_directory_is_absolute() {
        assert!(NativePlatform::new().default_download_directory().is_absolute());
    }

    #[test]
    fn unknown_interface_has_no_address() {
        assert!(NativePlatform::new().interface_address("bogus0").is_none());
    }
}
