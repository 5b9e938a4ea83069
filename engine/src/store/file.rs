//! Directory-backed storage medium: one file per key.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::medium::{entry_size, MediumError, StorageMedium};

const EXTENSION: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// A medium that keeps each key in its own file under a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves either the old or the new value, never a torn one.
/// Entry sizes are indexed at open time to enforce the byte ceiling without
/// rescanning the directory on every write.
#[derive(Debug)]
pub struct FileMedium {
    dir: PathBuf,
    limit_bytes: usize,
    /// key -> accounted size; also serializes writers
    sizes: Mutex<HashMap<String, usize>>,
}

impl FileMedium {
    /// Open (creating if needed) a medium rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>, limit_bytes: usize) -> Result<Self, MediumError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut sizes = HashMap::new();
        let mut listing = fs::read_dir(&dir).await?;
        while let Some(entry) = listing.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                // Leftover temp file from an interrupted write.
                let _ = fs::remove_file(entry.path()).await;
                continue;
            }
            let Some(stem) = name.strip_suffix(EXTENSION) else {
                continue;
            };
            let Some(key) = decode_key(stem) else {
                tracing::warn!(file = %name, "Skipping file with undecodable key");
                continue;
            };
            let len = entry.metadata().await?.len() as usize;
            sizes.insert(key.clone(), key.len() + len);
        }

        tracing::debug!(dir = %dir.display(), entries = sizes.len(), "Opened file medium");

        Ok(Self {
            dir,
            limit_bytes,
            sizes: Mutex::new(sizes),
        })
    }

    /// Directory this medium lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(key), EXTENSION))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!(".{}{}", encode_key(key), TEMP_SUFFIX))
    }
}

#[async_trait]
impl StorageMedium for FileMedium {
    async fn read(&self, key: &str) -> Result<Option<String>, MediumError> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), MediumError> {
        let mut sizes = self.sizes.lock().await;
        let used: usize = sizes.values().sum();
        let replaced = sizes.get(key).copied().unwrap_or(0);
        let needed = entry_size(key, value);

        if used - replaced + needed > self.limit_bytes {
            return Err(MediumError::QuotaExceeded {
                key: key.to_string(),
                needed,
            });
        }

        let temp = self.temp_path_for(key);
        fs::write(&temp, value.as_bytes()).await?;
        if let Err(e) = fs::rename(&temp, self.path_for(key)).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        sizes.insert(key.to_string(), needed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), MediumError> {
        let mut sizes = self.sizes.lock().await;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        sizes.remove(key);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>, MediumError> {
        let keys: Vec<String> = self.sizes.lock().await.keys().cloned().collect();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.read(&key).await? {
                entries.push((key, value));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

/// Encode a key as a portable file name: `[A-Za-z0-9_-.]` pass through,
/// everything else becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    // A leading dot would collide with temp files.
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
