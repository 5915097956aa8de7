//! On-disk record of completed segments for one source item.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::playlist::{ByteRange, Segment};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Where a stored segment came from and how long it is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub bytes: u64,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_range: Option<ByteRange>,
}

impl ManifestEntry {
    /// True when the entry was written for this exact resource window.
    pub fn describes(&self, segment: &Segment) -> bool {
        self.uri == segment.uri.as_str() && self.byte_range == segment.byte_range
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct ManifestData {
    completed: BTreeMap<u64, ManifestEntry>,
}

/// Completed-segment ledger, rewritten atomically after every completion.
#[derive(Debug)]
pub struct SegmentManifest {
    path: PathBuf,
    data: Mutex<ManifestData>,
}

impl SegmentManifest {
    /// Loads the manifest in `dir`, starting empty when it is missing or unreadable.
    pub async fn load(dir: &Path) -> Self {
        let path = dir.join(MANIFEST_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt segment manifest");
                ManifestData::default()
            }),
            Err(_) => ManifestData::default(),
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub async fn recorded(&self, index: u64) -> Option<ManifestEntry> {
        self.data.lock().await.completed.get(&index).cloned()
    }

    pub async fn len(&self) -> usize {
        self.data.lock().await.completed.len()
    }

    pub async fn record(&self, segment: &Segment, bytes: u64) -> Result<()> {
        let mut data = self.data.lock().await;
        data.completed.insert(
            segment.index,
            ManifestEntry {
                bytes,
                uri: segment.uri.to_string(),
                byte_range: segment.byte_range,
            },
        );
        write_atomic(&self.path, &serde_json::to_vec_pretty(&*data)?).await
    }

    pub async fn forget(&self, index: u64) -> Result<()> {
        let mut data = self.data.lock().await;
        if data.completed.remove(&index).is_some() {
            write_atomic(&self.path, &serde_json::to_vec_pretty(&*data)?).await?;
        }
        Ok(())
    }
}

/// Writes through a sibling `.tmp` file and renames it into place.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
