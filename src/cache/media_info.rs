//! Per-resource metadata persisted next to the media file.
//!
//! The sidecar lives at `<media path>&mimeType` and holds the origin's content
//! information plus the merged list of byte intervals already on disk.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use super::range::{response_content_length, supports_byte_ranges};
use crate::error::Result;

/// Suffix appended to a media file name to form its metadata sidecar.
pub const SIDECAR_SUFFIX: &str = "&mimeType";

/// Inclusive `(start, end)` byte interval.
pub type DataRange = (u64, u64);

/// Content information answered to the player, either live from the origin or
/// replayed from cached metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentInformation {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub is_byte_range_access_supported: bool,
    pub header_fields: HashMap<String, String>,
}

impl ContentInformation {
    /// Build from an origin response head.
    pub fn from_response(status: u16, headers: &HeaderMap) -> Self {
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string());

        let header_fields = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            content_length: response_content_length(status, headers),
            content_type,
            is_byte_range_access_supported: supports_byte_ranges(headers),
            header_fields,
        }
    }

    /// Media type without parameters, lowercased.
    pub fn essence(&self) -> Option<String> {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
    }

    /// Whether the player can be handed this content.
    pub fn is_playable(&self) -> bool {
        self.essence().is_some_and(|ct| ct.starts_with("video/"))
    }
}

/// Sidecar path for a media file.
pub fn sidecar_path(media_path: &Path) -> PathBuf {
    let mut name: OsString = media_path.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    #[serde(with = "content_length")]
    pub expected_content_length: Option<u64>,
    pub supports_byte_range_access: bool,
    pub mime_type: Option<String>,
    #[serde(rename = "loadedDataRangesArr", default)]
    loaded_data_ranges: Vec<DataRange>,
    #[serde(default)]
    pub header_fields: HashMap<String, String>,
    pub save_path: PathBuf,
}

/// Serde helper: `Option<u64>` ↔ integer with `-1` for unknown
mod content_length {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(len) => serializer.serialize_i64(*len as i64),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = i64::deserialize(deserializer)?;
        Ok(u64::try_from(raw).ok())
    }
}

impl MediaInfo {
    pub fn new(save_path: impl Into<PathBuf>, info: &ContentInformation) -> Self {
        Self {
            expected_content_length: info.content_length,
            supports_byte_range_access: info.is_byte_range_access_supported,
            mime_type: info.content_type.clone(),
            loaded_data_ranges: Vec::new(),
            header_fields: info.header_fields.clone(),
            save_path: save_path.into(),
        }
    }

    /// Decode a previously saved sidecar. Stored ranges are re-merged so a hand-edited
    /// or truncated file cannot break the ordering invariant.
    pub fn load(save_path: &Path) -> Result<Self> {
        let raw = fs::read(save_path)?;
        let mut info: MediaInfo = serde_json::from_slice(&raw)?;

        let stored = std::mem::take(&mut info.loaded_data_ranges);
        for range in stored {
            info.add_data_range(range);
        }
        info.save_path = save_path.to_path_buf();
        Ok(info)
    }

    /// Replace the sidecar with the current state.
    pub fn save_to_file(&self) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        let mut tmp = self.save_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.save_path)?;
        Ok(())
    }

    pub fn loaded_data_ranges(&self) -> &[DataRange] {
        &self.loaded_data_ranges
    }

    /// Insert an inclusive interval, merging it with every stored interval it
    /// overlaps or touches.
    pub fn add_data_range(&mut self, range: DataRange) {
        let (mut start, mut end) = if range.0 <= range.1 {
            range
        } else {
            (range.1, range.0)
        };

        let mut merged = Vec::with_capacity(self.loaded_data_ranges.len() + 1);
        let mut inserted = false;

        for &(s, e) in &self.loaded_data_ranges {
            if e.saturating_add(1) < start {
                merged.push((s, e));
            } else if end.saturating_add(1) < s {
                if !inserted {
                    merged.push((start, end));
                    inserted = true;
                }
                merged.push((s, e));
            } else {
                start = start.min(s);
                end = end.max(e);
            }
        }

        if !inserted {
            merged.push((start, end));
        }

        self.loaded_data_ranges = merged;
    }

    /// The stored interval that fully contains `[from, to]`, if any.
    pub fn covering_range(&self, from: u64, to: u64) -> Option<DataRange> {
        self.loaded_data_ranges
            .iter()
            .copied()
            .find(|&(s, e)| s <= from && to <= e)
    }

    /// The stored interval that contains `offset`, if any.
    pub fn range_containing(&self, offset: u64) -> Option<DataRange> {
        self.loaded_data_ranges
            .iter()
            .copied()
            .find(|&(s, e)| s <= offset && offset <= e)
    }

    /// Total bytes known to be on disk.
    pub fn loaded_bytes(&self) -> u64 {
        self.loaded_data_ranges
            .iter()
            .map(|&(s, e)| e - s + 1)
            .sum()
    }
}

impl PartialEq for MediaInfo {
    fn eq(&self, other: &Self) -> bool {
        self.save_path == other.save_path
    }
}

impl Eq for MediaInfo {}
