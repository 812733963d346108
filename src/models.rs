use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Filler names written before real file metadata is known. A stored name
/// may only be overwritten while it is one of these.
pub const PLACEHOLDER_FILENAMES: &[&str] = &["Unknown", "Magnet download", "Torrent download"];

pub const DEFAULT_CLIENT_TYPE: &str = "amule";

/// Sizes below this are treated as placeholders reported before the daemon
/// has full metadata.
pub const MIN_TRUSTED_SIZE: i64 = 1024;

pub fn is_placeholder_filename(name: &str) -> bool {
    PLACEHOLDER_FILENAMES.contains(&name)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Missing,
    Deleted,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Missing => "missing",
            DownloadStatus::Deleted => "deleted",
        }
    }

    /// Terminal for automatic transitions; only an explicit delete or
    /// re-add leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Deleted)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "downloading" => Ok(DownloadStatus::Downloading),
            "completed" => Ok(DownloadStatus::Completed),
            "missing" => Ok(DownloadStatus::Missing),
            "deleted" => Ok(DownloadStatus::Deleted),
            other => Err(format!("unknown download status '{}'", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub hash: String,
    pub filename: String,
    pub size: Option<i64>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub deleted_at: Option<String>,
    pub last_seen_at: Option<String>,
    pub status: DownloadStatus,
    pub downloaded: i64,
    pub uploaded: i64,
    pub ratio: f64,
    pub tracker_domain: Option<String>,
    pub client_type: String,
    pub username: Option<String>,
    pub category: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    #[serde(default)]
    pub downloaded: Option<i64>,
    #[serde(default)]
    pub uploaded: Option<i64>,
    #[serde(default)]
    pub ratio: Option<f64>,
    #[serde(default)]
    pub tracker_domain: Option<String>,
}

impl TransferStats {
    pub fn is_empty(&self) -> bool {
        self.downloaded.is_none()
            && self.uploaded.is_none()
            && self.ratio.is_none()
            && self.tracker_domain.is_none()
    }
}

/// Per-hash metadata derived by the poller from a live snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(flatten)]
    pub stats: TransferStats,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub multi_file: bool,
}

impl LiveMetadata {
    /// Joins the download directory with the file name when both are known.
    pub fn resolved_path(&self, fallback_name: &str) -> Option<String> {
        let directory = self.directory.as_deref()?.trim_end_matches(['/', '\\']);
        let name = self.name.as_deref().unwrap_or(fallback_name);
        if directory.is_empty() {
            return Some(name.to_string());
        }
        Some(format!("{}/{}", directory, name))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub filename: Option<String>,
    pub size: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|raw| raw.trim().to_ascii_lowercase()) {
            Some(raw) if raw == "asc" => SortDirection::Asc,
            _ => SortDirection::Desc,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_dir: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub secondary_sort_by: Option<String>,
    #[serde(default)]
    pub secondary_sort_dir: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub entries: Vec<DownloadRecord>,
    pub total: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub downloading: i64,
    pub completed: i64,
    pub missing: i64,
    pub deleted: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.downloading + self.completed + self.missing + self.deleted
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEvent {
    #[serde(rename_all = "camelCase")]
    DownloadAdded {
        hash: String,
        filename: String,
        size: Option<i64>,
        username: Option<String>,
        client_type: String,
        category: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DownloadFinished {
        hash: String,
        filename: String,
        size: Option<i64>,
        client_type: String,
        downloaded: i64,
        uploaded: i64,
        ratio: f64,
        tracker_domain: Option<String>,
        category: Option<String>,
        path: Option<String>,
        multi_file: bool,
    },
}

impl HistoryEvent {
    pub fn hash(&self) -> &str {
        match self {
            HistoryEvent::DownloadAdded { hash, .. } => hash,
            HistoryEvent::DownloadFinished { hash, .. } => hash,
        }
    }
}
