use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Response};
use serde::{Deserialize, Deserializer, Serialize};
use urlencoding::encode;

use crate::http::ApiClient;

/// Opaque backend identifier. The server emits integers, but anything that
/// arrives as a string is accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Numeric ids order numerically and sort before non-numeric ones.
impl Ord for FileId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for FileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'de> Deserialize<'de> for FileId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(i64),
            Str(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Int(id) => Ok(Self(id.to_string())),
            RawId::Str(id) if id.trim().is_empty() => {
                Err(serde::de::Error::custom("file id must not be empty"))
            }
            RawId::Str(id) => Ok(Self(id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Scanning,
    Clean,
    Infected,
    Error,
    Quarantined,
    Deleted,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scanning => "scanning",
            Self::Clean => "clean",
            Self::Infected => "infected",
            Self::Error => "error",
            Self::Quarantined => "quarantined",
            Self::Deleted => "deleted",
        }
    }

    /// Terminal statuses accept no further status changes from deltas.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Scanning)
    }

    /// Position along `pending -> scanning -> terminal`.
    pub fn stage(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Scanning => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "scanning" => Ok(Self::Scanning),
            "clean" => Ok(Self::Clean),
            "infected" => Ok(Self::Infected),
            "error" => Ok(Self::Error),
            "quarantined" => Ok(Self::Quarantined),
            "deleted" => Ok(Self::Deleted),
            other => Err(anyhow!("unknown scan status '{other}'")),
        }
    }
}

// The single-shot upload endpoint answers with "PENDING", so parsing is
// case-insensitive.
impl<'de> Deserialize<'de> for ScanStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    #[serde(default)]
    pub filename: Option<String>,
    pub scan_status: ScanStatus,
    #[serde(default)]
    pub scan_details: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_quarantined: Option<bool>,
}

impl FileRecord {
    /// Record carrying only an id and a status, as produced by a delta or an
    /// upload receipt.
    pub fn partial(id: FileId, scan_status: ScanStatus) -> Self {
        Self {
            id,
            filename: None,
            scan_status,
            scan_details: None,
            checksum: None,
            filesize: None,
            upload_date: None,
            scan_date: None,
            is_quarantined: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.filename.as_deref().unwrap_or("(unnamed)")
    }
}

/// Response of `POST /upload/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub id: FileId,
    pub filename: String,
    pub status: ScanStatus,
}

impl UploadReceipt {
    pub fn into_record(self) -> FileRecord {
        FileRecord {
            filename: Some(self.filename),
            ..FileRecord::partial(self.id, self.status)
        }
    }
}

pub async fn list_files(client: &ApiClient) -> Result<Vec<FileRecord>> {
    client.get("/files/").await
}

/// Same as [`list_files`], retrying transient failures.
pub async fn list_files_with_retry(client: &ApiClient) -> Result<Vec<FileRecord>> {
    client.get_with_retry("/files/").await
}

pub async fn get_file(client: &ApiClient, id: &FileId) -> Result<FileRecord> {
    let path = format!("/files/{}", encode(id.as_str()));
    client.get_with_retry(&path).await
}

/// Streams the file body from disk instead of buffering it.
pub async fn upload_file(client: &ApiClient, path: &Path) -> Result<UploadReceipt> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("could not open {}", path.display()))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("could not stat {}", path.display()))?
        .len();
    let part = Part::stream_with_length(Body::from(file), len).file_name(logical_name(path));
    let form = Form::new().part("file", part);
    client.post_multipart("/upload/", form).await
}

pub async fn upload_chunk(
    client: &ApiClient,
    index: u64,
    file_name: &str,
    bytes: Vec<u8>,
) -> Result<()> {
    let part = Part::bytes(bytes).file_name(file_name.to_string());
    let form = Form::new()
        .part("file", part)
        .text("chunkIndex", index.to_string())
        .text("fileName", file_name.to_string());
    client.post_multipart_accepted("/upload-chunk", form).await
}

pub async fn download_file(client: &ApiClient, id: &FileId) -> Result<Response> {
    let path = format!("/files/{}/download", encode(id.as_str()));
    client.get_response(&path).await
}

/// Name the backend stores the upload under.
pub fn logical_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
