//! Wire protocol of the remote build agent.
//!
//! Three endpoints, all on one HTTP/2 session:
//!
//! ```text
//! POST /v1/upload                  body: zstd(tar(workspace))  -> {"id": "..."}
//! GET  /v1/status/{id}             -> concatenated JSON events
//! GET  /v1/download/{id}/{file}    -> raw artifact bytes
//! ```

use crate::error::{BuildError, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

pub const UPLOAD_PATH: &str = "/v1/upload";
pub const STATUS_PREFIX: &str = "/v1/status";
pub const DOWNLOAD_PREFIX: &str = "/v1/download";

/// Content type of the compressed workspace archive
pub const UPLOAD_CONTENT_TYPE: &str = "application/octet-stream";

/// Everything except RFC 3986 unreserved characters is escaped, so a
/// segment never contains `/`.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Escape one path segment.
pub fn escape_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

/// Inverse of [`escape_segment`].
pub fn unescape_segment(segment: &str) -> Result<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| BuildError::Protocol(format!("invalid UTF-8 in path segment: {}", e)))
}

pub fn status_path(job_id: &str) -> String {
    format!("{}/{}", STATUS_PREFIX, escape_segment(job_id))
}

pub fn download_path(job_id: &str, file: &str) -> String {
    format!(
        "{}/{}/{}",
        DOWNLOAD_PREFIX,
        escape_segment(job_id),
        escape_segment(file)
    )
}

/// Extract the job id from a successful upload response body.
///
/// An empty body is treated as `{}`, which then fails for lack of an id.
pub fn parse_upload_response(body: &[u8]) -> Result<String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(BuildError::Protocol("missing id".to_string()));
    }

    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| BuildError::Protocol(format!("invalid upload response JSON: {}", e)))?;

    match value.get("id") {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(BuildError::Protocol("missing id".to_string())),
    }
}

/// Render a 400 response body for [`BuildError::Validation`].
///
/// JSON payloads are re-serialized compactly; anything else is kept as text.
pub fn validation_payload(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => value.to_string(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

/// One entry of the artifact manifest pushed on the status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    /// Remote file name, relative to the job's output directory
    pub file: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_artifact_name: Option<String>,

    /// Update-info metadata that the caller must rewrite after download
    #[serde(default)]
    pub is_write_update_info: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_info: Option<serde_json::Value>,
}

impl ArtifactDescriptor {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            target: None,
            arch: None,
            safe_artifact_name: None,
            is_write_update_info: false,
            update_info: None,
        }
    }

    /// Small metadata files (update manifests, descriptors) are captured in
    /// memory so the caller can rewrite them.
    pub fn is_metadata(&self) -> bool {
        METADATA_EXTENSIONS
            .iter()
            .any(|ext| self.file.to_ascii_lowercase().ends_with(ext))
    }

    /// Local path below `output_dir`. Absolute names and `..` are rejected.
    pub fn local_path(&self, output_dir: &Path) -> Result<PathBuf> {
        let relative = Path::new(&self.file);
        if self.file.is_empty() || relative.is_absolute() {
            return Err(BuildError::Protocol(format!(
                "invalid artifact file name: {:?}",
                self.file
            )));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(BuildError::Protocol(format!(
                        "artifact file name escapes output directory: {:?}",
                        self.file
                    )))
                }
            }
        }
        Ok(output_dir.join(relative))
    }
}

const METADATA_EXTENSIONS: &[&str] = &[".yml", ".yaml", ".json"];
