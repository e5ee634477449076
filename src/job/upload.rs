//! Upload phase: ship the compressed workspace, receive a job id.

use crate::archive::CompressedArchive;
use crate::error::{BuildError, Result};
use crate::protocol::{parse_upload_response, validation_payload, UPLOAD_CONTENT_TYPE, UPLOAD_PATH};
use crate::transport::{pump_body, read_body, Session};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};

/// Caller-supplied request headers describing the build (platform, targets,
/// ...). Their meaning is opaque to this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobHeaders {
    entries: Vec<(String, String)>,
}

impl JobHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Parse a `name=value` or `name: value` pair.
    pub fn parse_pair(pair: &str) -> Result<(String, String)> {
        let split = pair.split_once('=').or_else(|| pair.split_once(':'));
        match split {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok((name.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(BuildError::Configuration(format!(
                "invalid header '{}' (expected name=value)",
                pair
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.entries.len() + 1);
        for (name, value) in &self.entries {
            let header_name = HeaderName::try_from(name.as_str()).map_err(|e| {
                BuildError::Configuration(format!("invalid header name '{}': {}", name, e))
            })?;
            let header_value = HeaderValue::try_from(value.as_str()).map_err(|e| {
                BuildError::Configuration(format!("invalid value for header '{}': {}", name, e))
            })?;
            map.append(header_name, header_value);
        }
        Ok(map)
    }
}

/// POST the archive and return the server-assigned job id.
///
/// The body is pumped while the response is awaited; a rejection that
/// arrives mid-upload ends the phase without waiting for the archive, and an
/// early 200 keeps the pump running while its body is read.
pub async fn upload(
    session: &Session,
    headers: &JobHeaders,
    mut archive: CompressedArchive,
) -> Result<String> {
    let mut header_map = headers.to_header_map()?;
    header_map.insert(CONTENT_TYPE, HeaderValue::from_static(UPLOAD_CONTENT_TYPE));

    let (response, mut request_body) = session
        .send(Method::POST, UPLOAD_PATH, header_map, false)
        .await?;

    let pump = async {
        let result = async {
            let sent = pump_body(&mut archive, &mut request_body).await?;
            archive.finish().await?;
            request_body.send_data(Bytes::new(), true)?;
            Ok::<u64, BuildError>(sent)
        }
        .await;
        if result.is_err() {
            request_body.send_reset(h2::Reason::CANCEL);
        }
        result
    };

    tokio::pin!(pump);
    tokio::pin!(response);

    let mut pump_done = false;
    let response = tokio::select! {
        biased;
        response = &mut response => response?,
        pumped = &mut pump => {
            pump_done = true;
            match pumped {
                Ok(sent) => {
                    tracing::debug!("Uploaded {} compressed bytes", sent);
                    response.await?
                }
                // A reset stream usually means the server answered early;
                // prefer its status over the bare reset.
                Err(err @ BuildError::Transport(_)) | Err(err @ BuildError::Protocol(_)) => {
                    match response.await {
                        Ok(response) if response.status() != StatusCode::OK => response,
                        _ => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    };

    let status = response.status();
    let mut body = response.into_body();

    if status != StatusCode::OK {
        // The rest of the archive is abandoned; dropping the pump together
        // with the request body resets the stream on return.
        let payload = read_body(&mut body).await?;
        return Err(match status {
            StatusCode::BAD_REQUEST => BuildError::Validation(validation_payload(&payload)),
            other => BuildError::HttpStatus {
                status: other.as_u16(),
                path: UPLOAD_PATH.to_string(),
            },
        });
    }

    // A 200 may arrive as soon as the stream opens, with the id written only
    // once the whole archive has been consumed.
    let payload = if pump_done {
        read_body(&mut body).await?
    } else {
        let (payload, sent) = tokio::try_join!(read_body(&mut body), &mut pump)?;
        tracing::debug!("Uploaded {} compressed bytes", sent);
        payload
    };
    parse_upload_response(&payload)
}
