//! Job status event stream.
//!
//! The agent pushes a sequence of JSON objects on `GET /v1/status/{id}`:
//!
//! ```text
//! {"state":"added"}                  progress, stream stays open
//! {"state":"started"}                progress, stream stays open
//! {"error":"..."}                    terminal, job failed
//! {"files":[{"file":"a.zip"}, ...]}  terminal, artifact manifest
//! ```

use crate::error::{BuildError, Result};
use crate::protocol::{status_path, ArtifactDescriptor};
use crate::transport::session::is_ok;
use crate::transport::{release_capacity, Session};
use h2::RecvStream;
use serde_json::Value;

/// One decoded status event.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress { state: String },
    Error { details: Value },
    Manifest { artifacts: Vec<ArtifactDescriptor> },
    /// Anything else; logged and skipped
    Unrecognized(Value),
}

impl JobEvent {
    /// Error and Manifest end the status stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Error { .. } | JobEvent::Manifest { .. })
    }

    /// Human-readable line for progress events.
    pub fn notice(&self) -> Option<String> {
        match self {
            JobEvent::Progress { state } => Some(
                progress_notice(state)
                    .map(str::to_string)
                    .unwrap_or_else(|| state.clone()),
            ),
            _ => None,
        }
    }
}

pub fn progress_notice(state: &str) -> Option<&'static str> {
    match state {
        "added" => Some("Job added to build queue."),
        "started" => Some("Job started."),
        _ => None,
    }
}

/// Classify a decoded object. `error` wins over `state`, which wins over
/// `files`: an object still carrying a state is progress and keeps the
/// stream open.
pub fn classify(value: Value) -> Result<JobEvent> {
    if let Some(details) = value.get("error") {
        return Ok(JobEvent::Error {
            details: details.clone(),
        });
    }

    if let Some(state) = value.get("state") {
        let state = match state {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(JobEvent::Progress { state });
    }

    if let Some(files) = value.get("files") {
        let artifacts: Vec<ArtifactDescriptor> = serde_json::from_value(files.clone())
            .map_err(|e| BuildError::Protocol(format!("invalid artifact manifest: {}", e)))?;
        return Ok(JobEvent::Manifest { artifacts });
    }

    Ok(JobEvent::Unrecognized(value))
}

/// Render an error event's details for [`BuildError::JobFailed`].
pub fn error_message(details: &Value) -> String {
    match details {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Incremental JSON event framing: bytes in, one value out at a time.
pub trait EventDecoder: Send {
    fn feed(&mut self, chunk: &[u8]);

    /// Next complete value, or `None` when more bytes are needed.
    fn next_event(&mut self) -> Result<Option<Value>>;
}

/// Decoder for concatenated or newline-delimited JSON values.
#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    buf: Vec<u8>,
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl EventDecoder for JsonStreamDecoder {
    fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_event(&mut self) -> Result<Option<Value>> {
        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        match stream.next() {
            None => {
                // only whitespace left
                self.buf.clear();
                Ok(None)
            }
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.buf.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(BuildError::Protocol(format!(
                "malformed status event: {}",
                e
            ))),
        }
    }
}

/// Open status stream for one job. Yields events until the first terminal
/// one, then drops the response body so nothing more is read.
pub struct EventStream {
    body: Option<RecvStream>,
    decoder: Box<dyn EventDecoder>,
}

impl EventStream {
    /// `GET /v1/status/{id}`; any status but 200 is an error.
    pub async fn open(
        session: &Session,
        job_id: &str,
        decoder: Box<dyn EventDecoder>,
    ) -> Result<Self> {
        let path = status_path(job_id);
        let response = session.get(&path).await?;
        if !is_ok(response.status()) {
            return Err(BuildError::HttpStatus {
                status: response.status().as_u16(),
                path,
            });
        }
        Ok(Self::from_body(response.into_body(), decoder))
    }

    pub fn from_body(body: RecvStream, decoder: Box<dyn EventDecoder>) -> Self {
        Self {
            body: Some(body),
            decoder,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.body.is_none()
    }

    /// Next event, logging progress and unrecognized ones as they pass.
    /// `Ok(None)` after a terminal event.
    pub async fn next(&mut self) -> Result<Option<JobEvent>> {
        loop {
            let body = match self.body.as_mut() {
                Some(body) => body,
                None => return Ok(None),
            };

            if let Some(value) = self.decoder.next_event()? {
                let event = classify(value)?;
                match &event {
                    JobEvent::Progress { .. } => {
                        if let Some(notice) = event.notice() {
                            tracing::info!("{}", notice);
                        }
                    }
                    JobEvent::Unrecognized(value) => {
                        tracing::warn!("Unknown status event: {}", value);
                    }
                    _ => {}
                }
                if event.is_terminal() {
                    self.body = None;
                }
                return Ok(Some(event));
            }

            let received = body.data().await;
            match received {
                Some(Ok(chunk)) => {
                    release_capacity(body, chunk.len());
                    self.decoder.feed(&chunk);
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    self.body = None;
                    return Err(BuildError::Protocol(
                        "status stream ended without result".to_string(),
                    ));
                }
            }
        }
    }

    /// Drain progress events until the terminal one; returns the manifest or
    /// fails with [`BuildError::JobFailed`].
    pub async fn wait_for_manifest(&mut self) -> Result<Vec<ArtifactDescriptor>> {
        while let Some(event) = self.next().await? {
            match event {
                JobEvent::Manifest { artifacts } => return Ok(artifacts),
                JobEvent::Error { details } => {
                    return Err(BuildError::JobFailed(error_message(&details)))
                }
                JobEvent::Progress { .. } | JobEvent::Unrecognized(_) => {}
            }
        }
        Err(BuildError::Protocol(
            "status stream already finished".to_string(),
        ))
    }
}
