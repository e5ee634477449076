//! In-process fake build agent speaking HTTP/2 over an in-memory pipe.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use h2::server::SendResponse;
use h2::RecvStream;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use rbuild::archive::ProcessStage;
use rbuild::{
    ArtifactRecord, ArtifactSink, BuildRequest, ClientConfig, Endpoint, JobHeaders, ProjectInfo,
    Session, TrustPolicy,
};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// A request as the agent saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// How the agent answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Status plus complete body
    Full(u16, Bytes),
    /// 200, then each chunk as its own DATA frame; the stream is left open
    Events(Vec<String>),
    /// 200, chunks, then end of stream
    EventsThenEnd(Vec<String>),
    /// 200 headers, then the whole connection is dropped
    Disconnect,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Reply::Full(status, Bytes::copy_from_slice(body.as_bytes()))
    }

    pub fn events(events: &[&str]) -> Self {
        Reply::Events(events.iter().map(|e| format!("{}\n", e)).collect())
    }
}

type Handler = Arc<dyn Fn(&Recorded) -> Reply + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct AgentOptions {
    /// Send the upload's response headers as soon as the stream opens and
    /// the body (the handler's payload) only after the upload is drained.
    pub early_upload_headers: bool,
}

#[derive(Clone, Default)]
pub struct AgentLog {
    pub requests: Arc<Mutex<Vec<Recorded>>>,
    /// Open-ended streams the client walked away from
    pub abandoned_streams: Arc<AtomicUsize>,
    pub connection_closed: Arc<AtomicBool>,
    disconnect: Arc<Notify>,
}

impl AgentLog {
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.path)
            .filter(|p| p.starts_with(prefix))
            .collect()
    }

    /// Poll `check` for up to two seconds.
    pub async fn eventually(&self, check: impl Fn(&AgentLog) -> bool) -> bool {
        for _ in 0..200 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(self)
    }
}

/// Start an agent and return a client session connected to it.
pub async fn start_agent<F>(handler: F) -> (Session, AgentLog)
where
    F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
{
    start_agent_with(AgentOptions::default(), handler).await
}

pub async fn start_agent_with<F>(options: AgentOptions, handler: F) -> (Session, AgentLog)
where
    F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
{
    let handler: Handler = Arc::new(handler);
    let log = AgentLog::default();
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);

    let server_log = log.clone();
    tokio::spawn(async move {
        let mut conn = match h2::server::handshake(server_io).await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        loop {
            let accepted = tokio::select! {
                accepted = conn.accept() => accepted,
                _ = server_log.disconnect.notified() => break,
            };
            match accepted {
                Some(Ok((request, respond))) => {
                    let handler = handler.clone();
                    let log = server_log.clone();
                    tokio::spawn(handle(request, respond, handler, log, options));
                }
                _ => break,
            }
        }
        // Dropping the connection closes the pipe under the client
        drop(conn);
        server_log.connection_closed.store(true, Ordering::SeqCst);
    });

    let session = Session::handshake(client_io, &Endpoint::new("localhost", 8443), None)
        .await
        .expect("client handshake");
    (session, log)
}

async fn handle(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    handler: Handler,
    log: AgentLog,
    options: AgentOptions,
) {
    let (parts, mut body) = request.into_parts();

    let mut early_stream = None;
    if options.early_upload_headers && parts.method == Method::POST {
        let response = Response::builder().status(200).body(()).unwrap();
        match respond.send_response(response, false) {
            Ok(stream) => early_stream = Some(stream),
            Err(_) => return,
        }
    }

    let mut collected = BytesMut::new();
    while let Some(Ok(chunk)) = body.data().await {
        let _ = body.flow_control().release_capacity(chunk.len());
        collected.extend_from_slice(&chunk);
    }

    let recorded = Recorded {
        method: parts.method,
        path: parts.uri.path().to_string(),
        headers: parts.headers,
        body: collected.freeze(),
    };
    log.requests.lock().unwrap().push(recorded.clone());

    if let Some(mut stream) = early_stream {
        if let Reply::Full(_, payload) = handler(&recorded) {
            let _ = stream.send_data(payload, true);
        }
        return;
    }

    match handler(&recorded) {
        Reply::Disconnect => {
            let response = Response::builder().status(200).body(()).unwrap();
            let _stream = respond.send_response(response, false);
            tokio::time::sleep(Duration::from_millis(20)).await;
            log.disconnect.notify_one();
        }
        Reply::Full(status, payload) => {
            let response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap())
                .body(())
                .unwrap();
            let end = payload.is_empty();
            if let Ok(mut stream) = respond.send_response(response, end) {
                if !end {
                    let _ = stream.send_data(payload, true);
                }
            }
        }
        Reply::Events(chunks) | Reply::EventsThenEnd(chunks) if chunks.is_empty() => {
            let response = Response::builder().status(200).body(()).unwrap();
            let _ = respond.send_response(response, true);
        }
        reply @ (Reply::Events(_) | Reply::EventsThenEnd(_)) => {
            let (chunks, end) = match reply {
                Reply::Events(chunks) => (chunks, false),
                Reply::EventsThenEnd(chunks) => (chunks, true),
                Reply::Full(..) | Reply::Disconnect => unreachable!(),
            };
            let response = Response::builder().status(200).body(()).unwrap();
            let mut stream = match respond.send_response(response, false) {
                Ok(stream) => stream,
                Err(_) => return,
            };
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                if stream
                    .send_data(Bytes::from(chunk), end && i == last)
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if !end {
                // Hold the stream open until the client resets it or the
                // connection goes away
                let _ = poll_fn(|cx| stream.poll_reset(cx)).await;
                log.abandoned_streams.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// Project tree, info file and output dir in a temp directory.
pub struct Fixture {
    pub tmp: TempDir,
    pub project: PathBuf,
    pub info: PathBuf,
    pub output: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("app");
        fs::create_dir_all(project.join("build")).unwrap();
        fs::create_dir_all(project.join("src")).unwrap();
        fs::write(project.join("package.json"), r#"{"name":"app","version":"1.0.0"}"#)
            .unwrap();
        fs::write(project.join("src/main.js"), "console.log('hi')\n").unwrap();
        fs::write(project.join("build/icon.png"), b"\x89PNG").unwrap();
        let info = tmp.path().join("info.json");
        fs::write(&info, r#"{"metadata":{"name":"app"}}"#).unwrap();
        let output = tmp.path().join("dist");
        Self {
            tmp,
            project,
            info,
            output,
        }
    }

    /// Add an incompressible-size asset so the upload outgrows every flow
    /// control window.
    pub fn with_asset(self, name: &str, len: usize) -> Self {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(self.project.join(name), data).unwrap();
        self
    }

    pub fn request(&self) -> BuildRequest {
        BuildRequest {
            project_dir: self.project.clone(),
            build_resources_dir: self.project.join("build"),
            output_dir: self.output.clone(),
            headers: JobHeaders::new()
                .with("x-build-platform", "linux")
                .with("x-build-target", "AppImage"),
        }
    }

    pub fn project_info(&self) -> FixedInfo {
        FixedInfo(self.info.clone())
    }
}

/// Fast, hermetic client config: `cat` instead of zstd, tiny grace delay.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new(Endpoint::new("localhost", 8443), TrustPolicy::PublicRoots);
    config.grace_delay = Duration::from_millis(10);
    config.idle_timeout = None;
    config.compressor = Some(ProcessStage::new("cat"));
    config
}

pub struct FixedInfo(pub PathBuf);

#[async_trait]
impl ProjectInfo for FixedInfo {
    async fn info_file(&self) -> rbuild::Result<PathBuf> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<ArtifactRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<ArtifactRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactSink for RecordingSink {
    async fn artifact_created(&self, record: ArtifactRecord) -> rbuild::Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
