//! HTTP/2 session to a build agent.

use crate::config::{ClientConfig, Endpoint};
use crate::error::{BuildError, Result, TransportCause};
use crate::transport::idle::{ActivityClock, ActivityIo};
use crate::transport::tls::{tls_client_config, ALPN_H2};
use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::{RecvStream, SendStream};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

/// Per-stream receive window (downloads can be large)
const STREAM_WINDOW: u32 = 4 * 1024 * 1024; // 4MB

/// Connection-level receive window, shared by all concurrent downloads
const CONNECTION_WINDOW: u32 = 16 * 1024 * 1024; // 16MB

/// One multiplexed connection to a build agent.
///
/// Streams are opened with [`Session::send`] / [`Session::get`]. The
/// connection is driven by a background task; [`Session::closed`] resolves
/// when it fails, closes or goes idle. [`Session::destroy`] tears everything
/// down and is safe to call any number of times.
pub struct Session {
    authority: String,
    send_request: SendRequest<Bytes>,
    closed_rx: watch::Receiver<Option<TransportCause>>,
    tasks: Vec<JoinHandle<()>>,
    destroyed: AtomicBool,
}

impl Session {
    /// Resolve, connect, negotiate TLS (ALPN h2) and perform the HTTP/2
    /// handshake.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let authority = config.endpoint.authority();
        let tls_config = tls_client_config(&config.trust, &authority)?;

        let server_name = ServerName::try_from(config.endpoint.host.clone())
            .map_err(|e| BuildError::connection(&authority, e))?;

        tracing::debug!("Connecting to build agent {}", authority);
        let tcp = TcpStream::connect(&authority)
            .await
            .map_err(|e| BuildError::connection(&authority, e))?;
        let _ = tcp.set_nodelay(true);

        let connector = TlsConnector::from(Arc::new(tls_config));
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| BuildError::connection(&authority, format!("TLS handshake: {}", e)))?;

        let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        if alpn.as_deref() != Some(ALPN_H2) {
            return Err(BuildError::connection(
                &authority,
                "server did not negotiate HTTP/2 (ALPN h2)",
            ));
        }

        Self::handshake(tls, &config.endpoint, config.idle_timeout).await
    }

    /// HTTP/2 handshake over an already established byte stream.
    pub async fn handshake<T>(
        io: T,
        endpoint: &Endpoint,
        idle_timeout: Option<Duration>,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let authority = endpoint.authority();
        let clock = ActivityClock::new();
        let io = ActivityIo::new(io, clock.clone());

        let (send_request, connection) = h2::client::Builder::new()
            .initial_window_size(STREAM_WINDOW)
            .initial_connection_window_size(CONNECTION_WINDOW)
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| BuildError::connection(&authority, format!("HTTP/2 handshake: {}", e)))?;

        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);

        let mut tasks = Vec::with_capacity(2);

        let driver_tx = closed_tx.clone();
        tasks.push(tokio::spawn(async move {
            let cause = match connection.await {
                Ok(()) => TransportCause::Closed,
                Err(e) => TransportCause::from_h2(&e),
            };
            tracing::debug!("HTTP/2 connection ended: {}", cause);
            record_close(&driver_tx, cause);
        }));

        if let Some(timeout) = idle_timeout {
            let watchdog_tx = closed_tx;
            tasks.push(tokio::spawn(async move {
                clock.expired(timeout).await;
                tracing::debug!("Session idle for {:?}", timeout);
                record_close(&watchdog_tx, TransportCause::IdleTimeout);
            }));
        }

        Ok(Self {
            authority,
            send_request,
            closed_rx,
            tasks,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Open a request stream. With `end_of_stream` false the caller owns the
    /// returned [`SendStream`] and must finish or reset it.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        end_of_stream: bool,
    ) -> Result<(ResponseFuture, SendStream<Bytes>)> {
        if self.is_destroyed() {
            return Err(BuildError::Transport(TransportCause::Closed));
        }

        let mut request = Request::builder()
            .method(method.clone())
            .uri(format!("https://{}{}", self.authority, path))
            .body(())
            .map_err(|e| BuildError::Configuration(format!("invalid request {}: {}", path, e)))?;
        request.headers_mut().extend(headers);

        let mut sender = self.send_request.clone().ready().await?;
        tracing::debug!("Opening stream {} {}", method, path);
        Ok(sender.send_request(request, end_of_stream)?)
    }

    /// Open a bodiless GET stream and wait for the response head.
    pub async fn get(&self, path: &str) -> Result<Response<RecvStream>> {
        let (response, _) = self.send(Method::GET, path, HeaderMap::new(), true).await?;
        Ok(response.await?)
    }

    /// Resolves with a [`BuildError::Transport`] once the connection is gone.
    pub async fn closed(&self) -> BuildError {
        let mut rx = self.closed_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(cause) = current {
                return BuildError::Transport(cause);
            }
            if rx.changed().await.is_err() {
                return BuildError::Transport(TransportCause::Closed);
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Abort the connection and every open stream.
    ///
    /// Returns `true` only for the call that actually tore the session down.
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for task in &self.tasks {
            task.abort();
        }
        tracing::debug!("Session to {} destroyed", self.authority);
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// First cause wins; later ones (e.g. the driver ending after an idle
/// timeout) are ignored.
fn record_close(tx: &watch::Sender<Option<TransportCause>>, cause: TransportCause) {
    tx.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(cause);
            true
        } else {
            false
        }
    });
}

/// `true` when the status is the protocol's success code.
pub fn is_ok(status: StatusCode) -> bool {
    status == StatusCode::OK
}
