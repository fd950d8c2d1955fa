//! Read-only dumb HTTP transport.
//!
//! An in-process listener serves the files of the bare repositories under the
//! root. Only `GET` and `HEAD` are accepted; push over HTTP would need the
//! smart protocol, which this server does not speak.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use httparse::Status;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{Error, Result};
use crate::git::Git;
use crate::snapshot::Snapshot;

use super::{ensure_running, Endpoint, Liveness, ServeRoot, ServerState, TransportKind, TransportServer};

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Realm sent with 401 responses.
pub const REALM: &str = "harness";

/// Credential check applied to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPolicy {
    /// No credentials required.
    Open,
    /// HTTP basic credentials must match.
    Basic { user: String, password: String },
    /// Every request is rejected with 401.
    RejectAll,
}

impl AuthPolicy {
    /// Returns whether a request carrying `authorization` is let through.
    pub fn permits(&self, authorization: Option<&str>) -> bool {
        match self {
            AuthPolicy::Open => true,
            AuthPolicy::RejectAll => false,
            AuthPolicy::Basic { user, password } => authorization
                .and_then(|h| h.strip_prefix("Basic "))
                .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
                .and_then(|decoded| String::from_utf8(decoded).ok())
                .is_some_and(|pair| pair == format!("{}:{}", user, password)),
        }
    }
}

#[derive(Debug)]
struct Request {
    method: String,
    path: String,
    authorization: Option<String>,
}

struct Context {
    root: PathBuf,
    auth: AuthPolicy,
}

/// A bound listener and its accept task; connections die with it.
pub(crate) struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Listener {
    /// Binds a loopback port and starts serving `root` under `auth`.
    pub(crate) async fn bind(root: PathBuf, auth: AuthPolicy) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let ctx = Arc::new(Context { root, auth });
        let task = tokio::spawn(accept_loop(listener, ctx));
        Ok(Self { addr, task })
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Aborts the accept task and every open connection, releasing the port.
    pub(crate) async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<Context>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&ctx);
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, &ctx).await {
                            tracing::debug!(peer = %peer, error = %e, "http connection failed");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "http accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: &Context) -> Result<()> {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            write_response(&mut stream, 400, &[], e.to_string().as_bytes(), false).await?;
            return Ok(());
        }
    };
    let head_only = request.method == "HEAD";

    if !ctx.auth.permits(request.authorization.as_deref()) {
        tracing::debug!(path = %request.path, "rejecting request without valid credentials");
        let challenge = format!("Basic realm=\"{}\"", REALM);
        return write_response(
            &mut stream,
            401,
            &[("WWW-Authenticate", challenge)],
            b"authentication required\n",
            head_only,
        )
        .await;
    }

    if request.method != "GET" && request.method != "HEAD" {
        return write_response(
            &mut stream,
            405,
            &[("Allow", "GET, HEAD".to_string())],
            b"read-only server\n",
            false,
        )
        .await;
    }

    let Some(relative) = sanitize_path(&request.path) else {
        return write_response(&mut stream, 403, &[], b"forbidden\n", head_only).await;
    };
    let full = ctx.root.join(relative);

    match tokio::fs::metadata(&full).await {
        Ok(meta) if meta.is_file() => {
            let body = tokio::fs::read(&full).await?;
            write_response(&mut stream, 200, &[], &body, head_only).await
        }
        _ => write_response(&mut stream, 404, &[], b"not found\n", head_only).await,
    }
}

/// Maps a request path onto a relative filesystem path.
///
/// Returns `None` for `.`/`..` segments, backslashes and NUL bytes.
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || segment.contains('\\') || segment.contains('\0') {
            return None;
        }
        relative.push(segment);
    }
    Some(relative)
}

async fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    while find_header_terminator(&buffer).is_none() {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(Error::Http("connection closed while reading headers".into()));
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(Error::Http("HTTP headers exceed limit".into()));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(&buffer) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(Error::Http("incomplete HTTP request".into())),
        Err(e) => return Err(Error::Http(format!("failed to parse HTTP request: {}", e))),
    }

    let method = request
        .method
        .ok_or_else(|| Error::Http("HTTP method missing".into()))?
        .to_string();
    let raw_path = request
        .path
        .ok_or_else(|| Error::Http("HTTP path missing".into()))?;
    let path = raw_path.split('?').next().unwrap_or_default().to_string();
    let authorization = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("authorization"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::to_string);

    Ok(Request {
        method,
        path,
        authorization,
    })
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    extra: &[(&str, String)],
    body: &[u8],
    head_only: bool,
) -> Result<()> {
    let mut header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n",
        status,
        status_text(status),
        body.len()
    );
    for (name, value) in extra {
        let _ = write!(header, "{}: {}\r\n", name, value);
    }
    header.push_str("\r\n");

    stream.write_all(header.as_bytes()).await?;
    if !head_only {
        stream.write_all(body).await?;
    }
    stream.flush().await?;
    Ok(())
}

fn find_header_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Unknown",
    }
}

/// Serves the root over dumb HTTP from an in-process listener.
pub struct HttpServer {
    root: ServeRoot,
    auth: AuthPolicy,
    state: ServerState,
    liveness: Liveness,
    listener: Option<Listener>,
    addr: Option<SocketAddr>,
}

impl HttpServer {
    /// Creates a server rooted at `root`.
    pub fn new(root: &Path, git: Git, auth: AuthPolicy) -> Self {
        Self {
            root: ServeRoot::new(root, git),
            auth,
            state: ServerState::Created,
            liveness: Liveness::default(),
            listener: None,
            addr: None,
        }
    }

    /// Returns the bound address while running.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn url_for(&self, path: &str) -> String {
        let addr = self
            .addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "127.0.0.1:0".to_string());
        let plain = format!("http://{}/{}", addr, path);
        let AuthPolicy::Basic { user, password } = &self.auth else {
            return plain;
        };
        match url::Url::parse(&plain) {
            Ok(mut url) => {
                let _ = url.set_username(user);
                let _ = url.set_password(Some(password));
                url.to_string()
            }
            Err(_) => plain,
        }
    }
}

#[async_trait]
impl TransportServer for HttpServer {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn state(&self) -> ServerState {
        self.state
    }

    fn supports_push(&self) -> bool {
        false
    }

    async fn start(&mut self) -> Result<Endpoint> {
        if self.state != ServerState::Running {
            let bound = match self.root.prepare().await {
                Ok(()) => Listener::bind(self.root.root().to_path_buf(), self.auth.clone()).await,
                Err(e) => Err(e),
            };
            let listener = bound.map_err(|e| {
                self.state = ServerState::Failed;
                Error::ServerStart {
                    transport: TransportKind::Http.to_string(),
                    reason: e.to_string(),
                }
            })?;
            tracing::info!(addr = %listener.addr(), root = ?self.root.root(), "http server started");
            self.addr = Some(listener.addr());
            self.listener = Some(listener);
            self.state = ServerState::Running;
            self.liveness.set(true);
        }
        Ok(Endpoint::new(self.url_for(""), self.kind(), self.liveness.clone()))
    }

    async fn stop(&mut self) -> Result<()> {
        self.liveness.set(false);
        if let Some(listener) = self.listener.take() {
            listener.close().await;
            tracing::debug!(addr = ?self.addr, "http server stopped");
        }
        if self.state == ServerState::Running {
            self.state = ServerState::Stopped;
        }
        Ok(())
    }

    async fn serve(&mut self, snapshot: &Snapshot) -> Result<Endpoint> {
        ensure_running(self.kind(), self.state)?;
        self.root.publish(snapshot).await?;
        Ok(self.endpoint_for(&snapshot.name()))
    }

    async fn serve_empty(&mut self, name: &str, head_branch: &str) -> Result<Endpoint> {
        ensure_running(self.kind(), self.state)?;
        self.root.publish_empty(name, head_branch).await?;
        Ok(self.endpoint_for(name))
    }

    fn endpoint_for(&self, name: &str) -> Endpoint {
        Endpoint::new(
            self.url_for(&format!("{}.git", name)),
            self.kind(),
            self.liveness.clone(),
        )
    }

    fn repository_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.root.repo_dir(name))
    }
}
