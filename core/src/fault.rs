//! Fault injection around endpoints and fixture pairs.
//!
//! Faults never touch transport code: they rewrite the endpoint a single
//! invocation uses, put a socket in front of the server, or seed the
//! repositories. Everything a fault creates is owned by its [`FaultGuard`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::builder::Builder;
use crate::error::{Error, Result};
use crate::process::reserve_port;
use crate::transport::http::Listener;
use crate::transport::{AuthPolicy, Endpoint, TransportKind};

/// RFC 5737 TEST-NET-1 address; connections to it hang until timeout.
pub const BLACKHOLE_HOST: &str = "192.0.2.1";

/// User substituted into SSH endpoints under auth rejection.
pub const INVALID_SSH_USER: &str = "harness-invalid-user";

/// Payload of the daemon rejection pkt-line.
const DAEMON_REJECTION: &str = "ERR access denied: authentication required\n";

fn default_conflict_path() -> String {
    "README.md".to_string()
}

/// How an unreachable endpoint fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachableMode {
    /// Nothing listens; connections are refused at once.
    #[default]
    Refused,
    /// Packets go nowhere; connections hang.
    Blackhole,
}

/// Declarative failure applied to one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultSpec {
    Unreachable {
        #[serde(default)]
        mode: UnreachableMode,
    },
    Truncate {
        at_byte: usize,
    },
    AuthReject,
    MergeConflict {
        #[serde(default = "default_conflict_path")]
        path: String,
    },
}

impl FaultSpec {
    /// Returns the kind name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            FaultSpec::Unreachable { .. } => "unreachable",
            FaultSpec::Truncate { .. } => "truncate",
            FaultSpec::AuthReject => "auth_reject",
            FaultSpec::MergeConflict { .. } => "merge_conflict",
        }
    }

    /// Returns true if the fault wraps the endpoint of one invocation.
    pub fn targets_invocation(&self) -> bool {
        !matches!(self, FaultSpec::MergeConflict { .. })
    }

    /// Returns true if the fault can be applied over `kind`.
    pub fn supports(&self, kind: TransportKind) -> bool {
        match self {
            FaultSpec::Truncate { .. } | FaultSpec::AuthReject => kind != TransportKind::File,
            _ => true,
        }
    }
}

/// What a fault is applied to.
#[derive(Debug, Clone, Copy)]
pub enum FaultTarget<'a> {
    /// The endpoint used for a single driver invocation.
    Invocation(&'a Endpoint),
    /// The served repository and the client repository.
    Repositories {
        /// URL the builder clones the server side from.
        origin: &'a str,
        /// Server-side path, when local.
        served: Option<&'a Path>,
        /// Client repository.
        client: &'a Path,
    },
}

/// Owns everything a fault created; reverting (or dropping) releases it.
pub struct FaultGuard {
    fault: &'static str,
    original: Option<Endpoint>,
    endpoint: Option<Endpoint>,
    tasks: Vec<JoinHandle<()>>,
    listeners: Vec<Listener>,
    reverted: bool,
}

impl FaultGuard {
    fn new(fault: &'static str, original: Option<Endpoint>) -> Self {
        Self {
            fault,
            original,
            endpoint: None,
            tasks: Vec::new(),
            listeners: Vec::new(),
            reverted: false,
        }
    }

    /// Returns the faulted endpoint, for invocation faults.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Returns the kind of fault this guard holds.
    pub fn fault(&self) -> &'static str {
        self.fault
    }

    /// Returns whether the guard has been reverted.
    pub fn is_reverted(&self) -> bool {
        self.reverted
    }

    /// Releases every task and socket and returns the original endpoint.
    pub fn revert(&mut self) -> Option<Endpoint> {
        if !self.reverted {
            for task in self.tasks.drain(..) {
                task.abort();
            }
            self.listeners.clear();
            self.endpoint = None;
            self.reverted = true;
            tracing::debug!(fault = self.fault, "fault reverted");
        }
        self.original.clone()
    }
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        self.revert();
    }
}

/// Applies [`FaultSpec`]s.
pub struct FaultInjector {
    builder: Builder,
    scratch: PathBuf,
}

impl FaultInjector {
    /// Creates an injector; `scratch` holds any working copies it needs.
    pub fn new(builder: Builder, scratch: impl Into<PathBuf>) -> Self {
        Self {
            builder,
            scratch: scratch.into(),
        }
    }

    /// Applies `spec` to `target`.
    pub async fn apply(&self, spec: &FaultSpec, target: FaultTarget<'_>) -> Result<FaultGuard> {
        tracing::info!(fault = spec.name(), "applying fault");
        match (spec, target) {
            (FaultSpec::Unreachable { mode }, FaultTarget::Invocation(endpoint)) => {
                endpoint.resolve()?;
                let mut guard = FaultGuard::new(spec.name(), Some(endpoint.clone()));
                guard.endpoint = Some(unreachable(endpoint, *mode).await?);
                Ok(guard)
            }
            (FaultSpec::Truncate { at_byte }, FaultTarget::Invocation(endpoint)) => {
                self.require(spec, endpoint)?;
                let upstream = upstream_addr(endpoint)?;
                let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
                let addr = listener.local_addr()?;

                let mut guard = FaultGuard::new(spec.name(), Some(endpoint.clone()));
                guard.tasks.push(tokio::spawn(truncating_proxy(listener, upstream, *at_byte)));
                guard.endpoint = Some(redirect(endpoint, addr)?);
                Ok(guard)
            }
            (FaultSpec::AuthReject, FaultTarget::Invocation(endpoint)) => {
                self.require(spec, endpoint)?;
                let mut guard = FaultGuard::new(spec.name(), Some(endpoint.clone()));
                match endpoint.kind() {
                    TransportKind::Http => {
                        let listener = Listener::bind(self.scratch.clone(), AuthPolicy::RejectAll).await?;
                        guard.endpoint = Some(redirect(endpoint, listener.addr())?);
                        guard.listeners.push(listener);
                    }
                    TransportKind::Daemon => {
                        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
                        let addr = listener.local_addr()?;
                        guard.tasks.push(tokio::spawn(rejecting_daemon(listener)));
                        guard.endpoint = Some(redirect(endpoint, addr)?);
                    }
                    TransportKind::Ssh => {
                        let mut url = parse_url(endpoint)?;
                        url.set_username(INVALID_SSH_USER)
                            .map_err(|_| Error::Fault(format!("cannot set user on {}", endpoint.url())))?;
                        guard.endpoint = Some(endpoint.with_url(url.to_string()));
                    }
                    TransportKind::File => unreachable_kind(spec)?,
                }
                Ok(guard)
            }
            (
                FaultSpec::MergeConflict { path },
                FaultTarget::Repositories {
                    origin,
                    served,
                    client,
                },
            ) => {
                let scratch = self
                    .scratch
                    .join(format!("conflict-{}", &uuid::Uuid::new_v4().to_string()[..8]));
                self.builder
                    .seed_conflict(origin, served, client, &scratch, path)
                    .await?;
                Ok(FaultGuard::new(spec.name(), None))
            }
            (spec, _) => Err(Error::Fault(format!(
                "{} cannot be applied to this target",
                spec.name()
            ))),
        }
    }

    fn require(&self, spec: &FaultSpec, endpoint: &Endpoint) -> Result<()> {
        endpoint.resolve()?;
        if spec.supports(endpoint.kind()) {
            Ok(())
        } else {
            unreachable_kind(spec)
        }
    }
}

fn unreachable_kind(spec: &FaultSpec) -> Result<()> {
    Err(Error::Fault(format!(
        "{} requires a network transport",
        spec.name()
    )))
}

async fn unreachable(endpoint: &Endpoint, mode: UnreachableMode) -> Result<Endpoint> {
    if endpoint.kind() == TransportKind::File {
        let missing = format!(
            "/nonexistent/harness-{}/{}",
            &uuid::Uuid::new_v4().to_string()[..8],
            endpoint
                .url()
                .rsplit('/')
                .next()
                .unwrap_or("repo.git")
        );
        let url = if endpoint.url().starts_with("file://") {
            format!("file://{}", missing)
        } else {
            missing
        };
        return Ok(endpoint.with_url(url));
    }

    let mut url = parse_url(endpoint)?;
    match mode {
        UnreachableMode::Refused => {
            let port = reserve_port().await?;
            set_host_port(&mut url, "127.0.0.1", port)?;
        }
        UnreachableMode::Blackhole => {
            url.set_host(Some(BLACKHOLE_HOST))
                .map_err(|e| Error::Fault(format!("cannot rewrite host: {}", e)))?;
        }
    }
    Ok(endpoint.with_url(url.to_string()))
}

fn parse_url(endpoint: &Endpoint) -> Result<url::Url> {
    url::Url::parse(endpoint.url())
        .map_err(|e| Error::Fault(format!("cannot parse endpoint {}: {}", endpoint.url(), e)))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "git" => Some(9418),
        "ssh" => Some(22),
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn upstream_addr(endpoint: &Endpoint) -> Result<String> {
    let url = parse_url(endpoint)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Fault(format!("endpoint {} has no host", endpoint.url())))?;
    let port = url
        .port()
        .or_else(|| default_port(url.scheme()))
        .ok_or_else(|| Error::Fault(format!("endpoint {} has no port", endpoint.url())))?;
    Ok(format!("{}:{}", host, port))
}

fn set_host_port(url: &mut url::Url, host: &str, port: u16) -> Result<()> {
    url.set_host(Some(host))
        .map_err(|e| Error::Fault(format!("cannot rewrite host: {}", e)))?;
    url.set_port(Some(port))
        .map_err(|_| Error::Fault("cannot rewrite port".to_string()))
}

fn redirect(endpoint: &Endpoint, addr: SocketAddr) -> Result<Endpoint> {
    let mut url = parse_url(endpoint)?;
    set_host_port(&mut url, &addr.ip().to_string(), addr.port())?;
    Ok(endpoint.with_url(url.to_string()))
}

async fn truncating_proxy(listener: TcpListener, upstream: String, limit: usize) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((client, _)) => {
                    connections.spawn(truncating_pipe(client, upstream.clone(), limit));
                }
                Err(e) => tracing::warn!(error = %e, "proxy accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Forwards one connection until `limit` bytes have crossed it in either
/// direction, then closes both sides.
async fn truncating_pipe(client: TcpStream, upstream: String, limit: usize) {
    let server = match TcpStream::connect(&upstream).await {
        Ok(server) => server,
        Err(e) => {
            tracing::debug!(upstream = %upstream, error = %e, "proxy upstream unreachable");
            return;
        }
    };
    let (mut client_read, mut client_write) = client.into_split();
    let (mut server_read, mut server_write) = server.into_split();

    let mut up = [0u8; 8192];
    let mut down = [0u8; 8192];
    let mut relayed = 0usize;
    let mut uploading = true;
    while relayed < limit {
        let room = limit - relayed;
        tokio::select! {
            read = client_read.read(&mut up), if uploading => match read {
                Ok(0) | Err(_) => {
                    uploading = false;
                    let _ = server_write.shutdown().await;
                }
                Ok(n) => {
                    let take = n.min(room);
                    if server_write.write_all(&up[..take]).await.is_err() {
                        break;
                    }
                    relayed += take;
                }
            },
            read = server_read.read(&mut down) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let take = n.min(room);
                    if client_write.write_all(&down[..take]).await.is_err() {
                        break;
                    }
                    relayed += take;
                }
            },
        }
    }

    tracing::debug!(relayed, limit, "proxy closing connection");
    let _ = client_write.shutdown().await;
    let _ = server_write.shutdown().await;
}

async fn rejecting_daemon(listener: TcpListener) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((mut stream, _)) => {
                    connections.spawn(async move {
                        let mut request = [0u8; 1024];
                        let _ = stream.read(&mut request).await;
                        let _ = stream.write_all(pkt_line(DAEMON_REJECTION).as_bytes()).await;
                        let _ = stream.shutdown().await;
                    });
                }
                Err(e) => tracing::warn!(error = %e, "rejecting listener accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

fn pkt_line(payload: &str) -> String {
    format!("{:04x}{}", payload.len() + 4, payload)
}
