//! Child process and socket helpers shared by servers and the client driver.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Child;
use tokio::time::Instant;

use crate::backoff::ExponentialBackoff;
use crate::error::Result;

/// Output captured from one stream, bounded in size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    /// Retained bytes (at most the configured limit).
    pub bytes: Vec<u8>,
    /// Whether output beyond the limit was discarded.
    pub truncated: bool,
}

impl Captured {
    /// Returns the retained bytes as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Reads `reader` to the end, keeping at most `limit` bytes.
///
/// Excess output is drained and discarded so the writer never blocks on a
/// full pipe.
pub async fn read_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(captured)
}

/// Terminates the process group led by `child`.
///
/// Sends SIGTERM to the group, waits up to `grace`, then SIGKILLs the group.
/// A child that was already reaped is a no-op.
pub async fn terminate_group(child: &mut Child, grace: Duration) -> Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM to process group failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            tracing::debug!(pid, status = ?status.ok(), "process group terminated");
        }
        Err(_) => {
            tracing::warn!(pid, "process group ignored SIGTERM, sending SIGKILL");
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                tracing::debug!(pid, error = %e, "SIGKILL to process group failed");
            }
            child.kill().await?;
        }
    }

    // Stragglers that outlived the leader.
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "no stragglers left in process group");
    }
    Ok(())
}

/// Process groups spawned on behalf of one scenario.
///
/// Every tracked child leads its own group. A group stays registered until its
/// leader is reaped through [`GroupLease::release`]; a lease dropped early
/// (cancelled future, scenario timeout) leaves the group for
/// [`ProcessGroups::terminate_all`] to reclaim.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroups {
    live: Arc<Mutex<BTreeSet<i32>>>,
}

impl ProcessGroups {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the group led by `pid`.
    pub fn register(&self, pid: u32) -> GroupLease {
        let pgid = pid as i32;
        self.lock().insert(pgid);
        GroupLease {
            groups: Some(self.clone()),
            pgid,
        }
    }

    /// Returns the registered group ids.
    pub fn live(&self) -> Vec<i32> {
        self.lock().iter().copied().collect()
    }

    /// Returns true if no group is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Terminates every registered group and clears the registry.
    ///
    /// Sends SIGTERM to each group, waits up to `grace` for all of them to
    /// empty, then SIGKILLs whatever is left. Returns the number of groups
    /// that were signalled.
    pub async fn terminate_all(&self, grace: Duration) -> usize {
        let pgids: Vec<i32> = std::mem::take(&mut *self.lock()).into_iter().collect();
        if pgids.is_empty() {
            return 0;
        }

        let mut signalled = Vec::new();
        for &pgid in &pgids {
            match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
                Ok(()) => signalled.push(pgid),
                Err(Errno::ESRCH) => {}
                Err(e) => tracing::debug!(pgid, error = %e, "SIGTERM to process group failed"),
            }
        }
        if signalled.is_empty() {
            return 0;
        }
        tracing::debug!(groups = ?signalled, "terminating leftover process groups");

        let deadline = Instant::now() + grace;
        let emptied = ExponentialBackoff::default()
            .poll_until(deadline, || {
                let pending = signalled.clone();
                async move { pending.iter().all(|&pgid| !group_exists(pgid)) }
            })
            .await;

        if !emptied {
            for &pgid in &signalled {
                if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                    tracing::debug!(pgid, error = %e, "SIGKILL to process group failed");
                }
            }
            tracing::warn!(groups = ?signalled, "process groups ignored SIGTERM, sent SIGKILL");
        }
        signalled.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<i32>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration of one process group in a [`ProcessGroups`] registry.
#[derive(Debug)]
#[must_use = "release the lease once the group leader has been reaped"]
pub struct GroupLease {
    groups: Option<ProcessGroups>,
    pgid: i32,
}

impl GroupLease {
    /// A lease that tracks nothing.
    pub fn untracked() -> Self {
        Self {
            groups: None,
            pgid: 0,
        }
    }

    /// Unregisters the group after its leader exited normally.
    pub fn release(self) {
        if let Some(groups) = &self.groups {
            groups.lock().remove(&self.pgid);
        }
    }
}

fn group_exists(pgid: i32) -> bool {
    !matches!(killpg(Pid::from_raw(pgid), None), Err(Errno::ESRCH))
}

/// Asks the OS for a free loopback port and releases it.
///
/// The port may be taken by someone else before it is reused; callers retry.
pub async fn reserve_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Polls `addr` until it accepts a TCP connection or `within` elapses.
pub async fn wait_for_listener(addr: SocketAddr, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    ExponentialBackoff::default()
        .poll_until(deadline, || async move {
            matches!(
                tokio::time::timeout(Duration::from_millis(250), TcpStream::connect(addr)).await,
                Ok(Ok(_))
            )
        })
        .await
}
