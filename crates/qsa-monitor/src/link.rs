//! Admin-side handle on one worker connection.
//!
//! A [`WorkerLink`] owns the accepted socket. Its reader task decodes reply
//! frames for as long as the peer stays connected and hands each one to the
//! caller waiting on the matching correlation id.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Command, CommandToken, Reply};

/// How long `request` waits for a reply by default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Identifier the registry assigns to an accepted worker connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Eight random lowercase hex characters.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(uuid[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("timeout")]
    Timeout,

    #[error("worker disconnected")]
    Disconnected,

    #[error("failed to send command: {0}")]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Body returned to HTTP callers, e.g. `{"error": "timeout"}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

/// Serializable view of a link for instance listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub id: WorkerId,
    pub ip: IpAddr,
    pub port: u16,
    pub connected_since: DateTime<Utc>,
    pub alive: bool,
}

type PendingReplies = DashMap<u64, oneshot::Sender<serde_json::Value>>;

pub struct WorkerLink {
    id: WorkerId,
    peer_addr: SocketAddr,
    connected_since: DateTime<Utc>,
    request_timeout: Duration,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<PendingReplies>,
    next_correlation: AtomicU64,
    last_reply: watch::Receiver<Option<serde_json::Value>>,
    alive: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerLink {
    /// Take ownership of an accepted socket and start its reader task.
    pub fn spawn(
        id: WorkerId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        request_timeout: Duration,
    ) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(worker_id = %id, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();

        let pending = Arc::new(PendingReplies::new());
        let alive = Arc::new(AtomicBool::new(true));
        let (last_tx, last_rx) = watch::channel(None);

        let reader = tokio::spawn(reader_task(
            id.clone(),
            FramedRead::new(read_half, JsonCodec::<Reply>::new()),
            Arc::clone(&pending),
            last_tx,
            Arc::clone(&alive),
        ));

        Arc::new(Self {
            id,
            peer_addr,
            connected_since: Utc::now(),
            request_timeout,
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_correlation: AtomicU64::new(1),
            last_reply: last_rx,
            alive,
            reader: StdMutex::new(Some(reader)),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_since(&self) -> DateTime<Utc> {
        self.connected_since
    }

    /// False once the reader task has stopped, whatever the reason.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.reader_finished()
    }

    fn reader_finished(&self) -> bool {
        match self.reader.lock() {
            Ok(guard) => guard.as_ref().is_none_or(JoinHandle::is_finished),
            Err(_) => true,
        }
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            id: self.id.clone(),
            ip: self.peer_addr.ip(),
            port: self.peer_addr.port(),
            connected_since: self.connected_since,
            alive: self.is_alive(),
        }
    }

    /// Body of the most recently decoded reply, correlated or not.
    pub fn last_reply(&self) -> Option<serde_json::Value> {
        self.last_reply.borrow().clone()
    }

    /// Send `command` and wait for its reply with the link's timeout.
    pub async fn request(&self, command: Command) -> Result<serde_json::Value, RequestError> {
        self.request_with_timeout(command, self.request_timeout)
            .await
    }

    /// Send `command` and wait at most `timeout` for the reply carrying the
    /// same correlation id. A timed-out call leaves the link alive; the late
    /// reply is dropped by the reader task.
    pub async fn request_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<serde_json::Value, RequestError> {
        let deadline = tokio::time::Instant::now() + timeout;

        if !self.is_alive() {
            return Err(RequestError::Disconnected);
        }

        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(correlation, reply_tx);

        // The reader clears the pending map after flipping the flag, so either
        // we see the flag here or our waiter is dropped by that clear.
        if !self.alive.load(Ordering::Acquire) {
            self.pending.remove(&correlation);
            return Err(RequestError::Disconnected);
        }

        let token = CommandToken::correlated(command, correlation);
        tracing::trace!(worker_id = %self.id, %command, correlation, "Sending command");

        match tokio::time::timeout_at(deadline, self.write_token(&token)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.remove(&correlation);
                tracing::warn!(worker_id = %self.id, error = %e, "Failed to send command");
                return Err(RequestError::Io(e));
            }
            Err(_) => {
                self.pending.remove(&correlation);
                return Err(RequestError::Timeout);
            }
        }

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(RequestError::Disconnected),
            Err(_) => {
                self.pending.remove(&correlation);
                tracing::warn!(
                    worker_id = %self.id,
                    %command,
                    correlation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not answer in time"
                );
                Err(RequestError::Timeout)
            }
        }
    }

    async fn write_token(&self, token: &CommandToken) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&token.to_bytes()).await?;
        writer.flush().await
    }

    /// Shut the socket down and stop the reader task.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(worker_id = %self.id, error = %e, "Socket shutdown failed");
            }
        }

        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = reader {
            handle.abort();
            let _ = handle.await;
        }
        self.pending.clear();
    }
}

impl fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLink")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("connected_since", &self.connected_since)
            .field("alive", &self.is_alive())
            .finish()
    }
}

async fn reader_task(
    worker_id: WorkerId,
    mut reader: FramedRead<OwnedReadHalf, JsonCodec<Reply>>,
    pending: Arc<PendingReplies>,
    last_reply: watch::Sender<Option<serde_json::Value>>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match reader.next().await {
            Some(Ok(reply)) => {
                tracing::trace!(%worker_id, correlation = ?reply.id, "Reply decoded");
                last_reply.send_replace(Some(reply.body.clone()));

                match reply.id.and_then(|id| pending.remove(&id)) {
                    Some((_, waiter)) => {
                        if waiter.send(reply.body).is_err() {
                            tracing::debug!(%worker_id, "Requester gone before reply arrived");
                        }
                    }
                    None => {
                        tracing::debug!(
                            %worker_id,
                            correlation = ?reply.id,
                            "Discarding reply with no pending request"
                        );
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(%worker_id, error = %e, "Protocol error on worker link");
                break;
            }
            None => {
                tracing::info!(%worker_id, "Worker disconnected");
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    pending.clear();
}
