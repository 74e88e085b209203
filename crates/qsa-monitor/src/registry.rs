//! Connection registry - the admin's set of live worker links.
//!
//! Flow:
//! 1. Bind the monitoring port and spawn the accept loop
//! 2. Each accepted socket gets a fresh [`WorkerId`] and a [`WorkerLink`]
//! 3. Callers resolve identifiers through [`Registry::snapshot`], which is also
//!    where dead links are dropped
//!
//! The link table sits behind one std mutex that is never held across I/O.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::Command;
use crate::link::{DEFAULT_REQUEST_TIMEOUT, LinkInfo, RequestError, WorkerId, WorkerLink};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub listen_addr: String,
    pub request_timeout: Duration,
}

impl RegistryConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to bind monitoring socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Default)]
struct LinkTable {
    links: HashMap<WorkerId, Arc<WorkerLink>>,
    /// Every identifier handed out, so none is reused while the registry lives.
    issued: HashSet<WorkerId>,
}

impl LinkTable {
    fn issue_id(&mut self) -> WorkerId {
        loop {
            let id = WorkerId::generate();
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }
}

type SharedTable = Arc<StdMutex<LinkTable>>;

fn lock_table(table: &StdMutex<LinkTable>) -> MutexGuard<'_, LinkTable> {
    table.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
        tracing::error!("Link table mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

pub struct Registry {
    table: SharedTable,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Bind the monitoring socket and start accepting workers.
    pub async fn start(config: RegistryConfig) -> Result<Self, RegistryError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| RegistryError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| RegistryError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;

        tracing::info!(%local_addr, "Monitoring registry listening");

        let table = SharedTable::default();
        let shutdown = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&table),
            shutdown.clone(),
            config.request_timeout,
        ));

        Ok(Self {
            table,
            local_addr,
            shutdown,
            accept_loop: tokio::sync::Mutex::new(Some(accept_loop)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live links, keyed by identifier.
    ///
    /// Links whose reader task has ended are removed from the registry here
    /// and nowhere else.
    pub fn snapshot(&self) -> HashMap<WorkerId, Arc<WorkerLink>> {
        let mut table = lock_table(&self.table);
        table.links.retain(|id, link| {
            let alive = link.is_alive();
            if !alive {
                tracing::debug!(worker_id = %id, "Reaping dead worker link");
            }
            alive
        });
        table.links.clone()
    }

    pub fn get(&self, id: &WorkerId) -> Option<Arc<WorkerLink>> {
        self.snapshot().remove(id)
    }

    /// Live links ordered by connection time.
    pub fn list(&self) -> Vec<LinkInfo> {
        let mut infos: Vec<LinkInfo> = self.snapshot().values().map(|link| link.info()).collect();
        infos.sort_by(|a, b| {
            a.connected_since
                .cmp(&b.connected_since)
                .then_with(|| a.id.cmp(&b.id))
        });
        infos
    }

    pub async fn request(
        &self,
        id: &WorkerId,
        command: Command,
    ) -> Result<serde_json::Value, RegistryError> {
        let link = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.clone()))?;
        Ok(link.request(command).await?)
    }

    /// Stop accepting, then close every link and wait for its reader task.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.accept_loop.lock().await.take()
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Accept loop task failed");
        }

        let links: Vec<Arc<WorkerLink>> = {
            let mut table = lock_table(&self.table);
            table.links.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            link.close().await;
        }
        tracing::info!("Monitoring registry stopped");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    table: SharedTable,
    shutdown: CancellationToken,
    request_timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let id = lock_table(&table).issue_id();
                let link = WorkerLink::spawn(id.clone(), stream, peer, request_timeout);
                tracing::info!(worker_id = %id, %peer, "Worker connected");
                lock_table(&table).links.insert(id, link);
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept failed, no new workers will be registered");
                break;
            }
        }
    }
    tracing::debug!("Accept loop exiting");
}
