//! Worker probe - the worker's end of the monitoring channel.
//!
//! Flow:
//! 1. Dial the admin's monitoring address, retrying with [`Backoff`] forever
//! 2. Decode command lines, answer each with a framed [`Reply`]
//! 3. On EOF or any I/O error drop the socket and go back to step 1
//!
//! The probe only stops when its [`ProbeHandle`] is shut down.

pub mod logs;
pub mod metadata;
pub mod stats;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CommandCodec, JsonCodec, WIRE_TARGET};
use crate::bridge::protocol::{Command, LogsReport, ParsedCommand, Reply, UnknownCommandReport};
use crate::version::stamp_versions;

pub use logs::{DEFAULT_LOG_CAPACITY, LogBuffer, LogBufferLayer};
pub use metadata::{MetadataSource, StaticMetadata};
pub use stats::{
    Clock, ManualClock, RequestGuard, RequestHook, RequestInfo, StatsAccumulator, SystemClock,
};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// Initial capacity of the command read buffer.
pub const READ_BUFFER_SIZE: usize = 2048;

/// Delay before the next connection attempt.
pub trait Backoff: Send + Sync {
    /// `attempt` counts failures since the last successful connect, from 0.
    fn next_delay(&self, attempt: u32) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Default for FixedBackoff {
    fn default() -> Self {
        Self(DEFAULT_BACKOFF)
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone)]
pub struct ProbeConfig {
    /// `host:port` of the admin's monitoring listener.
    pub admin_addr: String,
    pub backoff: Arc<dyn Backoff>,
    pub read_buffer_size: usize,
}

impl ProbeConfig {
    pub fn new(admin_addr: impl Into<String>) -> Self {
        Self {
            admin_addr: admin_addr.into(),
            backoff: Arc::new(FixedBackoff::default()),
            read_buffer_size: READ_BUFFER_SIZE,
        }
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

/// Builds the reply for each command from the worker's local state.
pub struct Responder {
    metadata: Arc<dyn MetadataSource>,
    logs: LogBuffer,
    stats: Arc<StatsAccumulator>,
}

impl Responder {
    pub fn new(
        metadata: Arc<dyn MetadataSource>,
        logs: LogBuffer,
        stats: Arc<StatsAccumulator>,
    ) -> Self {
        Self {
            metadata,
            logs,
            stats,
        }
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    pub fn stats(&self) -> &Arc<StatsAccumulator> {
        &self.stats
    }

    pub fn reply_to(&self, command: &ParsedCommand) -> Result<Reply, serde_json::Error> {
        let id = command.correlation();
        match command {
            ParsedCommand::Known(token) => match token.command {
                Command::Metadata => {
                    let mut metadata = self.metadata.snapshot();
                    stamp_versions(&mut metadata.versions);
                    Reply::new(id, &metadata)
                }
                Command::Logs => Reply::new(
                    id,
                    &LogsReport {
                        logs: self.logs.joined(),
                    },
                ),
                Command::Stats => Reply::new(id, &self.stats.report()),
            },
            ParsedCommand::Unknown { text, .. } => {
                tracing::warn!(command = %text, "Unknown monitoring command");
                Reply::new(id, &UnknownCommandReport::new(text.as_str()))
            }
        }
    }
}

pub struct Probe {
    config: ProbeConfig,
    responder: Arc<Responder>,
}

impl Probe {
    pub fn new(config: ProbeConfig, responder: Responder) -> Self {
        Self {
            config,
            responder: Arc::new(responder),
        }
    }

    /// Run the probe on its own task.
    ///
    /// Dropping the handle detaches the task; call [`ProbeHandle::shutdown`]
    /// to stop it.
    pub fn spawn(self) -> ProbeHandle {
        let (state_tx, state_rx) = watch::channel(ProbeState::Disconnected);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(state_tx, shutdown.clone()));
        ProbeHandle {
            state: state_rx,
            shutdown,
            task,
        }
    }

    /// Connect, serve, reconnect until `shutdown` fires.
    pub async fn run(self, state: watch::Sender<ProbeState>, shutdown: CancellationToken) {
        let admin_addr = self.config.admin_addr.clone();
        while let Some(stream) = self.connect_loop(&state, &shutdown).await {
            state.send_replace(ProbeState::Connected);
            tracing::info!(%admin_addr, "Connected to admin");

            match self.serve(stream, &shutdown).await {
                Ok(()) => tracing::info!(%admin_addr, "Monitoring connection closed"),
                Err(e) => tracing::warn!(%admin_addr, error = %e, "Monitoring connection failed"),
            }

            if shutdown.is_cancelled() {
                break;
            }
        }
        state.send_replace(ProbeState::Disconnected);
        tracing::debug!("Probe stopped");
    }

    /// Dial until connected. `None` means shutdown was requested.
    async fn connect_loop(
        &self,
        state: &watch::Sender<ProbeState>,
        shutdown: &CancellationToken,
    ) -> Option<TcpStream> {
        let mut attempt: u32 = 0;
        loop {
            state.send_replace(ProbeState::Connecting);

            let connected = tokio::select! {
                _ = shutdown.cancelled() => return None,
                connected = TcpStream::connect(&self.config.admin_addr) => connected,
            };

            match connected {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    return Some(stream);
                }
                Err(e) => {
                    let delay = self.config.backoff.next_delay(attempt);
                    tracing::debug!(
                        admin_addr = %self.config.admin_addr,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Admin unreachable, retrying"
                    );
                    attempt = attempt.saturating_add(1);

                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Answer commands until the admin goes away.
    async fn serve(&self, stream: TcpStream, shutdown: &CancellationToken) -> io::Result<()> {
        let (reader, writer) = stream.into_split();
        let mut commands =
            FramedRead::with_capacity(reader, CommandCodec::new(), self.config.read_buffer_size);
        let mut writer = FramedWrite::new(writer, JsonCodec::<Reply>::new());

        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = commands.next() => next,
            };
            let Some(command) = command else {
                return Ok(());
            };
            let command = command?;

            tracing::trace!(target: WIRE_TARGET, ?command, "Answering command");
            let reply = self
                .responder
                .reply_to(&command)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writer.send(reply).await?;
        }
    }
}

pub struct ProbeHandle {
    state: watch::Receiver<ProbeState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ProbeHandle {
    pub fn state(&self) -> ProbeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProbeState> {
        self.state.clone()
    }

    /// Stop the probe and wait for its socket to close.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Probe task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::decode_stream;
    use crate::bridge::protocol::{CommandToken, WorkerMetadata};
    use crate::version::{QSA_MONITOR_VERSION, VERSION_KEY};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn responder() -> Responder {
        let metadata = StaticMetadata(WorkerMetadata {
            plugins: vec!["wfsOutputExtension".to_string()],
            versions: BTreeMap::from([("qgis".to_string(), "3.34.4".to_string())]),
            providers: vec!["ogr".to_string()],
            cache: Default::default(),
        });
        Responder::new(
            Arc::new(metadata),
            LogBuffer::default(),
            Arc::new(StatsAccumulator::default()),
        )
    }

    fn known(command: Command, correlation: u64) -> ParsedCommand {
        ParsedCommand::Known(CommandToken::correlated(command, correlation))
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("probe never connected")
            .unwrap();
        stream
    }

    async fn ask(admin: &mut TcpStream, command: Command, correlation: u64) -> Reply {
        admin
            .write_all(&CommandToken::correlated(command, correlation).to_bytes())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), decode_stream(admin))
            .await
            .expect("probe never answered")
            .unwrap()
    }

    #[test]
    fn fixed_backoff_ignores_attempt() {
        let backoff = FixedBackoff::default();
        assert_eq!(backoff.next_delay(0), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(50), Duration::from_secs(3));
    }

    #[test]
    fn config_defaults() {
        let config = ProbeConfig::new("127.0.0.1:7000");
        assert_eq!(config.read_buffer_size, 2048);
        assert_eq!(config.backoff.next_delay(0), DEFAULT_BACKOFF);

        let config = config.with_read_buffer_size(0);
        assert_eq!(config.read_buffer_size, 1);
    }

    #[test]
    fn metadata_reply_includes_probe_version() {
        let reply = responder().reply_to(&known(Command::Metadata, 1)).unwrap();
        assert_eq!(reply.id, Some(1));
        assert_eq!(reply.body["plugins"], json!(["wfsOutputExtension"]));
        assert_eq!(reply.body["versions"]["qgis"], "3.34.4");
        assert_eq!(reply.body["versions"][VERSION_KEY], QSA_MONITOR_VERSION);
    }

    #[test]
    fn logs_reply_joins_buffer() {
        let responder = responder();
        let reply = responder.reply_to(&known(Command::Logs, 2)).unwrap();
        assert_eq!(reply.body, json!({"logs": ""}));

        responder.logs().push("hello");
        responder.logs().push("world");
        let reply = responder.reply_to(&known(Command::Logs, 3)).unwrap();
        assert_eq!(reply.body, json!({"logs": "hello\nworld"}));
    }

    #[test]
    fn stats_reply_reflects_accumulator() {
        let responder = responder();
        let _guard = responder
            .stats()
            .track(RequestInfo::new("WMS", "GetMap"));

        let reply = responder.reply_to(&known(Command::Stats, 4)).unwrap();
        assert_eq!(reply.body["count"], 1);
        assert_eq!(reply.body["service"], "WMS");
        assert!(reply.body["duration"].is_u64());
    }

    #[test]
    fn unknown_command_gets_explicit_reply() {
        let command = ParsedCommand::Unknown {
            text: "reload 9".to_string(),
            correlation: Some(9),
        };
        let reply = responder().reply_to(&command).unwrap();
        insta::assert_json_snapshot!(reply, @r#"
        {
          "id": 9,
          "body": {
            "error": "unknown command",
            "command": "reload 9"
          }
        }
        "#);
    }

    #[tokio::test]
    async fn probe_answers_commands_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responder = responder();
        responder.logs().push("hello");

        let handle = Probe::new(ProbeConfig::new(addr.to_string()), responder).spawn();
        let mut admin = accept(&listener).await;

        let reply = ask(&mut admin, Command::Logs, 11).await;
        assert_eq!(reply.id, Some(11));
        assert_eq!(reply.body, json!({"logs": "hello"}));

        let reply = ask(&mut admin, Command::Stats, 12).await;
        assert_eq!(reply.body, json!({"count": 0}));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bare_token_reply_has_no_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = Probe::new(ProbeConfig::new(addr.to_string()), responder()).spawn();
        let mut admin = accept(&listener).await;

        admin.write_all(b"stats").await.unwrap();
        let reply: Reply = decode_stream(&mut admin).await.unwrap();
        assert_eq!(reply.id, None);
        assert_eq!(reply.body, json!({"count": 0}));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn command_split_across_writes_keeps_correlation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = Probe::new(ProbeConfig::new(addr.to_string()), responder()).spawn();
        let mut admin = accept(&listener).await;

        admin.write_all(b"stats 4").await.unwrap();
        admin.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        admin.write_all(b"2\n").await.unwrap();

        let reply: Reply = tokio::time::timeout(Duration::from_secs(5), decode_stream(&mut admin))
            .await
            .expect("no reply to split command")
            .unwrap();
        assert_eq!(reply.id, Some(42));
        assert_eq!(reply.body, json!({"count": 0}));

        // Nothing else was answered for the two fragments.
        let next = ask(&mut admin, Command::Logs, 43).await;
        assert_eq!(next.id, Some(43));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn probe_reconnects_after_admin_drops_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ProbeConfig::new(addr.to_string())
            .with_backoff(Arc::new(FixedBackoff(Duration::from_millis(10))));
        let handle = Probe::new(config, responder()).spawn();

        let first = accept(&listener).await;
        drop(first);

        let mut second = accept(&listener).await;
        let reply = ask(&mut second, Command::Stats, 1).await;
        assert_eq!(reply.id, Some(1));

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == ProbeState::Connected)
            .await
            .unwrap();

        handle.shutdown().await;
    }

    /// Records every attempt number it is asked about.
    struct RecordingBackoff {
        attempts: StdMutex<Vec<u32>>,
        notify: mpsc::UnboundedSender<u32>,
    }

    impl Backoff for RecordingBackoff {
        fn next_delay(&self, attempt: u32) -> Duration {
            self.attempts.lock().unwrap().push(attempt);
            let _ = self.notify.send(attempt);
            Duration::from_secs(3600)
        }
    }

    async fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_consulted_with_growing_attempts() {
        let addr = unused_addr().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backoff = Arc::new(RecordingBackoff {
            attempts: StdMutex::new(Vec::new()),
            notify: tx,
        });

        let config = ProbeConfig::new(addr).with_backoff(backoff.clone());
        let handle = Probe::new(config, responder()).spawn();

        // Hour-long delays elapse instantly on the paused clock.
        for expected in 0..3 {
            assert_eq!(rx.recv().await, Some(expected));
        }
        assert_eq!(handle.state(), ProbeState::Connecting);

        handle.shutdown().await;
        assert_eq!(&backoff.attempts.lock().unwrap()[..3], &[0, 1, 2]);
    }

    #[tokio::test]
    async fn shutdown_during_backoff_stops_probe() {
        let addr = unused_addr().await;
        let config = ProbeConfig::new(addr)
            .with_backoff(Arc::new(FixedBackoff(Duration::from_secs(3600))));
        let handle = Probe::new(config, responder()).spawn();
        let mut state = handle.subscribe();

        state
            .wait_for(|s| *s == ProbeState::Connecting)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown hung");
        assert_eq!(*state.borrow(), ProbeState::Disconnected);
    }
}
