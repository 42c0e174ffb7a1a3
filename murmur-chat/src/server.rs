//! Admission controller: listening socket, capacity, online/offline state.
//!
//! Architecture:
//! ```text
//!                  ┌────────────────────────┐
//! connect ───────► │ accept loop            │── full ──► SERVERFULL handshake, close
//!                  │ (sleeps while offline) │
//!                  └───────────┬────────────┘
//!                              │ lowest free slot
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!       ConnectionHandler ConnectionHandler ConnectionHandler
//!              │               │               │
//!              └───────────────┴───────────────┘
//!                              │
//!                          SharedLog
//! ```
//!
//! Going offline appends the shutdown sentinel to the log; handlers find it
//! on their next delivery and close themselves. Going online again replaces
//! that sentinel with a neutral marker and appends "Server Restarted".

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ChatError, Result};
use crate::handler::ConnectionHandler;
use crate::history::SharedLog;
use crate::protocol::{self, SERVER_FULL, SERVER_SHUTDOWN};
use crate::slots::{SlotId, SlotRegistry};

/// Operator-facing notifications.
///
/// Implementations must not block; they are called from the accept loop and
/// from handler teardown.
pub trait ServerObserver: Send + Sync {
    fn on_load_changed(&self, _count: usize) {}
    fn on_status_changed(&self, _online: bool) {}
    /// Fatal listener faults.
    fn on_error(&self, _message: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ServerObserver for NullObserver {}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Chat title, announced once when the server first goes online
    pub title: String,
    /// Maximum concurrent clients
    pub capacity: usize,
    /// Sleep between checks while offline
    pub offline_poll_interval: Duration,
    /// Deadline for every handler read and write
    pub io_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            title: "Chatroom".to_string(),
            capacity: 10,
            offline_poll_interval: Duration::from_millis(500),
            io_timeout: Duration::from_secs(120),
        }
    }
}

impl ServerConfig {
    /// Listen on every interface at `port`.
    pub fn new(port: u16, title: impl Into<String>, capacity: usize) -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{port}"),
            title: title.into(),
            capacity,
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub rejected_full: u64,
    pub active_connections: usize,
    pub capacity: usize,
    pub log_size: usize,
    pub online: bool,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    announced: bool,
    last_shutdown_id: Option<usize>,
    accept_task: Option<JoinHandle<Result<()>>>,
}

struct Inner {
    config: ServerConfig,
    local_addr: SocketAddr,
    log: Arc<SharedLog>,
    slots: Arc<SlotRegistry>,
    observer: Arc<dyn ServerObserver>,
    online: watch::Sender<bool>,
    listener: Mutex<Option<TcpListener>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    cancel: CancellationToken,
    total_connections: AtomicU64,
    rejected_full: AtomicU64,
}

/// The chat server.
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    /// Bind the listening socket. The server starts offline.
    pub async fn bind(config: ServerConfig, observer: Arc<dyn ServerObserver>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            observer.on_error(&format!("Cannot listen on {}: {e}", config.bind_addr));
            ChatError::Listener(e)
        })?;
        let local_addr = listener.local_addr().map_err(ChatError::Listener)?;
        log::info!("Chat server bound to {local_addr} (capacity {})", config.capacity);

        let (online, _) = watch::channel(false);
        let inner = Inner {
            slots: Arc::new(SlotRegistry::new(config.capacity, observer.clone())),
            config,
            local_addr,
            log: Arc::new(SharedLog::new()),
            observer,
            online,
            listener: Mutex::new(Some(listener)),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            cancel: CancellationToken::new(),
            total_connections: AtomicU64::new(0),
            rejected_full: AtomicU64::new(0),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Start the accept loop. It idles until the server goes online.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.lifecycle.lock().await;
        self.start_locked(&mut state)
    }

    fn start_locked(&self, state: &mut Lifecycle) -> Result<()> {
        if state.started {
            return Ok(());
        }
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ChatError::Listener(io::Error::other("listener already consumed")))?;

        let inner = self.inner.clone();
        state.accept_task = Some(tokio::spawn(accept_loop(inner, listener)));
        state.started = true;
        Ok(())
    }

    /// Switch between online and offline. No-op if already in `online`.
    pub async fn set_online(&self, online: bool) -> Result<()> {
        let mut state = self.inner.lifecycle.lock().await;
        if *self.inner.online.borrow() == online {
            return Ok(());
        }

        if online {
            if state.announced {
                self.restart_locked(&state).await?;
            } else {
                self.inner
                    .log
                    .append(protocol::welcome(&self.inner.config.title))
                    .await;
                state.announced = true;
            }
            self.start_locked(&mut state)?;
            self.inner.online.send_replace(true);
            log::info!("Server online at {}", self.inner.local_addr);
        } else {
            let id = self.inner.log.append(SERVER_SHUTDOWN).await;
            state.last_shutdown_id = Some(id);
            self.inner.online.send_replace(false);
            log::info!("Server offline; shutdown notice is message {id}");
        }

        self.inner.observer.on_status_changed(online);
        Ok(())
    }

    /// Come back online after a shutdown.
    ///
    /// Returns `false` when there was no shutdown notice to retire.
    pub async fn restart(&self) -> Result<bool> {
        let state = self.inner.lifecycle.lock().await;
        if !state.announced {
            return Ok(false);
        }
        let restarted = self.restart_locked(&state).await?;
        let was_online = self.inner.online.send_replace(true);
        if !was_online {
            self.inner.observer.on_status_changed(true);
        }
        Ok(restarted)
    }

    async fn restart_locked(&self, state: &Lifecycle) -> Result<bool> {
        let Some(id) = state.last_shutdown_id else {
            return Ok(false);
        };
        let log = &self.inner.log;
        if !log.replace_if(id, SERVER_SHUTDOWN, protocol::SHUTDOWN_MARKER).await? {
            return Ok(false);
        }
        log.append(protocol::RESTARTED).await;
        log::info!("Server restarted; retired shutdown notice {id}");
        Ok(true)
    }

    /// Release `slot` and cancel whatever handler holds it.
    pub fn free_slot(&self, slot: SlotId) -> bool {
        self.inner.slots.free_slot(slot)
    }

    /// Stop accepting and cancel every handler.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.online.send_replace(false);
    }

    /// Wait for the accept loop to end. A listener fault surfaces here.
    pub async fn wait(&self) -> Result<()> {
        let task = self.inner.lifecycle.lock().await.accept_task.take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| ChatError::Listener(io::Error::other(e)))?,
            None => Ok(()),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn log(&self) -> &Arc<SharedLog> {
        &self.inner.log
    }

    pub fn occupied_slots(&self) -> Vec<SlotId> {
        self.inner.slots.occupied_ids()
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            rejected_full: self.inner.rejected_full.load(Ordering::Relaxed),
            active_connections: self.inner.slots.occupied(),
            capacity: self.inner.slots.capacity(),
            log_size: self.inner.log.size().await,
            online: self.is_online(),
        }
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) -> Result<()> {
    let mut online = inner.online.subscribe();
    loop {
        if !*online.borrow_and_update() {
            tokio::select! {
                _ = inner.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(inner.config.offline_poll_interval) => continue,
            }
        }

        let accepted = tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            // Stop accepting as soon as the operator goes offline
            _ = online.changed() => continue,
            res = listener.accept() => res,
        };

        let e = match accepted {
            Ok((stream, peer)) => {
                admit(&inner, stream, peer);
                continue;
            }
            Err(e) => e,
        };

        match AcceptFault::classify(&e) {
            AcceptFault::Connection => {
                log::debug!("Dropped a connection before accept completed: {e}");
            }
            AcceptFault::Exhausted => {
                log::warn!("Accept on {} deferred: {e}", inner.local_addr);
                tokio::select! {
                    _ = inner.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(inner.config.offline_poll_interval) => {}
                }
            }
            AcceptFault::Listener => {
                log::error!("Listener on {} failed: {e}", inner.local_addr);
                inner.observer.on_error(&format!("IO Exception Occurred! {e}"));
                return Err(ChatError::Listener(e));
            }
        }
    }
}

/// How an `accept()` error affects the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFault {
    /// Only the pending connection is lost.
    Connection,
    /// Out of descriptors or buffers; retry after a pause.
    Exhausted,
    /// The listening socket itself is broken.
    Listener,
}

impl AcceptFault {
    fn classify(e: &io::Error) -> Self {
        use io::ErrorKind::*;

        match e.kind() {
            ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted
            | WouldBlock | TimedOut => return Self::Connection,
            OutOfMemory => return Self::Exhausted,
            _ => {}
        }

        #[cfg(unix)]
        {
            let code = e.raw_os_error();
            let exhausted = [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM];
            if code.is_some_and(|c| exhausted.contains(&c)) {
                return Self::Exhausted;
            }
            // Errors the kernel reports for the connection being accepted
            let lost = [libc::EPROTO, libc::ENETDOWN, libc::ENETUNREACH, libc::EHOSTUNREACH];
            if code.is_some_and(|c| lost.contains(&c)) {
                return Self::Connection;
            }
        }

        Self::Listener
    }
}

fn admit(inner: &Arc<Inner>, stream: TcpStream, peer: SocketAddr) {
    inner.total_connections.fetch_add(1, Ordering::Relaxed);

    match inner.slots.try_claim(peer, inner.cancel.child_token()) {
        Some(slot) => {
            log::debug!("Admitted {peer} to slot {}", slot.id());
            let handler = ConnectionHandler::new(
                stream,
                peer,
                inner.log.clone(),
                slot,
                inner.config.io_timeout,
            );
            tokio::spawn(async move {
                let _ = handler.run().await;
            });
        }
        None => {
            inner.rejected_full.fetch_add(1, Ordering::Relaxed);
            log::info!("Rejected {peer}: server full");
            let io_timeout = inner.config.io_timeout;
            tokio::spawn(async move {
                if let Err(e) = reject_full(stream, io_timeout).await {
                    log::debug!("Full-server handshake with {peer} ended early: {e}");
                }
            });
        }
    }
}

/// Read the join line, answer with the full sentinel, wait for the ack.
async fn reject_full(stream: TcpStream, io_timeout: Duration) -> Result<()> {
    let mut lines = protocol::framed(stream);
    tokio::time::timeout(io_timeout, async {
        protocol::recv_line(&mut lines).await?;
        protocol::send_line(&mut lines, SERVER_FULL).await?;
        protocol::recv_line(&mut lines).await?;
        Ok(())
    })
    .await
    .map_err(|_| ChatError::Timeout(io_timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(capacity: usize) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            title: "Test Room".to_string(),
            capacity,
            offline_poll_interval: Duration::from_millis(20),
            io_timeout: Duration::from_secs(5),
        }
    }

    #[derive(Default)]
    struct StatusRecorder {
        changes: AtomicUsize,
    }

    impl ServerObserver for StatusRecorder {
        fn on_status_changed(&self, _online: bool) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.title, "Chatroom");
        assert_eq!(config.capacity, 10);
        assert_eq!(config.offline_poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_accept_fault_classification() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(AcceptFault::classify(&aborted), AcceptFault::Connection);
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(AcceptFault::classify(&reset), AcceptFault::Connection);

        let broken = io::Error::from(io::ErrorKind::InvalidInput);
        assert_eq!(AcceptFault::classify(&broken), AcceptFault::Listener);
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_is_retried() {
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS] {
            let e = io::Error::from_raw_os_error(code);
            assert_eq!(AcceptFault::classify(&e), AcceptFault::Exhausted, "errno {code}");
        }
        let bad_fd = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(AcceptFault::classify(&bad_fd), AcceptFault::Listener);
    }

    #[test]
    fn test_server_config_new() {
        let config = ServerConfig::new(4000, "Lobby", 3);
        assert_eq!(config.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.title, "Lobby");
        assert_eq!(config.capacity, 3);
    }

    #[tokio::test]
    async fn test_server_starts_offline() {
        let server = AdmissionController::bind(test_config(2), Arc::new(NullObserver))
            .await
            .unwrap();
        assert_eq!(server.config().title, "Test Room");
        let stats = server.stats().await;
        assert!(!stats.online);
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.log_size, 0);
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_first_online_appends_welcome() {
        let server = AdmissionController::bind(test_config(2), Arc::new(NullObserver))
            .await
            .unwrap();
        server.set_online(true).await.unwrap();
        assert!(server.is_online());
        assert_eq!(server.log().snapshot().await, vec!["Welcome to Test Room"]);

        // Already online: nothing changes
        server.set_online(true).await.unwrap();
        assert_eq!(server.log().size().await, 1);
    }

    #[tokio::test]
    async fn test_started_offline_still_welcomes() {
        let server = AdmissionController::bind(test_config(2), Arc::new(NullObserver))
            .await
            .unwrap();
        server.start().await.unwrap();
        assert!(!server.is_online());
        assert_eq!(server.log().size().await, 0);

        server.set_online(true).await.unwrap();
        assert_eq!(server.log().snapshot().await, vec!["Welcome to Test Room"]);
    }

    #[tokio::test]
    async fn test_offline_then_online_retires_sentinel() {
        let observer = Arc::new(StatusRecorder::default());
        let server = AdmissionController::bind(test_config(2), observer.clone())
            .await
            .unwrap();
        server.set_online(true).await.unwrap();
        server.set_online(false).await.unwrap();
        assert_eq!(server.log().get(1).await.unwrap(), SERVER_SHUTDOWN);

        server.set_online(true).await.unwrap();
        assert_eq!(
            server.log().snapshot().await,
            vec!["Welcome to Test Room", "Server was shutdown", "Server Restarted"]
        );
        assert_eq!(observer.changes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restart_without_shutdown_is_noop() {
        let server = AdmissionController::bind(test_config(1), Arc::new(NullObserver))
            .await
            .unwrap();
        server.set_online(true).await.unwrap();
        assert!(!server.restart().await.unwrap());
        assert_eq!(server.log().size().await, 1);
    }

    #[tokio::test]
    async fn test_bind_failure_is_listener_error() {
        let first = AdmissionController::bind(test_config(1), Arc::new(NullObserver))
            .await
            .unwrap();
        let taken = ServerConfig {
            bind_addr: first.local_addr().to_string(),
            ..test_config(1)
        };
        let second = AdmissionController::bind(taken, Arc::new(NullObserver)).await;
        assert!(matches!(second, Err(ChatError::Listener(_))));
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let server = AdmissionController::bind(test_config(1), Arc::new(NullObserver))
            .await
            .unwrap();
        server.set_online(true).await.unwrap();
        server.stop();
        tokio::time::timeout(Duration::from_secs(2), server.wait())
            .await
            .expect("accept loop should stop")
            .unwrap();
    }
}
