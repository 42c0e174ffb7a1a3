//! Client half of the polling protocol.
//!
//! Provides:
//! - Connection and join handshake (full / offline detection)
//! - A session loop that sends pending text or polls, then reads one batch
//! - The leave sequence for `QUIT`/`quit` and for server shutdown
//!
//! Outgoing text reaches the session through an [`Outbox`] channel. The loop
//! waits on that channel or a poll tick, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{ChatError, Result};
use crate::protocol::{
    self, LineStream, ACKNOWLEDGE, END_OF_BATCH, POLL, QUIT, SERVER_FULL, SERVER_SHUTDOWN,
};

/// Presentation collaborator fed by the session.
pub trait ChatDisplay: Send + Sync {
    /// One chat line, in log order.
    fn on_message_received(&self, text: &str);
    /// User-visible problem: full server, shutdown, lost connection.
    fn on_error(&self, text: &str);
    /// Drop whatever the display showed before joining.
    fn clear(&self) {}
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Joined,
    Closed,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Idle time between polls when nothing is being sent
    pub poll_interval: Duration,
    /// Deadline for connecting and for every read and write
    pub io_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// Producer side for text typed by the user.
///
/// Dropping every outbox ends the session with the leave sequence.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbox {
    /// Queue `text`. Returns `false` once the session has ended.
    ///
    /// Line breaks inside `text` are sent as spaces.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum Outgoing {
    Text(String),
    Poll,
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchEnd {
    Complete,
    Shutdown,
}

/// A connected chat client.
pub struct ClientSession {
    handle: String,
    addr: String,
    stream: Option<LineStream>,
    display: Arc<dyn ChatDisplay>,
    config: ClientConfig,
    state: SessionState,
    outgoing_rx: mpsc::UnboundedReceiver<String>,
    outbox: Option<Outbox>,
}

impl ClientSession {
    /// Open a connection to `address:port`.
    pub async fn connect(
        address: &str,
        port: u16,
        handle: impl Into<String>,
        display: Arc<dyn ChatDisplay>,
        config: ClientConfig,
    ) -> Result<Self> {
        let addr = format!("{address}:{port}");
        let connecting = TcpStream::connect((address, port));
        let connected = tokio::time::timeout(config.io_timeout, connecting)
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            });
        let stream = match connected {
            Ok(stream) => stream,
            Err(source) => {
                display.on_error("No Chatroom Found!");
                return Err(ChatError::ConnectionUnavailable { addr, source });
            }
        };
        log::info!("Connected to chatroom at {addr}");

        let (tx, outgoing_rx) = mpsc::unbounded_channel();
        Ok(Self {
            handle: handle.into(),
            addr,
            stream: Some(protocol::framed(stream)),
            display,
            config,
            state: SessionState::Connected,
            outgoing_rx,
            outbox: Some(Outbox { tx }),
        })
    }

    /// Take the outbox (can only be called once).
    pub fn take_outbox(&mut self) -> Option<Outbox> {
        self.outbox.take()
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn server_addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Announce ourselves and read the first delivery.
    ///
    /// Fails with `CapacityExceeded` or `ServerOffline` after completing the
    /// matching goodbye; the session is closed in both cases.
    pub async fn initial_join(&mut self) -> Result<()> {
        let result = self.join().await;
        self.finish(result).await
    }

    async fn join(&mut self) -> Result<()> {
        let notice = protocol::joined(&self.handle);
        self.send(notice).await?;

        let reply = self.recv().await?;
        match reply.as_str() {
            SERVER_FULL => {
                self.display.on_error(SERVER_FULL);
                self.send(ACKNOWLEDGE).await?;
                self.close().await;
                Err(ChatError::CapacityExceeded)
            }
            SERVER_SHUTDOWN => {
                self.leave_after_shutdown().await?;
                Err(ChatError::ServerOffline)
            }
            _ => {
                self.display.clear();
                self.state = SessionState::Joined;
                if reply == END_OF_BATCH {
                    return Ok(());
                }
                self.display.on_message_received(&reply);
                // Drain the rest of the first batch so replies stay in step
                if self.read_batch().await? == BatchEnd::Shutdown {
                    self.leave_after_shutdown().await?;
                    return Err(ChatError::ServerOffline);
                }
                Ok(())
            }
        }
    }

    /// Run the session until the user leaves, the server shuts down, or
    /// the connection fails. Joins first if that has not happened yet.
    pub async fn run(&mut self) -> Result<()> {
        if self.state == SessionState::Connected {
            self.initial_join().await?;
        }
        let result = self.session_loop().await;
        let result = self.finish(result).await;
        self.close().await;
        result
    }

    async fn session_loop(&mut self) -> Result<()> {
        loop {
            let line = match self.next_outgoing().await {
                Outgoing::Text(text) => protocol::chat_line(&self.handle, &text),
                Outgoing::Poll => POLL.to_string(),
                Outgoing::Hangup => protocol::chat_line(&self.handle, QUIT),
            };

            if protocol::is_quit_line(&self.handle, &line) {
                return self.leave().await;
            }

            self.send(line).await?;
            if self.read_batch().await? == BatchEnd::Shutdown {
                self.leave_after_shutdown().await?;
                return Err(ChatError::ServerOffline);
            }
        }
    }

    async fn next_outgoing(&mut self) -> Outgoing {
        loop {
            tokio::select! {
                biased;
                msg = self.outgoing_rx.recv() => match msg {
                    Some(text) if text.is_empty() => continue,
                    Some(text) => return Outgoing::Text(protocol::single_line(&text)),
                    None => return Outgoing::Hangup,
                },
                _ = tokio::time::sleep(self.config.poll_interval) => return Outgoing::Poll,
            }
        }
    }

    /// Forward lines to the display until the end-of-batch marker.
    async fn read_batch(&mut self) -> Result<BatchEnd> {
        loop {
            let line = self.recv().await?;
            match line.as_str() {
                END_OF_BATCH => return Ok(BatchEnd::Complete),
                SERVER_SHUTDOWN => return Ok(BatchEnd::Shutdown),
                _ => self.display.on_message_received(&line),
            }
        }
    }

    /// Departure notice, show the echo, then `QUIT`.
    async fn leave(&mut self) -> Result<()> {
        let notice = protocol::left(&self.handle);
        self.send(notice).await?;
        // Shutdown here changes nothing: we are leaving anyway
        self.read_batch().await?;
        self.send(QUIT).await?;
        self.close().await;
        log::info!("Left chatroom at {}", self.addr);
        Ok(())
    }

    async fn leave_after_shutdown(&mut self) -> Result<()> {
        self.display.on_error(SERVER_SHUTDOWN);
        let notice = protocol::kicked(&self.handle);
        self.send(notice).await?;
        self.send(QUIT).await?;
        self.close().await;
        log::info!("Chatroom at {} shut down", self.addr);
        Ok(())
    }

    /// Surface connection-level failures and close on any error.
    async fn finish(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if e.is_connection_local() {
                log::warn!("Session with {} failed: {e}", self.addr);
                self.display.on_error(&format!("IO Exception Occurred. {e}"));
            }
            self.close().await;
        }
        result
    }

    pub async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let mut io = stream.into_inner();
            let _ = io.shutdown().await;
        }
        self.state = SessionState::Closed;
    }

    fn stream(&mut self) -> Result<&mut LineStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ChatError::TransportFailure("session closed".to_string()))
    }

    async fn send(&mut self, line: impl Into<String>) -> Result<()> {
        let timeout = self.config.io_timeout;
        let stream = self.stream()?;
        tokio::time::timeout(timeout, protocol::send_line(stream, line))
            .await
            .map_err(|_| ChatError::Timeout(timeout))?
    }

    async fn recv(&mut self) -> Result<String> {
        let timeout = self.config.io_timeout;
        let stream = self.stream()?;
        tokio::time::timeout(timeout, protocol::recv_line(stream))
            .await
            .map_err(|_| ChatError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl ChatDisplay for Recorder {
        fn on_message_received(&self, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }

        fn on_error(&self, text: &str) {
            self.errors.lock().unwrap().push(text.to_string());
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            poll_interval: Duration::from_millis(10),
            io_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.io_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let recorder = Arc::new(Recorder::default());
        let result =
            ClientSession::connect("127.0.0.1", port, "alice", recorder.clone(), fast_config())
                .await;
        assert!(matches!(result, Err(ChatError::ConnectionUnavailable { .. })));
        assert_eq!(recorder.errors.lock().unwrap().as_slice(), ["No Chatroom Found!"]);
    }

    #[tokio::test]
    async fn test_full_server_acknowledged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = protocol::framed(stream);
            let join = protocol::recv_line(&mut lines).await.unwrap();
            protocol::send_line(&mut lines, SERVER_FULL).await.unwrap();
            let ack = protocol::recv_line(&mut lines).await.unwrap();
            (join, ack)
        });

        let recorder = Arc::new(Recorder::default());
        let mut session =
            ClientSession::connect("127.0.0.1", port, "alice", recorder.clone(), fast_config())
                .await
                .unwrap();
        let result = session.initial_join().await;
        assert!(matches!(result, Err(ChatError::CapacityExceeded)));
        assert_eq!(session.state(), SessionState::Closed);

        let (join, ack) = server.await.unwrap();
        assert_eq!(join, "alice joined the chat");
        assert_eq!(ack, "Acknowledge");
        assert_eq!(recorder.errors.lock().unwrap().as_slice(), [SERVER_FULL]);
    }

    #[tokio::test]
    async fn test_lost_connection_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = protocol::framed(stream);
            let _ = protocol::recv_line(&mut lines).await;
            // Hang up without answering
        });

        let recorder = Arc::new(Recorder::default());
        let mut session =
            ClientSession::connect("127.0.0.1", port, "alice", recorder.clone(), fast_config())
                .await
                .unwrap();
        let result = session.initial_join().await;
        assert!(matches!(result, Err(ChatError::TransportFailure(_))));
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_take_outbox() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut session = ClientSession::connect(
            "127.0.0.1",
            port,
            "alice",
            Arc::new(Recorder::default()),
            fast_config(),
        )
        .await
        .unwrap();

        // First take should succeed
        let outbox = session.take_outbox();
        assert!(outbox.is_some());
        // Second take should return None
        assert!(session.take_outbox().is_none());
        let outbox = outbox.unwrap();
        assert!(outbox.send("queued"));
        assert!(!outbox.is_closed());
        assert_eq!(session.handle(), "alice");
        assert_eq!(session.server_addr(), format!("127.0.0.1:{port}"));
        assert_eq!(session.state(), SessionState::Connected);

        drop(session);
        assert!(outbox.is_closed());
        assert!(!outbox.send("too late"));
    }

    /// Accept one session, answer its join with `reply`, and collect the
    /// lines it sends until it hangs up.
    async fn answer_join(listener: TcpListener, reply: String) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = protocol::framed(stream);
        let mut received = vec![protocol::recv_line(&mut lines).await.unwrap()];
        protocol::send_line(&mut lines, reply).await.unwrap();
        while let Ok(line) = protocol::recv_line(&mut lines).await {
            received.push(line);
        }
        received
    }

    #[tokio::test]
    async fn test_shutdown_reply_to_join() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(answer_join(listener, SERVER_SHUTDOWN.to_string()));

        let recorder = Arc::new(Recorder::default());
        let mut session =
            ClientSession::connect("127.0.0.1", port, "alice", recorder.clone(), fast_config())
                .await
                .unwrap();
        let result = session.initial_join().await;
        assert!(matches!(result, Err(ChatError::ServerOffline)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(recorder.errors.lock().unwrap().as_slice(), [SERVER_SHUTDOWN]);

        let received = server.await.unwrap();
        assert_eq!(
            received,
            vec!["alice joined the chat", "alice has been kicked", "QUIT"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_inside_first_batch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let first = protocol::Batch::new(vec![
            "Welcome to Lobby".to_string(),
            SERVER_SHUTDOWN.to_string(),
        ]);
        let server = tokio::spawn(answer_join(listener, first.encode()));

        let recorder = Arc::new(Recorder::default());
        let mut session =
            ClientSession::connect("127.0.0.1", port, "alice", recorder.clone(), fast_config())
                .await
                .unwrap();
        let result = session.initial_join().await;
        assert!(matches!(result, Err(ChatError::ServerOffline)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            recorder.messages.lock().unwrap().as_slice(),
            ["Welcome to Lobby"]
        );

        let received = server.await.unwrap();
        assert_eq!(
            received,
            vec!["alice joined the chat", "alice has been kicked", "QUIT"]
        );
    }

    #[tokio::test]
    async fn test_multiline_text_sent_as_one_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = protocol::framed(stream);
            protocol::recv_line(&mut lines).await.unwrap();
            protocol::send_line(&mut lines, END_OF_BATCH).await.unwrap();
            // The queued text is the next request
            let request = protocol::recv_line(&mut lines).await.unwrap();
            protocol::send_line(&mut lines, END_OF_BATCH).await.unwrap();
            let follow_up = protocol::recv_line(&mut lines).await.unwrap();
            (request, follow_up, lines)
        });

        let recorder = Arc::new(Recorder::default());
        let mut session =
            ClientSession::connect("127.0.0.1", port, "alice", recorder.clone(), fast_config())
                .await
                .unwrap();
        let outbox = session.take_outbox().unwrap();
        assert!(outbox.send("line one\nQUIT"));
        let task = tokio::spawn(async move { session.run().await });

        let (request, follow_up, _open) = server.await.unwrap();
        assert_eq!(request, "alice: line one QUIT");
        // Still in step: the next request is an ordinary poll
        assert_eq!(follow_up, POLL);
        assert!(recorder.errors.lock().unwrap().is_empty());
        task.abort();
    }
}
