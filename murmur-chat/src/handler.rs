//! Per-connection request/response state machine.
//!
//! ```text
//!            ┌───────── "0" ─────────► DELIVER ──────┐
//! LISTEN ────┼── "<handle>: text" ──► APPEND+DELIVER ─┼──► LISTEN
//!            └──────── "QUIT" ──────► CLOSE           │
//!                                       ▲             │
//!                                       └─ shutdown ──┘
//! ```
//!
//! The handler never talks to other handlers. Everything it delivers comes
//! from the [`SharedLog`], starting just after its cursor. Every read and
//! write is bounded by the I/O timeout and races the slot's cancellation
//! token; any failure ends the loop and the [`SlotGuard`] frees the slot.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{ChatError, Result};
use crate::history::SharedLog;
use crate::protocol::{self, Batch, LineStream, Request};
use crate::slots::SlotGuard;

/// Why a handler stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `QUIT`.
    Quit,
    /// Client acknowledged the shutdown sentinel.
    Shutdown,
}

/// Outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Continue,
    Shutdown,
}

pub struct ConnectionHandler<S = TcpStream> {
    stream: LineStream<S>,
    peer: SocketAddr,
    log: Arc<SharedLog>,
    slot: SlotGuard,
    /// Last delivered message ID; `None` until the first delivery.
    cursor: Option<usize>,
    io_timeout: Duration,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        io: S,
        peer: SocketAddr,
        log: Arc<SharedLog>,
        slot: SlotGuard,
        io_timeout: Duration,
    ) -> Self {
        Self {
            stream: protocol::framed(io),
            peer,
            log,
            slot,
            cursor: None,
            io_timeout,
        }
    }

    pub fn slot_id(&self) -> usize {
        self.slot.id()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Serve until the client leaves or the connection fails.
    ///
    /// Consumes the handler; the slot is released when this returns.
    pub async fn run(mut self) -> Result<CloseReason> {
        let slot = self.slot.id();
        let connection = self.slot.connection_id();
        log::info!("Client {} connected on slot {slot} ({connection})", self.peer);

        let result = self.serve().await;
        match &result {
            Ok(reason) => {
                log::info!("Client {} left slot {slot}: {reason:?}", self.peer);
            }
            Err(ChatError::Cancelled) => {
                log::info!("Connection on slot {slot} cancelled ({})", self.peer);
            }
            Err(e) => {
                log::warn!("Connection error on slot {slot} from {}: {e}", self.peer);
            }
        }
        result
    }

    async fn serve(&mut self) -> Result<CloseReason> {
        loop {
            let line = self.read_line().await?;
            match Request::parse(line) {
                Request::Poll => {}
                Request::Quit => return Ok(CloseReason::Quit),
                Request::Message(text) => self.append(text).await,
            }

            if self.deliver().await? == Delivery::Shutdown {
                self.await_leave().await?;
                return Ok(CloseReason::Shutdown);
            }
        }
    }

    async fn append(&self, text: String) {
        if protocol::is_reserved(&text) {
            log::warn!(
                "Dropped reserved line from {} on slot {}",
                self.peer,
                self.slot.id()
            );
            return;
        }
        let id = self.log.append(text).await;
        log::trace!("Slot {} appended message {id}", self.slot.id());
    }

    /// Send everything after the cursor, then advance it.
    async fn deliver(&mut self) -> Result<Delivery> {
        let (lines, cursor) = self.log.suffix_after(self.cursor).await;
        let batch = Batch::new(lines);
        let shutdown = batch.contains_shutdown();

        self.write_line(batch.encode()).await?;
        self.cursor = cursor;

        Ok(if shutdown {
            Delivery::Shutdown
        } else {
            Delivery::Continue
        })
    }

    /// After the sentinel, wait for the client's closing `QUIT`.
    ///
    /// The kick notice the client sends first is recorded in the log.
    async fn await_leave(&mut self) -> Result<()> {
        loop {
            let line = self.read_line().await?;
            match Request::parse(line) {
                Request::Quit => return Ok(()),
                Request::Poll => {}
                Request::Message(text) => self.append(text).await,
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let timeout = self.io_timeout;
        let cancel = self.slot.cancel_token().clone();
        guarded(&cancel, timeout, protocol::recv_line(&mut self.stream)).await
    }

    async fn write_line(&mut self, text: String) -> Result<()> {
        let timeout = self.io_timeout;
        let cancel = self.slot.cancel_token().clone();
        guarded(&cancel, timeout, protocol::send_line(&mut self.stream, text)).await
    }
}

/// Run `io` unless it times out or `cancel` fires first.
async fn guarded<T>(
    cancel: &tokio_util::sync::CancellationToken,
    timeout: Duration,
    io: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ChatError::Cancelled),
        res = tokio::time::timeout(timeout, io) => res.map_err(|_| ChatError::Timeout(timeout))?,
    }
}
