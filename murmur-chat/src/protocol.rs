//! Line-oriented text protocol spoken between sessions and handlers.
//!
//! Wire format (newline-delimited UTF-8):
//! ```text
//! client → server      server → client
//! ───────────────      ──────────────────────────────
//! "0"                  sentinel line            (exact match)
//! "<handle>: <text>"   or a delivery batch:
//! "QUIT"                 line 1 \n line 2 \n ... \n "\0" \n
//! ```
//!
//! Sentinels and the end-of-batch marker travel in the same namespace as chat
//! text. The handler never logs a line that equals one of them (see
//! [`is_reserved`]), and sessions flatten outgoing text to a single line
//! (see [`single_line`]).

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::{ChatError, Result};

/// Reply to a connection attempt when every slot is taken.
pub const SERVER_FULL: &str = "Server is Full. Please Try Again Later...";
/// Log entry that tells every session the host went offline.
pub const SERVER_SHUTDOWN: &str = "The Server has been Shutdown by the Host.";
/// Last line of every delivery batch.
pub const END_OF_BATCH: &str = "\0";
pub const POLL: &str = "0";
pub const QUIT: &str = "QUIT";
/// Sent by a rejected client before it closes.
pub const ACKNOWLEDGE: &str = "Acknowledge";
/// Replaces the shutdown sentinel once the server is back online.
pub const SHUTDOWN_MARKER: &str = "Server was shutdown";
pub const RESTARTED: &str = "Server Restarted";

/// Upper bound on a single line; longer input is a transport failure.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A line stream over any byte transport.
pub type LineStream<S = TcpStream> = Framed<S, LinesCodec>;

pub fn framed<S>(io: S) -> LineStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

/// Read the next line; end of stream is a transport failure.
pub async fn recv_line<S>(stream: &mut LineStream<S>) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.next().await {
        Some(Ok(line)) => Ok(line),
        Some(Err(e)) => Err(e.into()),
        None => Err(ChatError::closed_by_peer()),
    }
}

/// Write `text` followed by a newline and flush.
///
/// `text` may itself contain newlines; a whole batch goes out in one write.
pub async fn send_line<S>(stream: &mut LineStream<S>, text: impl Into<String>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text: String = text.into();
    stream.send(text).await?;
    Ok(())
}

/// What a handler should do with one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Poll,
    Quit,
    /// Chat text, already prefixed with the sender's handle by the peer.
    Message(String),
}

impl Request {
    pub fn parse(line: String) -> Self {
        match line.as_str() {
            POLL => Self::Poll,
            QUIT => Self::Quit,
            _ => Self::Message(line),
        }
    }
}

/// Whether `text` is byte-identical to a sentinel or the end-of-batch marker.
pub fn is_reserved(text: &str) -> bool {
    text == SERVER_FULL || text == SERVER_SHUTDOWN || text == END_OF_BATCH
}

/// Replace line breaks with spaces so `text` travels as one request.
pub fn single_line(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

pub fn welcome(title: &str) -> String {
    format!("Welcome to {title}")
}

pub fn joined(handle: &str) -> String {
    format!("{handle} joined the chat")
}

pub fn left(handle: &str) -> String {
    format!("{handle} has left")
}

pub fn kicked(handle: &str) -> String {
    format!("{handle} has been kicked")
}

pub fn chat_line(handle: &str, text: &str) -> String {
    format!("{handle}: {text}")
}

/// A sent chat line that asks to leave: exactly `QUIT` or `quit`.
pub fn is_quit_line(handle: &str, line: &str) -> bool {
    line.strip_prefix(handle)
        .and_then(|rest| rest.strip_prefix(": "))
        .is_some_and(|text| text == "QUIT" || text == "quit")
}

/// One delivery: the log suffix a handler owes its client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub lines: Vec<String>,
}

impl Batch {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn contains_shutdown(&self) -> bool {
        self.lines.iter().any(|l| l == SERVER_SHUTDOWN)
    }

    /// Newline-joined lines terminated by the end-of-batch marker.
    pub fn encode(&self) -> String {
        let body: usize = self.lines.iter().map(|l| l.len() + 1).sum();
        let mut out = String::with_capacity(body + END_OF_BATCH.len());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(END_OF_BATCH);
        out
    }
}
