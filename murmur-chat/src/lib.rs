//! # murmur-chat: Fixed-capacity chat over one shared message log
//!
//! A server holds a single append-only log. Each client polls its own
//! connection handler, which replies with everything logged since that
//! client's last delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   newline text   ┌─────────────────────┐
//! │ ClientSession │ ◄──────────────► │ ConnectionHandler   │──┐
//! │ (per user)    │   "0" / batch    │ (one per slot)      │  │
//! └──────┬────────┘                  └─────────────────────┘  │
//!        │                                                    ▼
//!        ▼                           ┌─────────────────────┐ ┌───────────┐
//! ┌───────────────┐                  │ AdmissionController │ │ SharedLog │
//! │ ChatDisplay   │                  │ (slots, online)     │ │ (history) │
//! └───────────────┘                  └─────────────────────┘ └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`history`]: Append-only shared log
//! - [`slots`]: Bounded slot arena with RAII release
//! - [`protocol`]: Sentinels, requests, delivery batches, line framing
//! - [`handler`]: Per-connection state machine
//! - [`server`]: Admission control and online/offline transitions
//! - [`client`]: Client session loop
//! - [`error`]: Error kinds

pub mod error;
pub mod history;
pub mod slots;
pub mod protocol;
pub mod handler;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use error::{ChatError, Result};
pub use history::SharedLog;
pub use slots::{SlotGuard, SlotId, SlotRegistry, SlotTable};
pub use protocol::{Batch, Request, SERVER_FULL, SERVER_SHUTDOWN};
pub use handler::{CloseReason, ConnectionHandler};
pub use server::{AdmissionController, NullObserver, ServerConfig, ServerObserver, ServerStats};
pub use client::{ChatDisplay, ClientConfig, ClientSession, Outbox, SessionState};
