//! WebSocket channels for real-time push.
//!
//! This module provides:
//! - One account-wide firehose with exponential-backoff reconnect
//! - Reference-counted conversation channels
//! - Pluggable transports (tungstenite for real sockets, in-memory for tests)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 ConnectionManager                   │
//! │      (owns every channel, shared by consumers)      │
//! └─────────────────────────────────────────────────────┘
//!                         │
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!   ┌─────────────┐┌─────────────┐┌─────────────┐
//!   │ChannelWorker││ChannelWorker││ChannelWorker│
//!   │ (firehose)  ││  (conv A)   ││  (conv B)   │
//!   └─────────────┘└─────────────┘└─────────────┘
//!          │              │              │
//!          └──────────────┼──────────────┘
//!                         ▼
//!              ┌─────────────────────┐
//!              │   EventDispatcher   │
//!              └─────────────────────┘
//! ```
//!
//! Workers never touch stores directly; they decode frames and publish them.

mod connection;
mod manager;
mod memory;
mod tungstenite;

pub use connection::{ConnectionState, Connector, Frame, FrameSink, FrameStream, Transport};
pub use manager::{ConnectionManager, ConversationHandle, Credential};
pub use memory::{ConnectAttempt, MemoryConnector, MemoryPeer};
pub use tungstenite::TungsteniteConnector;
