//! Shared types for the chatsync real-time client: wire protocol decoding,
//! the push event model and the error taxonomy.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
