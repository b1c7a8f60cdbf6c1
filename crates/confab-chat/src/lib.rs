//! confab-chat: Conversation-level streaming
//!
//! This crate runs assistant turns end to end: it feeds provider events
//! into a part accumulator, persists snapshots through a message store,
//! bills the finished turn, and tracks which conversation the UI should
//! show as streaming.

pub mod error;
pub mod status;
pub mod store;
pub mod turn;

pub use error::{Error, Result};
pub use status::{ChatStatus, ChatTarget, StreamingCoordinator, TurnHandle, effective_status};
pub use store::{AppendOutcome, InMemoryMessageStore, MessageStore, StoredMessage};
pub use turn::{TurnConfig, TurnDriver, TurnOutcome, TurnRequest, TurnStatus};
