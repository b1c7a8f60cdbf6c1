//! confab-core: Streaming response assembly
//!
//! This crate turns a provider's server-sent event stream into an ordered
//! list of typed message parts (text, reasoning, tool invocations, sources).

pub mod accumulator;
pub mod error;
pub mod stream;
pub mod types;

pub use accumulator::PartAccumulator;
pub use error::{Error, Result};
pub use stream::{EventStream, StreamEvent, TokenUsage, event_stream, parse_line};
pub use types::*;
