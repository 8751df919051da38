//! Durable conversation history and duplicate detection for the valet
//! runtime.

pub mod duplicate;
pub mod log;

pub use duplicate::DuplicateDetector;
pub use log::ConversationLog;
