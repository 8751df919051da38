//! Composition root for the valet runtime.

pub mod console;
pub mod service;

pub use console::ConsoleChannel;
pub use service::AssistantService;
