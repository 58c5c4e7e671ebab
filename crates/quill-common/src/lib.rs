pub mod chat;
pub mod error;

pub use chat::{ChatTurn, Role, ToolCall, ToolDefinition};
pub use error::{Error, Result};
