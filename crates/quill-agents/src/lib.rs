pub mod args;
pub mod classify;
pub mod context;
pub mod fallback;
pub mod keypool;
pub mod notify;
pub mod orchestrator;
pub mod providers;
pub mod tools;
pub mod utility;

pub use keypool::{KeyPool, KeyPoolRegistry, KeyStatus};
pub use notify::{NullNotifier, PipelineNotifier};
pub use orchestrator::{ConversationOrchestrator, ProviderSlot};
pub use providers::{ChatProvider, ChatRequest, EventStream, StreamEvent};
