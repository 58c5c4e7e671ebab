pub mod loader;
pub mod model;

pub use loader::{AppConfig, ConfigLoader, ProviderSettings, RotationMode};
pub use model::{
    ModelSpec, ProviderId, DEFAULT_MODEL, TITLE_GENERATION_PROMPT, UTILITY_MODEL,
};
