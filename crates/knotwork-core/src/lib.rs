pub mod config;
pub mod context;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use context::{merge_params, ContextDelta, Params, SharedContext};
pub use error::{FlowError, Result};
pub use types::*;
