//! Application-level wiring: the error taxonomy and the shared runtime
//! context handed to the orchestrator and the CLI commands.

mod context;
mod error;

pub use context::AppContext;
pub use error::{EstuaryError, Result};
