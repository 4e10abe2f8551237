//! The Marcus host process: tool surface semantics, HTTP front door,
//! background loops, and graceful shutdown.

pub mod api;
pub mod daemon;
pub mod shutdown;
pub mod tools;

pub use daemon::{Daemon, DaemonIntervals};
pub use shutdown::ShutdownSignal;
pub use tools::ToolRouter;
