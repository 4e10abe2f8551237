//! Core domain types, configuration, error taxonomy, and persistence
//! backends for the Marcus coordination server.

pub mod config;
pub mod errors;
pub mod persist;
pub mod types;

pub use config::Config;
pub use errors::{ErrorKind, PersistError};
pub use persist::{collections, FileStore, Persistence, PersistenceExt, SqliteStore};
