//! Shared service plumbing for GridFlux services

pub mod logging;
pub mod shutdown;
pub mod sqlite;

pub use sqlite::SqliteClient;
