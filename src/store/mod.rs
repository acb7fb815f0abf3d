//! Persistence layer: libSQL-backed job history and extraction results.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{JobStore, ResultSink};
