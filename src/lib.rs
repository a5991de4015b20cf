// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analyze;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod metrics;

pub use crate::api::router;
pub use crate::error::{IngestError, IngestResult};

use crate::db::Database;
use crate::ingest::registry::SourceRegistry;
use crate::ingest::repository::IngestRepository;

/// Repository (and its registry) over an already-initialized database.
pub fn repository(db: Database) -> IngestRepository {
    IngestRepository::new(db.clone(), SourceRegistry::new(db))
}
