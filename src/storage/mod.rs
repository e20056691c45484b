//! SQLite persistent storage.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **Database**: job rows and per-attempt stage records
//! - **Artifacts**: the [`ArtifactStore`] contract and its filesystem and in-memory stores
//! - **Migrations**: schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use brand_forge::storage::{Database, FsArtifactStore, JobFilter};
//! use std::sync::Arc;
//!
//! let db = Arc::new(Database::connect("sqlite://brand_forge.db").await?);
//! db.run_migrations().await?;
//!
//! let unfinished = db.list_jobs(&JobFilter::new().unfinished()).await?;
//! let store = FsArtifactStore::new("./artifacts", db.clone());
//! ```

pub mod artifacts;
pub mod database;
pub mod migrations;
pub mod schema;

pub use artifacts::{
    Artifact, ArtifactRef, ArtifactStore, FsArtifactStore, MemoryArtifactStore, StorageError,
};
pub use database::{Database, DatabaseError, JobFilter};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
