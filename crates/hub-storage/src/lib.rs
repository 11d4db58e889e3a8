//! Persistence ports for the hub entity runtime
//!
//! The entity runtime never touches files directly. It consumes the narrow
//! async interfaces defined here:
//!
//! - [`Repository`] - get/list/create/update/delete for devices, definitions,
//!   installed apps, subscriptions and schedule jobs
//! - [`SourceStore`] - raw source text of drivers and apps by id
//! - [`EventStore`] - recent events for `eventsSince`
//!
//! In-memory implementations back the tests; JSON-file implementations built
//! on [`Storage`] back the server.

mod events;
mod repository;
mod sources;
mod storage;

pub use events::{EventStore, MemoryEventStore};
pub use repository::{JsonRepository, MemoryRepository, Record, Repository};
pub use sources::{DirSourceStore, MemorySourceStore, SourceStore};
pub use storage::{Storage, StorageError, StorageFile, StorageResult};
