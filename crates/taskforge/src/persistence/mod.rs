//! Persistence layer
//!
//! This module provides:
//! - [`DocumentStore`] - versioned document store with optimistic concurrency
//! - [`InMemoryDocumentStore`] - in-process implementation for tests and demos
//! - [`TaskStore`] - task documents and the claim protocol on top of a store

mod memory;
mod store;
mod task_store;

pub use memory::InMemoryDocumentStore;
pub use store::{
    BulkItemResult, BulkUpdateItem, DocumentStore, Filter, SearchPage, SearchQuery, SortField,
    SortOrder, StoreError, Version, VersionedDocument,
};
pub use task_store::{
    BulkRemoveResult, ClaimOutcome, ClaimedTask, Completion, ScheduleRequest, TaskStore,
};
