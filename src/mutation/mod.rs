//! Remote writes against the query cache.
//!
//! - `Mutation`: one write with optimistic updates and all-or-nothing rollback
//! - `BatchRunner`: many queued writes in bounded concurrent chunks

mod batch;
mod context;
mod pipeline;

pub use batch::{BatchItemError, BatchResult, BatchRunner, BatchSummary, DEFAULT_CONCURRENCY};
pub use context::MutationContext;
pub use pipeline::{Mutation, MutationFn, MutationStatus, OptimisticUpdate};
