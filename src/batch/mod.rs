//! Batch jobs: the job model, the persistence seam, and the orchestrator.

/// Job snapshot and per-recipient results.
pub mod job;
/// Concurrent batch scheduling.
pub mod orchestrator;
/// Batch persistence collaborator.
pub mod store;
