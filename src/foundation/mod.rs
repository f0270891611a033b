/// Identifiers and small shared helpers.
pub mod core;
/// Error taxonomy.
pub mod error;
