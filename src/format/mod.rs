//! Print format registry.

/// Name → page geometry lookup.
pub mod registry;
