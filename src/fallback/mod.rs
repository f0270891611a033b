//! Single-surface mode for constrained environments (one engine per invocation).

/// Session owning one lazily created surface.
pub mod single;
