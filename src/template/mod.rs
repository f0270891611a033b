//! Template scene graph, recipient records, and the template-store seam.

/// Color parsing for scene nodes.
pub mod color;
/// Template and recipient data model.
pub mod model;
/// Template store collaborator.
pub mod store;
